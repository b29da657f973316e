/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Range header formatting and `Content-Range` parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::{invalid_input, Error};

/// `Range` request header value covering an inclusive, zero-based byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Range {
    start: u64,
    end: u64,
}

impl Range {
    /// Construct a range covering `start..=end`.
    pub(crate) fn bytes_inclusive(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// Parsed `Content-Range` response header.
///
/// Both the satisfied form `bytes START-END/TOTAL` and the unsatisfied form
/// `bytes */TOTAL` are accepted; the latter carries no range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub(crate) range: Option<(u64, u64)>,
    pub(crate) total: u64,
}

impl FromStr for ContentRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("bytes ")
            .ok_or_else(|| invalid_input(format!("unsupported Content-Range unit: {s}")))?;

        let (range_part, total_part) = rest
            .split_once('/')
            .ok_or_else(|| invalid_input(format!("malformed Content-Range: {s}")))?;

        let total: u64 = total_part
            .parse()
            .map_err(|_| invalid_input(format!("malformed Content-Range total: {s}")))?;

        let range = if range_part == "*" {
            None
        } else {
            let (start, end) = range_part
                .split_once('-')
                .ok_or_else(|| invalid_input(format!("malformed Content-Range span: {s}")))?;
            let start: u64 = start
                .parse()
                .map_err(|_| invalid_input(format!("malformed Content-Range start: {s}")))?;
            let end: u64 = end
                .parse()
                .map_err(|_| invalid_input(format!("malformed Content-Range end: {s}")))?;
            Some((start, end))
        };

        Ok(ContentRange { range, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_display() {
        assert_eq!(
            "bytes=0-8388607",
            Range::bytes_inclusive(0, 8 * 1024 * 1024 - 1).to_string()
        );
        assert_eq!("bytes=100-200", Range::bytes_inclusive(100, 200).to_string());
    }

    #[test]
    fn test_content_range_parse() {
        let cr: ContentRange = "bytes 0-499/700".parse().unwrap();
        assert_eq!(Some((0, 499)), cr.range);
        assert_eq!(700, cr.total);

        let cr: ContentRange = "bytes */0".parse().unwrap();
        assert_eq!(None, cr.range);
        assert_eq!(0, cr.total);
    }

    #[test]
    fn test_content_range_rejects_garbage() {
        assert!("700".parse::<ContentRange>().is_err());
        assert!("bytes 0-499".parse::<ContentRange>().is_err());
        assert!("items 0-499/700".parse::<ContentRange>().is_err());
    }
}
