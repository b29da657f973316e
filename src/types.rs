/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::error::{Error, ErrorKind};

/// The target part size for splitting a transfer into ranged requests.
#[derive(Debug, Clone, Default)]
pub enum PartSize {
    /// Automatically configure an optimal target part size.
    #[default]
    Auto,

    /// Target part size explicitly given.
    ///
    /// NOTE: This is a suggestion and may be adjusted for an individual request
    /// as required by the underlying API (e.g. the 10,000 part limit for
    /// multipart uploads).
    Target(u64),
}

/// The network throughput the client should try to saturate.
#[derive(Debug, Clone)]
pub enum ThroughputTarget {
    /// Automatically size the endpoint pool for the execution environment.
    Auto,

    /// Explicit throughput target in gigabits per second.
    Gbps(f64),
}

impl Default for ThroughputTarget {
    fn default() -> Self {
        ThroughputTarget::Auto
    }
}

/// Progress of a meta request, reported as parts complete.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct TransferProgress {
    pub(crate) bytes_transferred: u64,
    pub(crate) total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Total bytes delivered or uploaded so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Total size of the transfer, once known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }
}

/// Terminal result of a meta request, handed to the finish callback exactly once.
#[derive(Debug)]
#[non_exhaustive]
pub struct MetaRequestResult {
    /// The first terminal error observed, if the meta request failed.
    pub error: Option<Error>,

    /// HTTP status of the response that produced `error`, when one was received.
    pub response_status: Option<http::StatusCode>,

    /// Per-request diagnostics recorded after the first terminal error.
    pub diagnostics: Vec<RequestDiagnostic>,
}

impl MetaRequestResult {
    pub(crate) fn success() -> Self {
        Self {
            error: None,
            response_status: None,
            diagnostics: Vec::new(),
        }
    }

    pub(crate) fn failure(error: Error, response_status: Option<http::StatusCode>) -> Self {
        Self {
            error: Some(error),
            response_status,
            diagnostics: Vec::new(),
        }
    }

    /// Whether the meta request completed without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Diagnostic record for a sub-request that failed after the meta request
/// already had a terminal error.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RequestDiagnostic {
    pub(crate) part_number: u32,
    pub(crate) kind: ErrorKind,
    pub(crate) response_status: Option<http::StatusCode>,
    pub(crate) message: String,
}

impl RequestDiagnostic {
    /// 1-based part number of the failed sub-request, or 0 for control requests.
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    /// Error category of the failure.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// HTTP status of the failed response, when one was received.
    pub fn response_status(&self) -> Option<http::StatusCode> {
        self.response_status
    }

    /// Human readable description of the failure.
    pub fn message(&self) -> &str {
        &self.message
    }
}
