/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The service endpoint a client resolves VIPs for.

use std::fmt;

/// A bucket's service endpoint: the host requests carry in their `Host` header
/// and the scheme/port connections are established with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    tls: bool,
}

impl Endpoint {
    /// Endpoint for a virtual-hosted bucket host, e.g.
    /// `my-bucket.s3.us-west-2.amazonaws.com`.
    pub fn new(host: impl Into<String>, tls: bool) -> Self {
        Self {
            host: host.into(),
            tls,
        }
    }

    /// Construct the regional endpoint host for `bucket`.
    pub fn for_bucket(bucket: &str, region: &str, tls: bool) -> Self {
        Self {
            host: format!("{bucket}.s3.{region}.amazonaws.com"),
            tls,
        }
    }

    /// Host name used for DNS resolution and the `Host` header.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether connections use TLS.
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Port connections are established on.
    pub fn port(&self) -> u16 {
        if self.tls {
            443
        } else {
            80
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;

    #[test]
    fn test_for_bucket() {
        let ep = Endpoint::for_bucket("my-bucket", "us-west-2", true);
        assert_eq!("my-bucket.s3.us-west-2.amazonaws.com", ep.host());
        assert_eq!(443, ep.port());
        assert_eq!("https://my-bucket.s3.us-west-2.amazonaws.com", ep.to_string());
    }

    #[test]
    fn test_plaintext_port() {
        let ep = Endpoint::new("localhost", false);
        assert_eq!(80, ep.port());
    }
}
