/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::cmp;
use std::fmt;
use std::sync::Arc;

use crate::host::{DnsHostResolver, HostResolver};
use crate::http::Connect;
use crate::retry::{RetryStrategy, StandardRetryStrategy};
use crate::signing::{Sign, SigningConfig};
use crate::types::{PartSize, ThroughputTarget};
use crate::MEBIBYTE;

/// Minimum part size in bytes.
const MIN_PART_SIZE_BYTES: u64 = 5 * MEBIBYTE;

/// Default part size in bytes.
const DEFAULT_PART_SIZE_BYTES: u64 = 5 * MEBIBYTE;

/// Default upper bound on an adjusted part size in bytes.
const DEFAULT_MAX_PART_SIZE_BYTES: u64 = 20 * MEBIBYTE;

/// Default throughput target in gigabits per second.
const DEFAULT_THROUGHPUT_TARGET_GBPS: f64 = 10.0;

/// Callback observed once after the client and all of its asynchronously
/// torn-down resources are gone.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Configuration for a [`Client`](crate::client::Client)
pub struct Config {
    part_size: u64,
    max_part_size: u64,
    throughput_target_gbps: f64,
    tls: bool,
    signing: SigningConfig,
    signer: Arc<dyn Sign>,
    connect: Arc<dyn Connect>,
    host_resolver: Arc<dyn HostResolver>,
    retry_strategy: Arc<dyn RetryStrategy>,
    pub(crate) shutdown_callback: Option<ShutdownCallback>,
}

impl Config {
    /// Create a new `Config` builder
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Target part size in bytes for splitting transfers.
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Upper bound in bytes on a part size adjusted for the 10,000 part limit.
    pub fn max_part_size(&self) -> u64 {
        self.max_part_size
    }

    /// The network throughput target in gigabits per second.
    pub fn throughput_target_gbps(&self) -> f64 {
        self.throughput_target_gbps
    }

    /// Whether connections use TLS.
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// The signing configuration applied to every request.
    pub fn signing(&self) -> &SigningConfig {
        &self.signing
    }

    /// The signer requests are submitted to.
    pub fn signer(&self) -> &Arc<dyn Sign> {
        &self.signer
    }

    /// The per-VIP connection manager factory.
    pub fn connect(&self) -> &Arc<dyn Connect> {
        &self.connect
    }

    /// The host resolver used to discover endpoint addresses.
    pub fn host_resolver(&self) -> &Arc<dyn HostResolver> {
        &self.host_resolver
    }

    /// The retry strategy consulted for failed requests.
    pub fn retry_strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.retry_strategy
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("part_size", &self.part_size)
            .field("max_part_size", &self.max_part_size)
            .field("throughput_target_gbps", &self.throughput_target_gbps)
            .field("tls", &self.tls)
            .field("signing", &self.signing)
            .field(
                "shutdown_callback",
                &self.shutdown_callback.as_ref().map(|_| "<closure>"),
            )
            .finish_non_exhaustive()
    }
}

/// Fluent style builder for [Config]
#[derive(Default)]
pub struct Builder {
    part_size: PartSize,
    max_part_size: Option<u64>,
    throughput_target: ThroughputTarget,
    plaintext: bool,
    signing: Option<SigningConfig>,
    signer: Option<Arc<dyn Sign>>,
    connect: Option<Arc<dyn Connect>>,
    host_resolver: Option<Arc<dyn HostResolver>>,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    shutdown_callback: Option<ShutdownCallback>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("part_size", &self.part_size)
            .field("max_part_size", &self.max_part_size)
            .field("throughput_target", &self.throughput_target)
            .field("plaintext", &self.plaintext)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// The target size of each part when splitting a transfer into ranged
    /// requests.
    ///
    /// The minimum part size is 5 MiB; any explicit size less than that is
    /// rounded up. Default is [PartSize::Auto].
    pub fn part_size(mut self, part_size: PartSize) -> Self {
        let part_size = match part_size {
            PartSize::Target(explicit) => {
                PartSize::Target(cmp::max(explicit, MIN_PART_SIZE_BYTES))
            }
            auto => auto,
        };
        self.part_size = part_size;
        self
    }

    /// Upper bound on a part size adjusted upwards to respect the 10,000 part
    /// limit of a multipart upload.
    ///
    /// Raised to the configured part size when set smaller. Default is 20 MiB.
    pub fn max_part_size(mut self, max_part_size: u64) -> Self {
        self.max_part_size = Some(max_part_size);
        self
    }

    /// The network throughput to size the VIP pool for.
    ///
    /// Default is [ThroughputTarget::Auto].
    pub fn throughput_target(mut self, target: ThroughputTarget) -> Self {
        self.throughput_target = target;
        self
    }

    /// Use plaintext HTTP instead of TLS. Intended for tests and local
    /// endpoints.
    pub fn plaintext(mut self, plaintext: bool) -> Self {
        self.plaintext = plaintext;
        self
    }

    /// The signing configuration applied to every request. Required.
    pub fn signing(mut self, signing: SigningConfig) -> Self {
        self.signing = Some(signing);
        self
    }

    /// The signer requests are submitted to. Required.
    pub fn signer(mut self, signer: Arc<dyn Sign>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// The per-VIP connection manager factory. Required.
    pub fn connect(mut self, connect: Arc<dyn Connect>) -> Self {
        self.connect = Some(connect);
        self
    }

    /// The host resolver used to discover endpoint addresses.
    ///
    /// Default is a DNS-polling resolver.
    pub fn host_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = Some(resolver);
        self
    }

    /// The retry strategy consulted for failed requests.
    ///
    /// Default is [`StandardRetryStrategy`].
    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Observe client teardown. Invoked once, after the last meta request
    /// finish callback.
    pub fn on_shutdown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.shutdown_callback = Some(Box::new(f));
        self
    }

    /// Consumes the builder and constructs a [`Config`](crate::config::Config)
    pub fn build(self) -> Config {
        let part_size = match self.part_size {
            PartSize::Auto => DEFAULT_PART_SIZE_BYTES,
            PartSize::Target(explicit) => cmp::max(explicit, MIN_PART_SIZE_BYTES),
        };

        let max_part_size = cmp::max(
            self.max_part_size.unwrap_or(DEFAULT_MAX_PART_SIZE_BYTES),
            part_size,
        );

        let throughput_target_gbps = match self.throughput_target {
            ThroughputTarget::Auto => DEFAULT_THROUGHPUT_TARGET_GBPS,
            ThroughputTarget::Gbps(gbps) => gbps,
        };

        Config {
            part_size,
            max_part_size,
            throughput_target_gbps,
            tls: !self.plaintext,
            signing: self.signing.expect("signing config set"),
            signer: self.signer.expect("signer set"),
            connect: self.connect.expect("connect set"),
            host_resolver: self
                .host_resolver
                .unwrap_or_else(|| Arc::new(DnsHostResolver::default())),
            retry_strategy: self
                .retry_strategy
                .unwrap_or_else(|| Arc::new(StandardRetryStrategy::default())),
            shutdown_callback: self.shutdown_callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::Error;
    use crate::http::{ConnectionManager, HttpRequest};
    use crate::signing::{Credentials, ProvideCredentials};

    #[derive(Debug)]
    struct Stub;

    #[async_trait]
    impl ProvideCredentials for Stub {
        async fn provide_credentials(&self) -> Result<Credentials, Error> {
            unimplemented!("not used")
        }
    }

    #[async_trait]
    impl Sign for Stub {
        async fn sign(
            &self,
            _config: &SigningConfig,
            _request: &mut HttpRequest,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    impl Connect for Stub {
        fn connection_manager(
            &self,
            _addr: std::net::IpAddr,
            _endpoint: &crate::endpoint::Endpoint,
        ) -> Arc<dyn ConnectionManager> {
            unimplemented!("not used")
        }
    }

    fn base_builder() -> Builder {
        Config::builder()
            .signing(SigningConfig::new("us-west-2", Arc::new(Stub)))
            .signer(Arc::new(Stub))
            .connect(Arc::new(Stub))
    }

    #[test]
    fn test_part_size_rounds_up_to_minimum() {
        let config = base_builder()
            .part_size(PartSize::Target(1024))
            .build();
        assert_eq!(5 * MEBIBYTE, config.part_size());
    }

    #[test]
    fn test_max_part_size_raised_to_part_size() {
        let config = base_builder()
            .part_size(PartSize::Target(16 * MEBIBYTE))
            .max_part_size(8 * MEBIBYTE)
            .build();
        assert_eq!(16 * MEBIBYTE, config.max_part_size());
    }

    #[test]
    fn test_defaults() {
        let config = base_builder().build();
        assert_eq!(5 * MEBIBYTE, config.part_size());
        assert_eq!(20 * MEBIBYTE, config.max_part_size());
        assert!(config.tls());
        assert_eq!(10.0, config.throughput_target_gbps());
    }
}
