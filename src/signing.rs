/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Signing contracts and the client's cached signing configuration.
//!
//! The client signs every sub-request it dispatches. The SigV4 math lives
//! behind the [`Sign`] trait; the client owns a deep copy of the caller's
//! signing configuration so that nothing in the signing path borrows user
//! memory with an unknown lifetime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::http::HttpRequest;

/// AWS credentials used to sign requests.
#[derive(Clone)]
pub struct Credentials {
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

/// Vends credentials for request signing.
#[async_trait]
pub trait ProvideCredentials: Send + Sync {
    /// Resolve the current credentials.
    async fn provide_credentials(&self) -> Result<Credentials, Error>;

    /// Whether expired credentials can be refreshed by asking again.
    ///
    /// Controls whether an authentication failure is worth retrying.
    fn is_refreshable(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn ProvideCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProvideCredentials")
    }
}

/// Signs prepared HTTP messages.
#[async_trait]
pub trait Sign: Send + Sync {
    /// Sign `request` in place using `config`.
    ///
    /// Failures must be reported as [`ErrorKind::Auth`](crate::error::ErrorKind::Auth).
    async fn sign(&self, config: &SigningConfig, request: &mut HttpRequest) -> Result<(), Error>;
}

impl fmt::Debug for dyn Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sign")
    }
}

/// Configuration handed to the signer for every request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SigningConfig {
    /// Signing region.
    pub region: String,

    /// Signing service name, `s3` unless overridden.
    pub service: String,

    /// Value for the signed body header (e.g. `x-amz-content-sha256`), when
    /// payload signing is in use. Empty means unsigned payload.
    pub signed_body_value: Option<String>,

    /// Whether to double URI-encode the path when deriving the canonical request.
    pub use_double_uri_encode: bool,

    /// Whether to normalize the URI path when deriving the canonical request.
    pub should_normalize_uri_path: bool,

    /// Whether the session token is omitted from the signature.
    pub omit_session_token: bool,

    /// Expiration used for presigned-style signatures, if any.
    pub expiration: Option<Duration>,

    /// Source of credentials.
    pub credentials_provider: Arc<dyn ProvideCredentials>,
}

impl SigningConfig {
    /// A default S3 signing configuration for `region`.
    pub fn new(region: impl Into<String>, provider: Arc<dyn ProvideCredentials>) -> Self {
        Self {
            region: region.into(),
            service: "s3".to_string(),
            signed_body_value: None,
            use_double_uri_encode: false,
            should_normalize_uri_path: false,
            omit_session_token: false,
            expiration: None,
            credentials_provider: provider,
        }
    }
}

/// The client's owned copy of the caller's signing configuration.
///
/// Constructed once at client creation and read-only afterwards. String fields
/// are copied out of the caller's config; an empty `signed_body_value` is
/// normalized away rather than carried as an empty signature override.
#[derive(Debug)]
pub(crate) struct CachedSigningConfig {
    config: SigningConfig,
}

impl CachedSigningConfig {
    pub(crate) fn new(source: &SigningConfig) -> Self {
        let signed_body_value = source
            .signed_body_value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let config = SigningConfig {
            region: source.region.clone(),
            service: source.service.clone(),
            signed_body_value,
            use_double_uri_encode: source.use_double_uri_encode,
            should_normalize_uri_path: source.should_normalize_uri_path,
            omit_session_token: source.omit_session_token,
            expiration: source.expiration,
            credentials_provider: source.credentials_provider.clone(),
        };

        Self { config }
    }

    pub(crate) fn config(&self) -> &SigningConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Debug)]
    struct StaticCredentials;

    #[async_trait]
    impl ProvideCredentials for StaticCredentials {
        async fn provide_credentials(&self) -> Result<Credentials, Error> {
            Ok(Credentials {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
                session_token: None,
            })
        }
    }

    fn config_with_body_value(value: Option<&str>) -> SigningConfig {
        let mut config = SigningConfig::new("us-west-2", Arc::new(StaticCredentials));
        config.signed_body_value = value.map(str::to_string);
        config
    }

    #[test]
    fn test_cached_config_copies_fields() {
        let cached = CachedSigningConfig::new(&config_with_body_value(Some("UNSIGNED-PAYLOAD")));
        assert_eq!("us-west-2", cached.config().region);
        assert_eq!("s3", cached.config().service);
        assert_eq!(
            Some("UNSIGNED-PAYLOAD"),
            cached.config().signed_body_value.as_deref()
        );
    }

    #[test]
    fn test_empty_signed_body_value_normalized() {
        // The copy is gated on the value's own length: an empty override is
        // dropped even though the service name is non-empty.
        let cached = CachedSigningConfig::new(&config_with_body_value(Some("")));
        assert_eq!(None, cached.config().signed_body_value);
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials {
            access_key_id: "AKID".into(),
            secret_access_key: "SECRET".into(),
            session_token: Some("TOKEN".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("SECRET"));
        assert!(!rendered.contains("TOKEN"));
    }
}
