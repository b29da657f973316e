/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Retry strategy contracts, failure classification, and the default
//! exponential-backoff strategy.
//!
//! Every sub-request holds a retry token for its lifetime. On a retryable
//! failure the token is asked to schedule a retry; the call resolves when the
//! backoff elapses, or errors once the token is exhausted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tower::retry::budget::{Budget, TpsBudget};

use crate::error::{Error, ErrorKind};
use crate::xml;

/// Classification of a retryable failure, used to pick backoff behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient transport or service failure.
    Transient,
    /// The service explicitly asked us to back off.
    Throttling,
}

/// Pluggable retry strategy.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Acquire a token scoped to `partition` (typically the endpoint host).
    ///
    /// Resolves once the strategy is willing to admit another request for the
    /// partition.
    async fn acquire_token(&self, partition: &str) -> Result<Box<dyn RetryToken>, Error>;
}

impl fmt::Debug for dyn RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryStrategy")
    }
}

/// Per-request retry state vended by a [`RetryStrategy`].
///
/// Dropping the token releases it back to the strategy.
#[async_trait]
pub trait RetryToken: Send {
    /// Schedule a retry for a failure of the given class.
    ///
    /// Resolves when the caller should re-attempt; errors when the token is
    /// exhausted and the request must fail with its last error.
    async fn schedule_retry(&mut self, class: RetryClass) -> Result<(), Error>;

    /// Record that the request ultimately succeeded.
    fn record_success(&mut self);
}

impl fmt::Debug for dyn RetryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryToken")
    }
}

/// How a finished attempt should be handled.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// Failure worth consulting the retry strategy about.
    Retryable(Error, RetryClass),
    /// Failure that terminates the request immediately.
    Terminal(Error),
}

/// Classify an HTTP response's status (and error body, when present).
pub(crate) fn classify_response(status: http::StatusCode, body: &[u8]) -> AttemptOutcome {
    if status.is_success() {
        return AttemptOutcome::Success;
    }

    let code = xml::top_level_tag_value(body, "Code")
        .ok()
        .flatten()
        .unwrap_or_default();
    let describe = |status: http::StatusCode, code: &str| {
        if code.is_empty() {
            format!("service responded with {status}")
        } else {
            format!("service responded with {status} ({code})")
        }
    };

    match status.as_u16() {
        429 => AttemptOutcome::Retryable(
            Error::new(ErrorKind::Throttling, describe(status, &code)),
            RetryClass::Throttling,
        ),
        503 if code == "SlowDown" => AttemptOutcome::Retryable(
            Error::new(ErrorKind::Throttling, describe(status, &code)),
            RetryClass::Throttling,
        ),
        408 => AttemptOutcome::Retryable(
            Error::new(ErrorKind::ServerTransient, describe(status, &code)),
            RetryClass::Transient,
        ),
        401 | 403 => {
            AttemptOutcome::Terminal(Error::new(ErrorKind::Auth, describe(status, &code)))
        }
        501 => AttemptOutcome::Terminal(Error::new(
            ErrorKind::ServerPermanent,
            describe(status, &code),
        )),
        500..=599 => AttemptOutcome::Retryable(
            Error::new(ErrorKind::ServerTransient, describe(status, &code)),
            RetryClass::Transient,
        ),
        _ => AttemptOutcome::Terminal(Error::new(
            ErrorKind::ServerPermanent,
            describe(status, &code),
        )),
    }
}

/// Classify an error raised before any response arrived.
///
/// `credentials_refreshable` widens auth failures into retryable territory.
pub(crate) fn classify_error(err: Error, credentials_refreshable: bool) -> AttemptOutcome {
    match err.kind() {
        ErrorKind::Transport => AttemptOutcome::Retryable(err, RetryClass::Transient),
        ErrorKind::Auth if credentials_refreshable => {
            AttemptOutcome::Retryable(err, RetryClass::Transient)
        }
        _ => AttemptOutcome::Terminal(err),
    }
}

/// The default retry strategy: exponential backoff with a client-wide retry
/// budget so that a flood of failures cannot multiply itself.
#[derive(Debug, Clone)]
pub struct StandardRetryStrategy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    budget: Arc<TpsBudget>,
}

impl StandardRetryStrategy {
    /// Create a strategy allowing up to `max_retries` retries per request.
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            budget: Arc::new(TpsBudget::default()),
        }
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(20))
    }
}

#[async_trait]
impl RetryStrategy for StandardRetryStrategy {
    async fn acquire_token(&self, _partition: &str) -> Result<Box<dyn RetryToken>, Error> {
        Ok(Box::new(StandardRetryToken {
            retries_used: 0,
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            budget: self.budget.clone(),
        }))
    }
}

#[derive(Debug)]
struct StandardRetryToken {
    retries_used: u32,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    budget: Arc<TpsBudget>,
}

#[async_trait]
impl RetryToken for StandardRetryToken {
    async fn schedule_retry(&mut self, class: RetryClass) -> Result<(), Error> {
        if self.retries_used >= self.max_retries {
            return Err(Error::new(
                ErrorKind::Internal,
                "retry attempts exhausted",
            ));
        }
        if !self.budget.withdraw() {
            return Err(Error::new(ErrorKind::Internal, "retry budget exhausted"));
        }

        // Throttling failures back off twice as hard from the start.
        let scale = match class {
            RetryClass::Transient => 1u32,
            RetryClass::Throttling => 2u32,
        };
        let exp = self.retries_used.min(16);
        let backoff = self
            .initial_backoff
            .saturating_mul(scale.saturating_mul(1u32 << exp))
            .min(self.max_backoff);

        self.retries_used += 1;
        tracing::debug!(
            backoff_ms = backoff.as_millis() as u64,
            retries_used = self.retries_used,
            ?class,
            "retry scheduled"
        );
        tokio::time::sleep(backoff).await;
        Ok(())
    }

    fn record_success(&mut self) {
        self.budget.deposit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert!(matches!(
            classify_response(http::StatusCode::OK, b""),
            AttemptOutcome::Success
        ));
        assert!(matches!(
            classify_response(http::StatusCode::PARTIAL_CONTENT, b""),
            AttemptOutcome::Success
        ));
    }

    #[test]
    fn test_classify_slow_down() {
        let body = br#"<Error><Code>SlowDown</Code></Error>"#;
        match classify_response(http::StatusCode::SERVICE_UNAVAILABLE, body) {
            AttemptOutcome::Retryable(err, RetryClass::Throttling) => {
                assert_eq!(&ErrorKind::Throttling, err.kind());
            }
            other => panic!("expected throttling classification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_plain_503_is_transient() {
        match classify_response(http::StatusCode::SERVICE_UNAVAILABLE, b"") {
            AttemptOutcome::Retryable(err, RetryClass::Transient) => {
                assert_eq!(&ErrorKind::ServerTransient, err.kind());
            }
            other => panic!("expected transient classification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_permanent() {
        assert!(matches!(
            classify_response(http::StatusCode::NOT_FOUND, b""),
            AttemptOutcome::Terminal(_)
        ));
        assert!(matches!(
            classify_response(http::StatusCode::NOT_IMPLEMENTED, b""),
            AttemptOutcome::Terminal(_)
        ));
    }

    #[test]
    fn test_auth_retryable_only_with_refreshable_credentials() {
        let err = Error::new(ErrorKind::Auth, "expired");
        assert!(matches!(
            classify_error(err, true),
            AttemptOutcome::Retryable(_, RetryClass::Transient)
        ));

        let err = Error::new(ErrorKind::Auth, "expired");
        assert!(matches!(
            classify_error(err, false),
            AttemptOutcome::Terminal(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_token_exhausts() {
        let strategy = StandardRetryStrategy::new(
            2,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let mut token = strategy.acquire_token("bucket.example").await.unwrap();

        token.schedule_retry(RetryClass::Transient).await.unwrap();
        token.schedule_retry(RetryClass::Transient).await.unwrap();
        assert!(token.schedule_retry(RetryClass::Transient).await.is_err());
    }
}
