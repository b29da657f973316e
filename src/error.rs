/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;

/// A boxed error that is `Send` and `Sync`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by this library
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: BoxError,
}

/// General categories of transfer errors.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Operation input validation issues
    InputInvalid,

    /// I/O errors reading a request body stream
    IoError,

    /// Connect, TLS, read/write, or abrupt close failures from the transport
    Transport,

    /// The service answered with a transient error (HTTP 5xx other than 501)
    ServerTransient,

    /// The service asked us to slow down (503 SlowDown, 429)
    Throttling,

    /// The service rejected the request permanently (4xx other than 408)
    ServerPermanent,

    /// Signing failed or the service rejected our credentials
    Auth,

    /// The meta request was cancelled by the user
    UserCancelled,

    /// The client shut down before the meta request completed
    ClientShutdown,

    /// Some kind of internal runtime issue (invariant violation, task failure,
    /// poisoned mutex, etc)
    Internal,
}

impl Error {
    /// Creates a new [`Error`] from a known kind of error as well as an
    /// arbitrary error source.
    pub fn new<E>(kind: ErrorKind, err: E) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            kind,
            source: err.into(),
        }
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::InputInvalid => write!(f, "invalid input"),
            ErrorKind::IoError => write!(f, "I/O error"),
            ErrorKind::Transport => write!(f, "transport error"),
            ErrorKind::ServerTransient => write!(f, "transient service error"),
            ErrorKind::Throttling => write!(f, "request throttled"),
            ErrorKind::ServerPermanent => write!(f, "service rejected request"),
            ErrorKind::Auth => write!(f, "authentication error"),
            ErrorKind::UserCancelled => write!(f, "meta request cancelled"),
            ErrorKind::ClientShutdown => write!(f, "client shut down"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, value)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::new(ErrorKind::Internal, value)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error
where
    T: Send + Sync + 'static,
{
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Self::new(ErrorKind::Internal, value)
    }
}

pub(crate) fn invalid_input<E>(err: E) -> Error
where
    E: Into<BoxError>,
{
    Error::new(ErrorKind::InputInvalid, err)
}

pub(crate) fn internal<E>(err: E) -> Error
where
    E: Into<BoxError>,
{
    Error::new(ErrorKind::Internal, err)
}

pub(crate) fn from_kind<E>(kind: ErrorKind) -> impl FnOnce(E) -> Error
where
    E: Into<BoxError>,
{
    |err| Error::new(kind, err)
}

static CANCELLATION_MESSAGE: &str = "the meta request was cancelled before it completed";

pub(crate) fn operation_cancelled() -> Error {
    Error::new(ErrorKind::UserCancelled, CANCELLATION_MESSAGE)
}

static SHUTDOWN_MESSAGE: &str = "the client shut down before the meta request completed";

pub(crate) fn client_shutdown() -> Error {
    Error::new(ErrorKind::ClientShutdown, SHUTDOWN_MESSAGE)
}
