/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! HTTP message types and the transport contracts consumed by the client.
//!
//! The client never opens sockets itself. Each VIP owns a connection manager
//! produced by the caller-supplied [`Connect`] implementation; the manager
//! hands out reusable channels and enforces its own per-VIP concurrency.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::endpoint::Endpoint;
use crate::error::Error;

pub(crate) mod header;

/// A prepared HTTP request message.
///
/// The URI carries only the path and query; the authority comes from the
/// `Host` header and the VIP the request is dispatched to.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Path and query portion of the request target, e.g. `/key?uploads`.
    pub path_and_query: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body. Empty for bodiless requests.
    pub body: Bytes,
}

impl HttpRequest {
    /// Create a new request with the given method and request target.
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// The `Host` header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
    }

    /// The path portion of the request target, without the query.
    pub(crate) fn path(&self) -> &str {
        match self.path_and_query.split_once('?') {
            Some((path, _)) => path,
            None => &self.path_and_query,
        }
    }
}

/// An HTTP response with its body fully collected.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Collected response body.
    pub body: Bytes,
}

/// A live HTTP channel to one VIP, produced by a [`ConnectionManager`].
#[async_trait]
pub trait HttpConnection: Send + Sync {
    /// Dispatch `request` and collect the full response.
    ///
    /// Transport-level failures (connect, TLS, read/write, abrupt close) must
    /// be reported as [`ErrorKind::Transport`](crate::error::ErrorKind::Transport).
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, Error>;
}

impl fmt::Debug for dyn HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HttpConnection")
    }
}

/// Pool of reusable HTTP channels targeting a single VIP address.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Acquire a live channel. Resolves once the manager's own concurrency
    /// limit permits another in-flight exchange.
    async fn acquire(&self) -> Result<Arc<dyn HttpConnection>, Error>;

    /// Return a channel to the pool.
    fn release(&self, connection: Arc<dyn HttpConnection>);
}

impl fmt::Debug for dyn ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionManager")
    }
}

/// Factory for per-VIP connection managers.
pub trait Connect: Send + Sync {
    /// Create a connection manager whose channels dial `addr` directly while
    /// speaking TLS/HTTP for `endpoint`.
    fn connection_manager(&self, addr: IpAddr, endpoint: &Endpoint) -> Arc<dyn ConnectionManager>;
}

impl fmt::Debug for dyn Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connect")
    }
}

/// Copy every header from `src` into `dst`.
///
/// Duplicate names are preserved: each occurrence in `src` is appended, so a
/// multi-valued header survives the copy losslessly.
pub(crate) fn copy_http_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        dst.append(name.clone(), value.clone());
    }
}
