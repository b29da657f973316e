/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

/* Automatically managed default lints */
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
/* End of automatically managed default lints */
#![warn(
    missing_debug_implementations,
    missing_docs,
    rustdoc::missing_crate_level_docs,
    unreachable_pub,
    rust_2018_idioms
)]

//! An Amazon S3 client focused on maximizing throughput and network utilization.
//!
//! A single logical transfer (a *meta request*) is decomposed into fixed-size
//! part requests that are fanned out over many concurrent HTTP connections
//! across multiple resolved endpoint IP addresses (VIPs). The client owns the
//! scheduling, retry, signing, and ordered response streaming for every part;
//! the HTTP transport, SigV4 signer, DNS resolution, and credentials vending
//! are supplied by the caller behind traits.
//!
//! # Examples
//!
//! Download an object, receiving its body in order:
//!
//! ```no_run
//! # async fn example(config: s3_throughput_client::config::Config) -> Result<(), s3_throughput_client::error::Error> {
//! use s3_throughput_client::client::Client;
//! use s3_throughput_client::meta_request::MetaRequestOptions;
//!
//! let client = Client::new(config)?;
//!
//! let handle = client.make_meta_request(
//!     MetaRequestOptions::ranged_get("my-bucket.s3.us-west-2.amazonaws.com", "/my-key")
//!         .on_body(|offset, data| {
//!             println!("received {} bytes at offset {offset}", data.len());
//!             Ok(())
//!         }),
//! )?;
//!
//! let result = handle.join().await;
//! assert!(result.error.is_none());
//! # Ok(())
//! # }
//! ```

pub(crate) const MEBIBYTE: u64 = 1024 * 1024;

/// Modeled throughput of a single VIP, used to size the VIP pool.
pub(crate) const THROUGHPUT_PER_VIP_GBPS: f64 = 6.25;

/// Number of connection slots allocated per VIP.
pub(crate) const NUM_CONNECTIONS_PER_VIP: usize = 10;

/// Soft cap on requests served by one connection slot before its underlying
/// channel is rotated.
pub(crate) const MAX_REQUEST_COUNT_PER_CONNECTION: u32 = 100;

/// Multiplier applied to the total connection count to bound in-flight requests.
pub(crate) const MAX_REQUESTS_MULTIPLIER: usize = 4;

/// Maximum number of parts a single multipart upload supports.
pub(crate) const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Errors returned by `s3-throughput-client`
pub mod error;

/// Common types used by `s3-throughput-client`
pub mod types;

/// Client configuration
pub mod config;

/// HTTP message types and transport contracts
pub mod http;

/// Endpoint construction
pub mod endpoint;

/// Request signing contracts and the cached signing configuration
pub mod signing;

/// Host address resolution
pub mod host;

/// Retry strategy contracts and the default strategy
pub mod retry;

/// Types and helpers for I/O
pub mod io;

/// Meta requests: user-level transfers decomposed into part requests
pub mod meta_request;

/// High throughput S3 client
pub mod client;

pub(crate) mod request;
pub(crate) mod vip;
pub(crate) mod work_loop;
pub(crate) mod xml;

pub use self::client::Client;
pub use self::config::Config;
