/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The per-exchange request descriptor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::Error;
use crate::http::{HttpRequest, HttpResponse};

/// Which sub-request of its meta request a [`Request`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestTag {
    /// Ranged GET of one part (the first part doubles as the size probe).
    GetPart,
    /// The single exchange of a default meta request.
    Passthrough,
    /// `POST /key?uploads`
    CreateMultipartUpload,
    /// `PUT /key?partNumber=N&uploadId=U`
    UploadPart,
    /// `POST /key?uploadId=U`
    CompleteMultipartUpload,
    /// `DELETE /key?uploadId=U`
    AbortMultipartUpload,
}

/// One HTTP exchange prepared by a meta request.
///
/// The descriptor is immutable once prepared; per-attempt state (signing, the
/// retry token, attempt count) lives with the dispatch pipeline.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) tag: RequestTag,

    /// 1-based part number; 0 for control requests (create/complete/abort).
    pub(crate) part_number: u32,

    /// Object byte range this request covers, for ranged GET parts.
    pub(crate) part_range: Option<(u64, u64)>,

    /// Prepared, unsigned message. Cloned per attempt for signing.
    pub(crate) message: HttpRequest,

    /// Number of attempts dispatched so far.
    pub(crate) send_attempts: u32,

    /// Keeps the client's allocated-request accounting honest.
    _pending: PendingGuard,
}

impl Request {
    pub(crate) fn new(
        tag: RequestTag,
        part_number: u32,
        part_range: Option<(u64, u64)>,
        message: HttpRequest,
        pending: PendingGuard,
    ) -> Self {
        Self {
            tag,
            part_number,
            part_range,
            message,
            send_attempts: 0,
            _pending: pending,
        }
    }
}

/// Terminal failure of a request after retries were exhausted or skipped.
#[derive(Debug)]
pub(crate) struct FailedRequest {
    pub(crate) error: Error,
    pub(crate) response_status: Option<http::StatusCode>,
}

/// Terminal outcome of a request's dispatch pipeline.
pub(crate) type RequestOutcome = Result<HttpResponse, FailedRequest>;

/// RAII increment of the client's `pending_request_count`.
///
/// Held by a [`Request`] from preparation until destruction; the drop wakes
/// the work loop so backpressured meta requests can yield again.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    count: Arc<AtomicUsize>,
    work_notify: Arc<Notify>,
}

impl PendingGuard {
    pub(crate) fn new(count: Arc<AtomicUsize>, work_notify: Arc<Notify>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, work_notify }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.work_notify.notify_one();
    }
}
