/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Meta requests: user-level transfers decomposed into part requests.
//!
//! A meta request is one logical object operation. The work loop asks it for
//! prepared sub-requests and reports their outcomes; completed response
//! bodies are resequenced and delivered to the user in strict part order by a
//! dedicated streaming task, so a slow body callback never stalls scheduling.

mod default;
mod ranged_get;
mod ranged_put;

use std::cmp;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::{watch, Notify};

use crate::error::{self, BoxError, Error};
use crate::http::HttpRequest;
use crate::io::InputStream;
use crate::request::{PendingGuard, Request, RequestOutcome};
use crate::types::{MetaRequestResult, RequestDiagnostic, TransferProgress};

pub(crate) use self::default::Passthrough;
pub(crate) use self::ranged_get::RangedGet;
pub(crate) use self::ranged_put::RangedPut;

/// The flavor of a meta request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaRequestKind {
    /// Object download decomposed into ranged GETs.
    RangedGet,
    /// Object upload decomposed into a multipart upload.
    RangedPut,
    /// Single-shot passthrough of the caller's message.
    Default,
}

/// Headers callback: first response status and headers of the transfer.
pub type HeadersCallback = Box<dyn Fn(StatusCode, &HeaderMap) + Send>;

/// Body callback: object offset plus one contiguous slice of body data.
/// Returning an error rejects the body and cancels the meta request.
pub type BodyCallback = Box<dyn FnMut(u64, &Bytes) -> Result<(), BoxError> + Send>;

/// Progress callback.
pub type ProgressCallback = Box<dyn FnMut(TransferProgress) + Send>;

/// Finish callback, invoked exactly once.
pub type FinishCallback = Box<dyn FnOnce(&MetaRequestResult) + Send>;

#[derive(Default)]
pub(crate) struct MetaRequestCallbacks {
    pub(crate) on_headers: Option<HeadersCallback>,
    pub(crate) on_body: Option<BodyCallback>,
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_finish: Option<FinishCallback>,
}

impl fmt::Debug for MetaRequestCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaRequestCallbacks")
            .field("on_headers", &self.on_headers.as_ref().map(|_| "<closure>"))
            .field("on_body", &self.on_body.as_ref().map(|_| "<closure>"))
            .field("on_progress", &self.on_progress.as_ref().map(|_| "<closure>"))
            .field("on_finish", &self.on_finish.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Definition of a meta request handed to
/// [`Client::make_meta_request`](crate::client::Client::make_meta_request).
#[derive(Debug)]
pub struct MetaRequestOptions {
    pub(crate) kind: MetaRequestKind,
    pub(crate) message: HttpRequest,
    pub(crate) body: Option<InputStream>,
    pub(crate) callbacks: MetaRequestCallbacks,
}

impl MetaRequestOptions {
    /// Download the object at `key` from the bucket behind `host` as a series
    /// of ranged GETs.
    pub fn ranged_get(host: &str, key: &str) -> Self {
        Self {
            kind: MetaRequestKind::RangedGet,
            message: template_message(http::Method::GET, host, key),
            body: None,
            callbacks: MetaRequestCallbacks::default(),
        }
    }

    /// Upload `body` to `key` in the bucket behind `host` as a multipart
    /// upload.
    pub fn ranged_put(host: &str, key: &str, body: InputStream) -> Self {
        Self {
            kind: MetaRequestKind::RangedPut,
            message: template_message(http::Method::PUT, host, key),
            body: Some(body),
            callbacks: MetaRequestCallbacks::default(),
        }
    }

    /// Forward `message` verbatim as a single signed exchange.
    pub fn passthrough(message: HttpRequest) -> Self {
        Self {
            kind: MetaRequestKind::Default,
            message,
            body: None,
            callbacks: MetaRequestCallbacks::default(),
        }
    }

    /// Replace the HTTP message template.
    pub fn message(mut self, message: HttpRequest) -> Self {
        self.message = message;
        self
    }

    /// Set the headers callback.
    pub fn on_headers(mut self, f: impl Fn(StatusCode, &HeaderMap) + Send + 'static) -> Self {
        self.callbacks.on_headers = Some(Box::new(f));
        self
    }

    /// Set the body callback. Required for ranged GET meta requests.
    pub fn on_body(
        mut self,
        f: impl FnMut(u64, &Bytes) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        self.callbacks.on_body = Some(Box::new(f));
        self
    }

    /// Set the progress callback.
    pub fn on_progress(mut self, f: impl FnMut(TransferProgress) + Send + 'static) -> Self {
        self.callbacks.on_progress = Some(Box::new(f));
        self
    }

    /// Set the finish callback.
    pub fn on_finish(mut self, f: impl FnOnce(&MetaRequestResult) + Send + 'static) -> Self {
        self.callbacks.on_finish = Some(Box::new(f));
        self
    }
}

fn template_message(method: http::Method, host: &str, key: &str) -> HttpRequest {
    let path = if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    };
    let mut message = HttpRequest::new(method, path);
    if let Ok(value) = http::HeaderValue::from_str(host) {
        message.headers.insert(http::header::HOST, value);
    }
    message
}

/// What a meta request can currently offer the work loop.
#[derive(Debug)]
pub(crate) enum NextRequest {
    /// A prepared request, ready to bind to a connection.
    Ready(Request),
    /// Nothing to yield right now; poll again after the next completion.
    Waiting,
    /// All work done; the meta request can be removed from scheduling.
    Finished,
}

/// Clone-cheap handles machines need while preparing requests.
#[derive(Debug, Clone)]
pub(crate) struct PrepareContext {
    pub(crate) pending_count: Arc<AtomicUsize>,
    pub(crate) work_notify: Arc<Notify>,
}

impl PrepareContext {
    pub(crate) fn guard(&self) -> PendingGuard {
        PendingGuard::new(self.pending_count.clone(), self.work_notify.clone())
    }
}

/// A live meta request as seen by the work loop.
#[derive(Debug)]
pub(crate) struct MetaRequest {
    pub(crate) id: u64,
    pub(crate) shared: Arc<MetaRequestShared>,
    ctx: PrepareContext,
    machine: Machine,
}

#[derive(Debug)]
pub(crate) enum Machine {
    Get(RangedGet),
    Put(RangedPut),
    Default(Passthrough),
}

impl MetaRequest {
    pub(crate) fn new(
        id: u64,
        shared: Arc<MetaRequestShared>,
        ctx: PrepareContext,
        machine: Machine,
    ) -> Self {
        Self {
            id,
            shared,
            ctx,
            machine,
        }
    }

    /// Ask the meta request for its next prepared sub-request.
    ///
    /// Non-blocking; `Waiting` is idempotent.
    pub(crate) fn next_request(&mut self) -> NextRequest {
        match &mut self.machine {
            Machine::Get(m) => m.next_request(&self.shared, &self.ctx),
            Machine::Put(m) => m.next_request(&self.shared, &self.ctx),
            Machine::Default(m) => m.next_request(&self.shared, &self.ctx),
        }
    }

    /// Record a sub-request's terminal outcome.
    pub(crate) fn on_request_finished(&mut self, request: Request, outcome: RequestOutcome) {
        match &mut self.machine {
            Machine::Get(m) => m.on_request_finished(&self.shared, request, outcome),
            Machine::Put(m) => m.on_request_finished(&self.shared, request, outcome),
            Machine::Default(m) => m.on_request_finished(&self.shared, request, outcome),
        }
    }

    /// Cancel the meta request with `error`.
    ///
    /// In-flight sub-requests run to completion; `cleanup` controls whether
    /// protocol cleanup requests (abort of a started multipart upload) may
    /// still be dispatched.
    pub(crate) fn begin_cancel(&mut self, error: Error, cleanup: bool) {
        self.shared.cancel_with(error);
        if let Machine::Put(m) = &mut self.machine {
            m.set_cleanup_allowed(cleanup);
        }
    }

    /// Whether all sub-request work (including cleanup) has drained.
    pub(crate) fn is_complete(&self) -> bool {
        match &self.machine {
            Machine::Get(m) => m.is_complete(),
            Machine::Put(m) => m.is_complete(),
            Machine::Default(m) => m.is_complete(),
        }
    }
}

/// A completed part awaiting ordered delivery.
#[derive(Debug)]
struct StreamedPart {
    part_number: u32,
    offset: u64,
    data: Bytes,
}

impl Ord for StreamedPart {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.part_number.cmp(&other.part_number)
    }
}

impl PartialOrd for StreamedPart {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for StreamedPart {}
impl PartialEq for StreamedPart {
    fn eq(&self, other: &Self) -> bool {
        self.part_number == other.part_number
    }
}

#[derive(Debug)]
struct StreamState {
    /// Completed parts, min-keyed by part number.
    queue: BinaryHeap<cmp::Reverse<StreamedPart>>,
    /// Next part number expected by the delivery cursor.
    next_part_number: u32,
    headers: Option<(StatusCode, HeaderMap)>,
    progress_bytes: u64,
    total_bytes: Option<u64>,
    finish: Option<MetaRequestResult>,
    work_complete: bool,
    cancel_requested: bool,
    /// Result parked for `join()` after callbacks ran.
    result_slot: Option<MetaRequestResult>,
}

/// Meta request state shared between the work loop, the streaming task, and
/// the user's handle.
#[derive(Debug)]
pub(crate) struct MetaRequestShared {
    state: Mutex<StreamState>,
    streaming_notify: Notify,
    work_notify: Arc<Notify>,
    done: watch::Sender<bool>,
}

impl MetaRequestShared {
    pub(crate) fn new(work_notify: Arc<Notify>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(StreamState {
                queue: BinaryHeap::with_capacity(16),
                next_part_number: 1,
                headers: None,
                progress_bytes: 0,
                total_bytes: None,
                finish: None,
                work_complete: false,
                cancel_requested: false,
                result_slot: None,
            }),
            streaming_notify: Notify::new(),
            work_notify,
            done,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().expect("meta request state lock valid")
    }

    /// Queue a completed part body for in-order delivery.
    pub(crate) fn push_part(&self, part_number: u32, offset: u64, data: Bytes) {
        {
            let mut st = self.lock();
            st.queue.push(cmp::Reverse(StreamedPart {
                part_number,
                offset,
                data,
            }));
        }
        self.streaming_notify.notify_one();
    }

    /// Record the response headers to surface, first writer wins.
    pub(crate) fn record_headers(&self, status: StatusCode, headers: HeaderMap) {
        {
            let mut st = self.lock();
            if st.headers.is_none() && st.finish.is_none() {
                st.headers = Some((status, headers));
            }
        }
        self.streaming_notify.notify_one();
    }

    pub(crate) fn set_total_bytes(&self, total: u64) {
        self.lock().total_bytes = Some(total);
    }

    /// Add uploaded-byte progress (downloads progress as bodies deliver).
    pub(crate) fn add_progress(&self, bytes: u64) {
        self.lock().progress_bytes += bytes;
        self.streaming_notify.notify_one();
    }

    /// Record success, unless a failure was already recorded.
    pub(crate) fn finish_success(&self) {
        let mut st = self.lock();
        if st.finish.is_none() {
            st.finish = Some(MetaRequestResult::success());
        }
        drop(st);
        self.streaming_notify.notify_one();
    }

    /// Record a terminal failure. The first failure becomes the reported
    /// result; later failures are kept as diagnostics.
    pub(crate) fn finish_error(
        &self,
        part_number: u32,
        error: Error,
        response_status: Option<StatusCode>,
    ) {
        let mut st = self.lock();
        match &mut st.finish {
            None => st.finish = Some(MetaRequestResult::failure(error, response_status)),
            Some(result) => result.diagnostics.push(RequestDiagnostic {
                part_number,
                kind: error.kind().clone(),
                response_status,
                message: error.to_string(),
            }),
        }
        drop(st);
        self.streaming_notify.notify_one();
    }

    /// Cancellation entry point shared by the user handle, body rejection,
    /// and client shutdown.
    ///
    /// A recorded failure wins over the cancellation; a success that has not
    /// reached its finish callback yet does not (the wire work may complete
    /// before the user rejects a body mid-delivery).
    pub(crate) fn cancel_with(&self, error: Error) {
        {
            let mut st = self.lock();
            st.cancel_requested = true;
            let supersede = match &st.finish {
                None => true,
                Some(result) => result.error.is_none(),
            };
            if supersede {
                st.finish = Some(MetaRequestResult::failure(error, None));
            }
        }
        self.work_notify.notify_one();
        self.streaming_notify.notify_one();
    }

    pub(crate) fn is_finishing(&self) -> bool {
        let st = self.lock();
        st.cancel_requested || st.finish.is_some()
    }

    /// Signal that no further sub-request activity will occur; the streaming
    /// task may fire the finish callback once delivery drains.
    pub(crate) fn mark_work_complete(&self) {
        self.lock().work_complete = true;
        self.streaming_notify.notify_one();
    }

    pub(crate) fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(crate) fn take_result(&self) -> Option<MetaRequestResult> {
        self.lock().result_slot.take()
    }
}

/// Handle to an in-flight meta request.
#[derive(Debug)]
pub struct MetaRequestHandle {
    shared: Arc<MetaRequestShared>,
    done: watch::Receiver<bool>,
}

impl MetaRequestHandle {
    pub(crate) fn new(shared: Arc<MetaRequestShared>) -> Self {
        let done = shared.subscribe_done();
        Self { shared, done }
    }

    /// Cancel the meta request. In-flight part requests run to completion and
    /// their bodies are discarded; the finish callback reports cancellation.
    pub fn cancel(&self) {
        self.shared.cancel_with(error::operation_cancelled());
    }

    /// Wait for the meta request to finish and return its result.
    ///
    /// The finish callback (when set) observes the result first.
    pub async fn join(mut self) -> MetaRequestResult {
        loop {
            if *self.done.borrow_and_update() {
                break;
            }
            if self.done.changed().await.is_err() {
                break;
            }
        }
        self.shared.take_result().unwrap_or_else(|| {
            MetaRequestResult::failure(error::internal("meta request streaming task lost"), None)
        })
    }
}

/// Deliver completed bodies in strict part order and fire the terminal
/// callbacks. Runs as its own task so a slow user callback cannot stall the
/// work loop.
///
/// Holds an internal client reference until it returns, which is what orders
/// the client shutdown callback after every finish callback.
pub(crate) async fn stream_bodies(
    shared: Arc<MetaRequestShared>,
    mut callbacks: MetaRequestCallbacks,
    _shutdown: Arc<crate::client::ShutdownNotifier>,
) {
    let mut reported_progress = 0u64;

    loop {
        let headers;
        let mut deliveries: Vec<StreamedPart> = Vec::new();
        let mut finished = None;
        let mut progress = None;

        {
            let mut st = shared.lock();
            headers = st.headers.take();

            let failing = st
                .finish
                .as_ref()
                .map(|r| r.error.is_some())
                .unwrap_or(false);
            if failing {
                // No body callbacks after a failure is recorded.
                st.queue.clear();
            } else {
                while st
                    .queue
                    .peek()
                    .map(|part| part.0.part_number == st.next_part_number)
                    .unwrap_or(false)
                {
                    let part = st.queue.pop().expect("peeked entry present").0;
                    st.next_part_number += 1;
                    st.progress_bytes += part.data.len() as u64;
                    deliveries.push(part);
                }
            }

            if st.progress_bytes != reported_progress {
                reported_progress = st.progress_bytes;
                progress = Some(TransferProgress {
                    bytes_transferred: st.progress_bytes,
                    total_bytes: st.total_bytes,
                });
            }

            // The finish result is only taken on a pass with no deliveries:
            // a body callback in this pass may still reject and supersede a
            // success.
            if deliveries.is_empty()
                && st.finish.is_some()
                && st.work_complete
                && st.queue.is_empty()
            {
                finished = st.finish.take();
            }
        }

        if let Some((status, headers)) = headers {
            if let Some(cb) = callbacks.on_headers.as_ref() {
                cb(status, &headers);
            }
        }

        for part in &deliveries {
            if part.data.is_empty() {
                continue;
            }
            if let Some(cb) = callbacks.on_body.as_mut() {
                if let Err(err) = cb(part.offset, &part.data) {
                    tracing::debug!(
                        part_number = part.part_number,
                        "body rejected by receiver, cancelling meta request"
                    );
                    shared.cancel_with(Error::new(crate::error::ErrorKind::UserCancelled, err));
                    break;
                }
            }
        }

        if let Some(progress) = progress {
            if let Some(cb) = callbacks.on_progress.as_mut() {
                cb(progress);
            }
        }

        if let Some(result) = finished {
            if let Some(cb) = callbacks.on_finish.take() {
                cb(&result);
            }
            {
                let mut st = shared.lock();
                st.result_slot = Some(result);
            }
            let _ = shared.done.send(true);
            return;
        }

        if !deliveries.is_empty() {
            // A deferred finish (or a rejection's cancellation) may already
            // be pending; re-check before sleeping.
            continue;
        }

        shared.streaming_notify.notified().await;
    }
}
