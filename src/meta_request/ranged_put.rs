/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Auto-ranged PUT: CreateMultipartUpload, a fan-out of UploadPart requests
//! fed by a strictly sequential body reader, then Complete (or best-effort
//! Abort on failure/cancellation).

use std::sync::Arc;

use http::header::{CONTENT_LENGTH, ETAG};
use http::HeaderValue;
use tokio::sync::{mpsc, Notify};

use crate::error::{internal, Error};
use crate::http::{copy_http_headers, HttpRequest};
use crate::io::parts::{PartData, PartSplitter};
use crate::request::{Request, RequestOutcome, RequestTag};
use crate::xml;

use super::{MetaRequestShared, NextRequest, PrepareContext};

/// Parts buffered ahead of dispatch. Bounds memory held for parts that have
/// been read but not yet handed to a connection.
const PART_READ_AHEAD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    CreatePending,
    CreateInFlight,
    Uploading,
    CompleteInFlight,
    AbortInFlight,
}

#[derive(Debug)]
pub(crate) struct RangedPut {
    template: HttpRequest,
    num_parts: u32,
    state: State,
    upload_id: Option<String>,
    etags: Vec<Option<String>>,
    parts_completed: u32,
    outstanding: u32,
    part_rx: mpsc::Receiver<Result<PartData, Error>>,
    cleanup_allowed: bool,
    abort_issued: bool,
    complete_succeeded: bool,
    complete: bool,
}

impl RangedPut {
    pub(crate) fn new(
        template: HttpRequest,
        splitter: PartSplitter,
        num_parts: u32,
        rt: &tokio::runtime::Handle,
        work_notify: Arc<Notify>,
    ) -> Self {
        let (tx, part_rx) = mpsc::channel(PART_READ_AHEAD);
        rt.spawn(read_body(splitter, tx, work_notify));

        Self {
            template,
            num_parts,
            state: State::CreatePending,
            upload_id: None,
            etags: vec![None; num_parts as usize],
            parts_completed: 0,
            outstanding: 0,
            part_rx,
            cleanup_allowed: true,
            abort_issued: false,
            complete_succeeded: false,
            complete: false,
        }
    }

    pub(crate) fn set_cleanup_allowed(&mut self, allowed: bool) {
        self.cleanup_allowed = allowed;
    }

    pub(crate) fn next_request(
        &mut self,
        shared: &MetaRequestShared,
        ctx: &PrepareContext,
    ) -> NextRequest {
        if self.complete {
            return NextRequest::Finished;
        }

        if shared.is_finishing() {
            return self.next_cleanup_request(shared, ctx);
        }

        match self.state {
            State::CreatePending => {
                self.state = State::CreateInFlight;
                self.outstanding += 1;
                NextRequest::Ready(self.create_request(ctx))
            }
            State::CreateInFlight | State::CompleteInFlight | State::AbortInFlight => {
                NextRequest::Waiting
            }
            State::Uploading => match self.part_rx.try_recv() {
                Ok(Ok(part)) => {
                    self.outstanding += 1;
                    NextRequest::Ready(self.upload_part_request(part, ctx))
                }
                Ok(Err(err)) => {
                    shared.finish_error(0, err, None);
                    NextRequest::Waiting
                }
                Err(mpsc::error::TryRecvError::Empty) => NextRequest::Waiting,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if self.parts_completed == self.num_parts && self.outstanding == 0 {
                        match self.complete_request(ctx) {
                            Ok(request) => {
                                self.state = State::CompleteInFlight;
                                self.outstanding += 1;
                                NextRequest::Ready(request)
                            }
                            Err(err) => {
                                shared.finish_error(0, err, None);
                                NextRequest::Waiting
                            }
                        }
                    } else {
                        NextRequest::Waiting
                    }
                }
            },
        }
    }

    /// After a failure or cancellation: wait for in-flight parts, then issue
    /// at most one best-effort abort if the upload was actually started.
    fn next_cleanup_request(
        &mut self,
        shared: &MetaRequestShared,
        ctx: &PrepareContext,
    ) -> NextRequest {
        if self.outstanding > 0 {
            return NextRequest::Waiting;
        }
        if self.should_abort() {
            self.abort_issued = true;
            self.state = State::AbortInFlight;
            self.outstanding += 1;
            return NextRequest::Ready(self.abort_request(ctx));
        }
        self.try_complete(shared);
        if self.complete {
            NextRequest::Finished
        } else {
            NextRequest::Waiting
        }
    }

    pub(crate) fn on_request_finished(
        &mut self,
        shared: &MetaRequestShared,
        request: Request,
        outcome: RequestOutcome,
    ) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;

        match request.tag {
            RequestTag::CreateMultipartUpload => match outcome {
                Ok(response) => match xml::top_level_tag_value(&response.body, "UploadId") {
                    Ok(Some(upload_id)) => {
                        tracing::debug!(upload_id = %upload_id, "multipart upload started");
                        self.upload_id = Some(upload_id);
                        self.state = State::Uploading;
                    }
                    Ok(None) | Err(_) => {
                        shared.finish_error(
                            0,
                            internal("CreateMultipartUpload response is missing UploadId"),
                            Some(response.status),
                        );
                    }
                },
                Err(failed) => {
                    shared.finish_error(0, failed.error, failed.response_status);
                }
            },
            RequestTag::UploadPart => match outcome {
                Ok(response) => {
                    let etag = response
                        .headers
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    match etag {
                        Some(etag) => {
                            // Parts complete out of order; slots recover it.
                            self.etags[request.part_number as usize - 1] = Some(etag);
                            self.parts_completed += 1;
                            shared.add_progress(request.message.body.len() as u64);
                        }
                        None => {
                            shared.finish_error(
                                request.part_number,
                                internal("UploadPart response is missing ETag"),
                                Some(response.status),
                            );
                        }
                    }
                }
                Err(failed) => {
                    shared.finish_error(request.part_number, failed.error, failed.response_status);
                }
            },
            RequestTag::CompleteMultipartUpload => match outcome {
                Ok(response) => {
                    self.complete_succeeded = true;
                    shared.record_headers(response.status, response.headers);
                    shared.finish_success();
                }
                Err(failed) => {
                    shared.finish_error(0, failed.error, failed.response_status);
                }
            },
            RequestTag::AbortMultipartUpload => {
                // The reported error stays the original failure; an abort
                // failure is only worth a diagnostic.
                if let Err(failed) = outcome {
                    shared.finish_error(0, failed.error, failed.response_status);
                }
            }
            RequestTag::GetPart | RequestTag::Passthrough => unreachable!("not an upload request"),
        }

        self.try_complete(shared);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    fn should_abort(&self) -> bool {
        self.cleanup_allowed
            && !self.abort_issued
            && !self.complete_succeeded
            && self.upload_id.is_some()
    }

    fn try_complete(&mut self, shared: &MetaRequestShared) {
        if self.complete || self.outstanding > 0 || !shared.is_finishing() {
            return;
        }
        if self.should_abort() {
            // The abort still needs to be dispatched.
            return;
        }
        self.complete = true;
        shared.mark_work_complete();
    }

    fn base_message(&self, method: http::Method, path_and_query: String) -> HttpRequest {
        let mut message = HttpRequest::new(method, path_and_query);
        copy_http_headers(&self.template.headers, &mut message.headers);
        message.headers.remove(CONTENT_LENGTH);
        message
    }

    fn create_request(&self, ctx: &PrepareContext) -> Request {
        let message = self.base_message(http::Method::POST, format!("{}?uploads", self.key_path()));
        Request::new(
            RequestTag::CreateMultipartUpload,
            0,
            None,
            message,
            ctx.guard(),
        )
    }

    fn upload_part_request(&self, part: PartData, ctx: &PrepareContext) -> Request {
        let upload_id = self.upload_id.as_deref().expect("upload id set before parts");
        let mut message = self.base_message(
            http::Method::PUT,
            format!(
                "{}?partNumber={}&uploadId={}",
                self.key_path(),
                part.part_number,
                upload_id
            ),
        );
        message.headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&part.data.len().to_string()).expect("length is valid ascii"),
        );
        message.body = part.data;

        Request::new(
            RequestTag::UploadPart,
            part.part_number,
            None,
            message,
            ctx.guard(),
        )
    }

    fn complete_request(&self, ctx: &PrepareContext) -> Result<Request, Error> {
        let upload_id = self
            .upload_id
            .as_deref()
            .ok_or_else(|| internal("complete requested without an upload id"))?;

        let etags: Vec<String> = self
            .etags
            .iter()
            .map(|etag| {
                etag.clone()
                    .ok_or_else(|| internal("complete requested with a missing part ETag"))
            })
            .collect::<Result<_, Error>>()?;
        let body = xml::complete_multipart_upload_body(&etags)?;

        let mut message = self.base_message(
            http::Method::POST,
            format!("{}?uploadId={}", self.key_path(), upload_id),
        );
        message.headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string()).expect("length is valid ascii"),
        );
        message.body = body.into();

        Ok(Request::new(
            RequestTag::CompleteMultipartUpload,
            0,
            None,
            message,
            ctx.guard(),
        ))
    }

    fn abort_request(&self, ctx: &PrepareContext) -> Request {
        let upload_id = self.upload_id.as_deref().expect("abort requires upload id");
        let message = self.base_message(
            http::Method::DELETE,
            format!("{}?uploadId={}", self.key_path(), upload_id),
        );
        Request::new(
            RequestTag::AbortMultipartUpload,
            0,
            None,
            message,
            ctx.guard(),
        )
    }

    fn key_path(&self) -> &str {
        self.template.path()
    }
}

/// Drain the body splitter into the dispatch channel.
///
/// A single task owns the splitter, so the input body is never read
/// concurrently with itself and parts are numbered in stream order. The work
/// loop is woken for every buffered part and once more when the stream ends,
/// since it polls the channel non-blockingly.
async fn read_body(
    mut splitter: PartSplitter,
    tx: mpsc::Sender<Result<PartData, Error>>,
    work_notify: Arc<Notify>,
) {
    loop {
        match splitter.next_part().await {
            Ok(Some(part)) => {
                if tx.send(Ok(part)).await.is_err() {
                    break;
                }
                work_notify.notify_one();
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                work_notify.notify_one();
                break;
            }
        }
    }
    drop(tx);
    work_notify.notify_one();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use tokio::sync::Notify;

    use super::*;
    use crate::error::ErrorKind;
    use crate::http::HttpResponse;
    use crate::io::InputStream;
    use crate::meta_request::NextRequest;
    use crate::request::FailedRequest;

    fn context() -> PrepareContext {
        PrepareContext {
            pending_count: Arc::new(AtomicUsize::new(0)),
            work_notify: Arc::new(Notify::new()),
        }
    }

    fn shared() -> MetaRequestShared {
        MetaRequestShared::new(Arc::new(Notify::new()))
    }

    fn new_put(body: &'static [u8], part_size: u64) -> RangedPut {
        let template = {
            let mut message = HttpRequest::new(http::Method::PUT, "/my-key");
            message.headers.insert(
                http::header::HOST,
                HeaderValue::from_static("bucket.s3.us-west-2.amazonaws.com"),
            );
            message
        };
        let splitter = PartSplitter::new(InputStream::from(body), part_size as usize);
        let num_parts = (body.len() as u64).div_ceil(part_size) as u32;
        RangedPut::new(
            template,
            splitter,
            num_parts,
            &tokio::runtime::Handle::current(),
            Arc::new(Notify::new()),
        )
    }

    fn create_response(upload_id: &str) -> HttpResponse {
        let body = format!(
            "<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key>\
             <UploadId>{upload_id}</UploadId></InitiateMultipartUploadResult>"
        );
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    fn etag_response(etag: &str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ETAG, HeaderValue::from_str(etag).unwrap());
        HttpResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::new(),
        }
    }

    fn ok_response() -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"<CompleteMultipartUploadResult/>"),
        }
    }

    async fn next_ready(
        put: &mut RangedPut,
        shared: &MetaRequestShared,
        ctx: &PrepareContext,
    ) -> Request {
        // The body reader task feeds a channel; give it a chance to run.
        for _ in 0..100 {
            match put.next_request(shared, ctx) {
                NextRequest::Ready(req) => return req,
                NextRequest::Waiting => tokio::task::yield_now().await,
                NextRequest::Finished => panic!("meta request finished unexpectedly"),
            }
        }
        panic!("no request became ready");
    }

    #[tokio::test]
    async fn test_create_upload_complete_flow() {
        let shared = shared();
        let ctx = context();
        // 10 bytes with 4 byte parts: 3 parts.
        let mut put = new_put(b"0123456789", 4);

        let create = next_ready(&mut put, &shared, &ctx).await;
        assert_eq!(RequestTag::CreateMultipartUpload, create.tag);
        assert_eq!("/my-key?uploads", create.message.path_and_query);
        put.on_request_finished(&shared, create, Ok(create_response("upload-1")));

        let part1 = next_ready(&mut put, &shared, &ctx).await;
        assert_eq!(RequestTag::UploadPart, part1.tag);
        assert_eq!("/my-key?partNumber=1&uploadId=upload-1", part1.message.path_and_query);
        assert_eq!(b"0123".as_slice(), &part1.message.body[..]);

        let part2 = next_ready(&mut put, &shared, &ctx).await;
        let part3 = next_ready(&mut put, &shared, &ctx).await;
        assert_eq!(b"89".as_slice(), &part3.message.body[..]);

        // Parts complete out of order; the ETag slots keep ascending order.
        put.on_request_finished(&shared, part3, Ok(etag_response("\"etag-3\"")));
        put.on_request_finished(&shared, part1, Ok(etag_response("\"etag-1\"")));
        put.on_request_finished(&shared, part2, Ok(etag_response("\"etag-2\"")));

        let complete = next_ready(&mut put, &shared, &ctx).await;
        assert_eq!(RequestTag::CompleteMultipartUpload, complete.tag);
        assert_eq!("/my-key?uploadId=upload-1", complete.message.path_and_query);
        let body = String::from_utf8(complete.message.body.to_vec()).unwrap();
        let etag1 = body.find("etag-1").unwrap();
        let etag2 = body.find("etag-2").unwrap();
        let etag3 = body.find("etag-3").unwrap();
        assert!(etag1 < etag2 && etag2 < etag3);

        put.on_request_finished(&shared, complete, Ok(ok_response()));
        assert!(put.is_complete());
    }

    #[tokio::test]
    async fn test_part_failure_aborts_with_original_error() {
        let shared = shared();
        let ctx = context();
        let mut put = new_put(b"0123456789", 4);

        let create = next_ready(&mut put, &shared, &ctx).await;
        put.on_request_finished(&shared, create, Ok(create_response("upload-2")));

        let part1 = next_ready(&mut put, &shared, &ctx).await;
        let part2 = next_ready(&mut put, &shared, &ctx).await;

        put.on_request_finished(&shared, part1, Ok(etag_response("\"etag-1\"")));
        put.on_request_finished(
            &shared,
            part2,
            Err(FailedRequest {
                error: Error::new(ErrorKind::ServerPermanent, "access denied"),
                response_status: Some(StatusCode::FORBIDDEN),
            }),
        );

        // Cleanup: exactly one abort with the stored upload id, no complete.
        let abort = next_ready(&mut put, &shared, &ctx).await;
        assert_eq!(RequestTag::AbortMultipartUpload, abort.tag);
        assert_eq!("/my-key?uploadId=upload-2", abort.message.path_and_query);

        put.on_request_finished(&shared, abort, Ok(ok_response()));
        assert!(put.is_complete());
        assert!(matches!(
            put.next_request(&shared, &ctx),
            NextRequest::Finished
        ));
    }

    #[tokio::test]
    async fn test_create_failure_skips_abort() {
        let shared = shared();
        let ctx = context();
        let mut put = new_put(b"0123456789", 4);

        let create = next_ready(&mut put, &shared, &ctx).await;
        put.on_request_finished(
            &shared,
            create,
            Err(FailedRequest {
                error: Error::new(ErrorKind::ServerPermanent, "bucket missing"),
                response_status: Some(StatusCode::NOT_FOUND),
            }),
        );

        // No upload id was ever issued, so there is nothing to abort.
        assert!(put.is_complete());
    }

    #[tokio::test]
    async fn test_shutdown_cancel_skips_abort() {
        let shared = shared();
        let ctx = context();
        let mut put = new_put(b"0123456789", 4);

        let create = next_ready(&mut put, &shared, &ctx).await;
        put.on_request_finished(&shared, create, Ok(create_response("upload-3")));

        shared.cancel_with(crate::error::client_shutdown());
        put.set_cleanup_allowed(false);

        assert!(matches!(
            put.next_request(&shared, &ctx),
            NextRequest::Finished
        ));
        assert!(put.is_complete());
    }
}
