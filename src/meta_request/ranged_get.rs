/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Auto-ranged GET: probe the object size with the first part request, then
//! fan the remaining parts out and deliver everything in order.

use std::str::FromStr;

use http::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http::HeaderValue;

use crate::error::{internal, Error, ErrorKind};
use crate::http::header::{ContentRange, Range};
use crate::http::{copy_http_headers, HttpRequest, HttpResponse};
use crate::request::{Request, RequestOutcome, RequestTag};

use super::{MetaRequestShared, NextRequest, PrepareContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The size probe (part 1) has not been sent yet.
    ProbePending,
    ProbeInFlight,
    /// Total size known; yielding parts 2..=total_num_parts.
    StreamingParts,
}

#[derive(Debug)]
pub(crate) struct RangedGet {
    template: HttpRequest,
    part_size: u64,
    state: State,
    object_size: u64,
    total_num_parts: u32,
    next_part_number: u32,
    num_parts_completed: u32,
    outstanding: u32,
    complete: bool,
}

impl RangedGet {
    pub(crate) fn new(template: HttpRequest, part_size: u64) -> Self {
        Self {
            template,
            part_size,
            state: State::ProbePending,
            object_size: 0,
            total_num_parts: 0,
            next_part_number: 1,
            num_parts_completed: 0,
            outstanding: 0,
            complete: false,
        }
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
            self.try_complete(shared);
            return if self.complete {
                NextRequest::Finished
            } else {
                NextRequest::Waiting
            };
        }

        match self.state {
            State::ProbePending => {
                self.state = State::ProbeInFlight;
                self.outstanding += 1;
                NextRequest::Ready(self.part_request(1, 0, self.part_size - 1, ctx))
            }
            State::ProbeInFlight => NextRequest::Waiting,
            State::StreamingParts => {
                if self.next_part_number <= self.total_num_parts {
                    let part_number = self.next_part_number;
                    self.next_part_number += 1;
                    self.outstanding += 1;

                    let start = u64::from(part_number - 1) * self.part_size;
                    let end = (start + self.part_size).min(self.object_size) - 1;
                    NextRequest::Ready(self.part_request(part_number, start, end, ctx))
                } else {
                    NextRequest::Waiting
                }
            }
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

        match outcome {
            Ok(response) => {
                if request.part_number == 1 && self.state == State::ProbeInFlight {
                    self.handle_probe(shared, response);
                } else if !shared.is_finishing() {
                    let offset = u64::from(request.part_number - 1) * self.part_size;
                    shared.push_part(request.part_number, offset, response.body);
                    self.num_parts_completed += 1;
                    if self.num_parts_completed == self.total_num_parts {
                        shared.finish_success();
                    }
                }
            }
            Err(failed) => {
                shared.finish_error(request.part_number, failed.error, failed.response_status);
            }
        }

        self.try_complete(shared);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    fn try_complete(&mut self, shared: &MetaRequestShared) {
        if self.complete || self.outstanding > 0 || !shared.is_finishing() {
            return;
        }
        self.complete = true;
        shared.mark_work_complete();
    }

    /// Learn the object size from the probe response and surface its headers.
    fn handle_probe(&mut self, shared: &MetaRequestShared, response: HttpResponse) {
        let total = match probe_total_size(&response) {
            Ok(total) => total,
            Err(err) => {
                shared.finish_error(1, err, Some(response.status));
                return;
            }
        };

        shared.record_headers(response.status, surfaced_headers(&response, total));
        shared.set_total_bytes(total);

        if total == 0 {
            shared.finish_success();
            return;
        }

        self.object_size = total;
        self.total_num_parts = total.div_ceil(self.part_size) as u32;
        self.num_parts_completed = 1;
        self.next_part_number = 2;
        self.state = State::StreamingParts;

        tracing::debug!(
            total_size = total,
            num_parts = self.total_num_parts,
            part_size = self.part_size,
            "object size discovered"
        );

        shared.push_part(1, 0, response.body);
        if self.total_num_parts == 1 {
            shared.finish_success();
        }
    }

    fn part_request(
        &self,
        part_number: u32,
        start: u64,
        end: u64,
        ctx: &PrepareContext,
    ) -> Request {
        let mut message = HttpRequest::new(
            self.template.method.clone(),
            self.template.path_and_query.clone(),
        );
        copy_http_headers(&self.template.headers, &mut message.headers);
        let range = Range::bytes_inclusive(start, end);
        message.headers.insert(
            RANGE,
            HeaderValue::from_str(&range.to_string()).expect("range header is valid ascii"),
        );

        Request::new(
            RequestTag::GetPart,
            part_number,
            Some((start, end)),
            message,
            ctx.guard(),
        )
    }
}

/// Total object size according to the probe response.
///
/// A 206 carries it in `Content-Range`; any other success means the service
/// returned the whole object and the body length is the size.
fn probe_total_size(response: &HttpResponse) -> Result<u64, Error> {
    if response.status != http::StatusCode::PARTIAL_CONTENT {
        return Ok(response.body.len() as u64);
    }

    let header = response
        .headers
        .get(CONTENT_RANGE)
        .ok_or_else(|| internal("206 response is missing Content-Range"))?;
    let header = header
        .to_str()
        .map_err(|_| internal("Content-Range is not valid ascii"))?;
    let content_range = ContentRange::from_str(header)
        .map_err(|err| Error::new(ErrorKind::Internal, err))?;
    Ok(content_range.total)
}

/// The headers surfaced for the whole transfer: the probe's headers with the
/// part-specific range framing replaced by the full object length.
fn surfaced_headers(response: &HttpResponse, total: u64) -> http::HeaderMap {
    let mut headers = http::HeaderMap::new();
    copy_http_headers(&response.headers, &mut headers);
    headers.remove(CONTENT_RANGE);
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&total.to_string()).expect("length is valid ascii"),
    );
    headers
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use tokio::sync::Notify;

    use super::*;
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

    fn template() -> HttpRequest {
        let mut message = HttpRequest::new(http::Method::GET, "/my-key");
        message.headers.insert(
            http::header::HOST,
            HeaderValue::from_static("bucket.s3.us-west-2.amazonaws.com"),
        );
        message
    }

    fn ranged_response(start: u64, end: u64, total: u64, body: Bytes) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
        );
        HttpResponse {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body,
        }
    }

    #[test]
    fn test_probe_then_parts() {
        let shared = shared();
        let ctx = context();
        let mut get = RangedGet::new(template(), 8);

        let probe = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected probe request, got {other:?}"),
        };
        assert_eq!(1, probe.part_number);
        assert_eq!(
            "bytes=0-7",
            probe.message.headers.get(http::header::RANGE).unwrap()
        );

        // Nothing more until the probe lands.
        assert!(matches!(get.next_request(&shared, &ctx), NextRequest::Waiting));

        // 17 byte object with 8 byte parts: 3 parts total.
        get.on_request_finished(
            &shared,
            probe,
            Ok(ranged_response(0, 7, 17, Bytes::from_static(b"01234567"))),
        );

        let part2 = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected part 2, got {other:?}"),
        };
        assert_eq!(2, part2.part_number);
        assert_eq!(Some((8, 15)), part2.part_range);

        let part3 = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected part 3, got {other:?}"),
        };
        assert_eq!(3, part3.part_number);
        assert_eq!(Some((16, 16)), part3.part_range);

        assert!(matches!(get.next_request(&shared, &ctx), NextRequest::Waiting));

        get.on_request_finished(
            &shared,
            part3,
            Ok(ranged_response(16, 16, 17, Bytes::from_static(b"6"))),
        );
        assert!(!get.is_complete());

        get.on_request_finished(
            &shared,
            part2,
            Ok(ranged_response(8, 15, 17, Bytes::from_static(b"89012345"))),
        );
        assert!(get.is_complete());
        assert!(matches!(get.next_request(&shared, &ctx), NextRequest::Finished));
    }

    #[test]
    fn test_zero_length_object() {
        let shared = shared();
        let ctx = context();
        let mut get = RangedGet::new(template(), 8);

        let probe = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected probe request, got {other:?}"),
        };

        let response = HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        get.on_request_finished(&shared, probe, Ok(response));

        assert!(get.is_complete());
    }

    #[test]
    fn test_full_200_probe_is_single_part() {
        let shared = shared();
        let ctx = context();
        let mut get = RangedGet::new(template(), 1024);

        let probe = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected probe request, got {other:?}"),
        };

        let response = HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"whole object"),
        };
        get.on_request_finished(&shared, probe, Ok(response));

        assert!(get.is_complete());
    }

    #[test]
    fn test_part_failure_finishes_with_error() {
        let shared = shared();
        let ctx = context();
        let mut get = RangedGet::new(template(), 4);

        let probe = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected probe request, got {other:?}"),
        };
        get.on_request_finished(
            &shared,
            probe,
            Ok(ranged_response(0, 3, 12, Bytes::from_static(b"0123"))),
        );

        let part2 = match get.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected part 2, got {other:?}"),
        };

        get.on_request_finished(
            &shared,
            part2,
            Err(FailedRequest {
                error: Error::new(ErrorKind::ServerPermanent, "no such key"),
                response_status: Some(StatusCode::NOT_FOUND),
            }),
        );

        // No new parts after a failure; part 3 never dispatches.
        assert!(matches!(
            get.next_request(&shared, &ctx),
            NextRequest::Finished
        ));
        assert!(get.is_complete());
    }
}
