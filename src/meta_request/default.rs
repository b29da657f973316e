/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Default meta request: a single signed exchange of the caller's message.

use crate::http::HttpRequest;
use crate::request::{Request, RequestOutcome, RequestTag};

use super::{MetaRequestShared, NextRequest, PrepareContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    InFlight,
}

/// Passes the caller's HTTP message through verbatim on one connection,
/// subject to the same signing and retry pipeline as ranged transfers.
#[derive(Debug)]
pub(crate) struct Passthrough {
    template: HttpRequest,
    state: State,
    outstanding: u32,
    complete: bool,
}

impl Passthrough {
    pub(crate) fn new(template: HttpRequest) -> Self {
        Self {
            template,
            state: State::Pending,
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
            State::Pending => {
                self.state = State::InFlight;
                self.outstanding += 1;
                NextRequest::Ready(Request::new(
                    RequestTag::Passthrough,
                    1,
                    None,
                    self.template.clone(),
                    ctx.guard(),
                ))
            }
            State::InFlight => NextRequest::Waiting,
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
                shared.record_headers(response.status, response.headers);
                shared.set_total_bytes(response.body.len() as u64);
                shared.push_part(request.part_number, 0, response.body);
                shared.finish_success();
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
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Notify;

    use super::*;
    use crate::http::HttpResponse;
    use crate::meta_request::NextRequest;

    #[test]
    fn test_single_exchange() {
        let shared = MetaRequestShared::new(Arc::new(Notify::new()));
        let ctx = PrepareContext {
            pending_count: Arc::new(AtomicUsize::new(0)),
            work_notify: Arc::new(Notify::new()),
        };
        let mut meta = Passthrough::new(HttpRequest::new(http::Method::HEAD, "/my-key"));

        let request = match meta.next_request(&shared, &ctx) {
            NextRequest::Ready(req) => req,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(http::Method::HEAD, request.message.method);
        assert!(matches!(meta.next_request(&shared, &ctx), NextRequest::Waiting));

        let response = HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        meta.on_request_finished(&shared, request, Ok(response));
        assert!(meta.is_complete());
    }
}
