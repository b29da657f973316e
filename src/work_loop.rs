/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The client work loop.
//!
//! A single task owns all scheduling state: the VIP pool, the idle connection
//! list, the live meta requests, and the in-flight counter. Everything else
//! communicates with it through the client's synced pending lists plus a
//! wakeup. Each pass drains the pending lists, pairs idle connections with
//! the next ready sub-request round-robin across meta requests, and hands the
//! bound pair to a dispatch task that runs acquire/sign/send/classify with
//! retries.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Instrument;

use crate::client::Handle;
use crate::endpoint::Endpoint;
use crate::error::{self, Error, ErrorKind};
use crate::host::HostEvent;
use crate::http::{HttpResponse, HttpRequest};
use crate::meta_request::{MetaRequest, NextRequest};
use crate::request::{FailedRequest, Request, RequestOutcome};
use crate::retry::{self, AttemptOutcome};
use crate::vip::{Vip, VipConnection};
use crate::NUM_CONNECTIONS_PER_VIP;

/// A finished dispatch, routed back to the work loop.
#[derive(Debug)]
pub(crate) struct RequestCompletion {
    pub(crate) meta_id: u64,
    pub(crate) request: Request,
    pub(crate) outcome: RequestOutcome,
    pub(crate) connection: VipConnection,
}

pub(crate) async fn run(handle: Arc<Handle>) {
    let mut vips: Vec<Arc<Vip>> = Vec::new();
    let mut idle_connections: VecDeque<VipConnection> = VecDeque::new();
    let mut meta_requests: Vec<MetaRequest> = Vec::new();
    let mut next_meta_request: usize = 0;
    let mut num_requests_in_flight: usize = 0;
    let mut endpoint: Option<Endpoint> = None;
    let mut shutdown_cancelled = false;

    loop {
        let notified = handle.work_notify.notified();

        let (active, synced_endpoint, host_events, new_metas, completions) = {
            let mut synced = handle.synced.lock().expect("client state lock valid");
            (
                synced.active,
                synced.endpoint.clone(),
                std::mem::take(&mut synced.pending_host_events),
                std::mem::take(&mut synced.pending_meta_requests),
                std::mem::take(&mut synced.pending_completions),
            )
        };
        if endpoint.is_none() {
            endpoint = synced_endpoint;
        }

        meta_requests.extend(new_metas);

        if active {
            process_host_events(
                &handle,
                host_events,
                endpoint.as_ref(),
                &mut vips,
                &mut idle_connections,
            );
        }

        for completion in completions {
            num_requests_in_flight -= 1;

            let mut connection = completion.connection;
            connection.notify_request_finished();
            if active && connection.vip.is_active() {
                idle_connections.push_back(connection);
            }

            match meta_requests
                .iter_mut()
                .find(|meta| meta.id == completion.meta_id)
            {
                Some(meta) => meta.on_request_finished(completion.request, completion.outcome),
                None => tracing::trace!(
                    meta_id = completion.meta_id,
                    "completion for a meta request no longer scheduled"
                ),
            }
        }

        if !active {
            if !shutdown_cancelled {
                shutdown_cancelled = true;
                for meta in &mut meta_requests {
                    meta.begin_cancel(error::client_shutdown(), false);
                }
            }
            idle_connections.clear();
            for vip in &vips {
                vip.set_inactive();
            }

            // Let cancelled machines observe drained in-flight work.
            meta_requests.retain_mut(|meta| {
                let _ = meta.next_request();
                !meta.is_complete()
            });

            if meta_requests.is_empty() && num_requests_in_flight == 0 {
                break;
            }
            notified.await;
            continue;
        }

        // Completions may have finished meta requests that the scheduling
        // scan below would otherwise never visit.
        sweep_complete(&mut meta_requests, &mut next_meta_request);

        while num_requests_in_flight < handle.max_requests_in_flight
            && handle.pending_request_count.load(Ordering::SeqCst) < handle.max_requests_in_flight
            && !meta_requests.is_empty()
        {
            // A connection slot on a live VIP.
            let connection = loop {
                match idle_connections.pop_front() {
                    None => break None,
                    Some(conn) if conn.vip.is_active() => break Some(conn),
                    Some(_) => {} // slot of a removed VIP is destroyed, not replaced
                }
            };
            let connection = match connection {
                Some(conn) => conn,
                None => break,
            };

            // Round-robin across meta requests for the next ready request.
            let mut ready = None;
            let mut scanned = 0;
            while scanned < meta_requests.len() {
                if next_meta_request >= meta_requests.len() {
                    next_meta_request = 0;
                }
                match meta_requests[next_meta_request].next_request() {
                    NextRequest::Ready(request) => {
                        let meta_id = meta_requests[next_meta_request].id;
                        next_meta_request += 1;
                        ready = Some((meta_id, request));
                        break;
                    }
                    NextRequest::Waiting => {
                        next_meta_request += 1;
                        scanned += 1;
                    }
                    NextRequest::Finished => {
                        meta_requests.remove(next_meta_request);
                        if meta_requests.is_empty() {
                            break;
                        }
                    }
                }
            }

            match ready {
                Some((meta_id, request)) => {
                    num_requests_in_flight += 1;
                    spawn_dispatch(&handle, meta_id, connection, request);
                }
                None => {
                    idle_connections.push_front(connection);
                    break;
                }
            }
        }

        notified.await;
    }

    tracing::debug!("work loop drained, exiting");
}

/// Adopt newly resolved addresses as VIPs up to the ideal pool size and
/// retire VIPs whose address went away.
fn process_host_events(
    handle: &Arc<Handle>,
    events: Vec<HostEvent>,
    endpoint: Option<&Endpoint>,
    vips: &mut Vec<Arc<Vip>>,
    idle_connections: &mut VecDeque<VipConnection>,
) {
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => return,
    };

    for event in events {
        match event {
            HostEvent::Added(addrs) => {
                for addr in addrs {
                    if vips.len() >= handle.ideal_vip_count {
                        break;
                    }
                    if vips.iter().any(|vip| vip.addr == addr) {
                        continue;
                    }

                    let manager = handle.connect.connection_manager(addr, endpoint);
                    let vip = Arc::new(Vip::new(addr, manager));
                    for _ in 0..NUM_CONNECTIONS_PER_VIP {
                        idle_connections.push_back(VipConnection::new(vip.clone()));
                    }
                    tracing::debug!(addr = %vip.addr, vip_count = vips.len() + 1, "vip added");
                    vips.push(vip);
                }
            }
            HostEvent::Removed(addrs) => {
                for addr in addrs {
                    if let Some(pos) = vips.iter().position(|vip| vip.addr == addr) {
                        let vip = vips.remove(pos);
                        vip.set_inactive();
                        tracing::debug!(addr = %vip.addr, "vip removed");
                    }
                }
                idle_connections.retain(|conn| conn.vip.is_active());
            }
        }
    }
}

fn sweep_complete(meta_requests: &mut Vec<MetaRequest>, next_meta_request: &mut usize) {
    meta_requests.retain(|meta| !meta.is_complete());
    if *next_meta_request >= meta_requests.len() {
        *next_meta_request = 0;
    }
}

fn spawn_dispatch(
    handle: &Arc<Handle>,
    meta_id: u64,
    connection: VipConnection,
    request: Request,
) {
    let span = tracing::debug_span!(
        "send-request",
        part_number = request.part_number,
        tag = ?request.tag,
        range = ?request.part_range,
        addr = %connection.vip.addr,
    );
    let task_handle = handle.clone();

    let task = async move {
        let handle = task_handle;
        let mut request = request;
        let outcome = dispatch_with_retries(&handle, &connection, &mut request).await;

        {
            let mut synced = handle.synced.lock().expect("client state lock valid");
            synced.pending_completions.push(RequestCompletion {
                meta_id,
                request,
                outcome,
                connection,
            });
        }
        handle.work_notify.notify_one();
    }
    .instrument(span);

    handle.rt.spawn(task);
}

/// Drive one request through acquire/sign/send/classify until it succeeds,
/// exhausts its retry token, or fails terminally.
async fn dispatch_with_retries(
    handle: &Handle,
    connection: &VipConnection,
    request: &mut Request,
) -> RequestOutcome {
    let refreshable = handle
        .signing
        .config()
        .credentials_provider
        .is_refreshable();
    let partition = request.message.host().unwrap_or_default().to_string();

    let mut token = match handle.retry.acquire_token(&partition).await {
        Ok(token) => token,
        Err(err) => {
            return Err(FailedRequest {
                error: err,
                response_status: None,
            })
        }
    };

    loop {
        request.send_attempts += 1;

        let attempt = attempt_once(handle, connection, &request.message).await;
        let (err, response_status, class) = match attempt {
            Ok(response) => match retry::classify_response(response.status, &response.body) {
                AttemptOutcome::Success => {
                    token.record_success();
                    return Ok(response);
                }
                AttemptOutcome::Retryable(err, class) => (err, Some(response.status), class),
                AttemptOutcome::Terminal(err) => {
                    return Err(FailedRequest {
                        error: err,
                        response_status: Some(response.status),
                    })
                }
            },
            Err(err) => match retry::classify_error(err, refreshable) {
                AttemptOutcome::Retryable(err, class) => (err, None, class),
                AttemptOutcome::Terminal(err) => {
                    return Err(FailedRequest {
                        error: err,
                        response_status: None,
                    })
                }
                AttemptOutcome::Success => unreachable!("errors never classify as success"),
            },
        };

        tracing::debug!(
            attempt = request.send_attempts,
            error = %err,
            ?class,
            "request attempt failed"
        );

        if token.schedule_retry(class).await.is_err() {
            return Err(FailedRequest {
                error: err,
                response_status,
            });
        }
    }
}

/// One attempt: acquire a channel from the VIP's manager, sign a fresh copy
/// of the message, send it, release the channel.
async fn attempt_once(
    handle: &Handle,
    connection: &VipConnection,
    message: &HttpRequest,
) -> Result<HttpResponse, Error> {
    let channel = connection
        .vip
        .manager
        .acquire()
        .await
        .map_err(|err| Error::new(ErrorKind::Transport, err))?;

    let mut message = message.clone();
    let signed = handle
        .signer
        .sign(handle.signing.config(), &mut message)
        .await;
    if let Err(err) = signed {
        connection.vip.manager.release(channel);
        return Err(Error::new(ErrorKind::Auth, err));
    }

    let result = channel.send(&message).await;
    connection.vip.manager.release(channel);
    result
}
