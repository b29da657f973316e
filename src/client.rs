/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The high throughput S3 client.
//!
//! Two independent reference counts govern teardown. The *external* count is
//! the user's [`Client`] clones; dropping the last one begins shutdown. The
//! *internal* count is every asynchronously torn-down resource (the work
//! loop, host listener, per-meta-request streaming tasks); the shutdown
//! callback fires only once both have drained, strictly after the last meta
//! request finish callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};

use crate::config::{Config, ShutdownCallback};
use crate::endpoint::Endpoint;
use crate::error::{self, invalid_input, Error, ErrorKind};
use crate::host::{HostEvent, HostResolver};
use crate::http::Connect;
use crate::io::parts::PartSplitter;
use crate::meta_request::{
    Machine, MetaRequest, MetaRequestHandle, MetaRequestKind, MetaRequestOptions,
    MetaRequestShared, Passthrough, PrepareContext, RangedGet, RangedPut,
};
use crate::retry::RetryStrategy;
use crate::signing::{CachedSigningConfig, Sign};
use crate::work_loop::{self, RequestCompletion};
use crate::{MAX_REQUESTS_MULTIPLIER, MAX_UPLOAD_PARTS, NUM_CONNECTIONS_PER_VIP};

/// High throughput client for Amazon Simple Storage Service.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) handle: Arc<Handle>,
    _external: Arc<ExternalGuard>,
}

impl Client {
    /// Creates a new client from a config.
    ///
    /// Must be called from within a tokio runtime; the client's work loop and
    /// streaming tasks are spawned onto it.
    pub fn new(mut config: Config) -> Result<Client, Error> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(error::from_kind(ErrorKind::Internal))?;

        let ideal_vip_count = ideal_vip_count(config.throughput_target_gbps());
        let max_requests_in_flight =
            ideal_vip_count * NUM_CONNECTIONS_PER_VIP * MAX_REQUESTS_MULTIPLIER;

        let shutdown_callback = config.shutdown_callback.take();
        let handle = Arc::new(Handle {
            part_size: config.part_size(),
            max_part_size: config.max_part_size(),
            ideal_vip_count,
            max_requests_in_flight,
            tls: config.tls(),
            signing: CachedSigningConfig::new(config.signing()),
            signer: config.signer().clone(),
            connect: config.connect().clone(),
            host_resolver: config.host_resolver().clone(),
            retry: config.retry_strategy().clone(),
            rt,
            work_notify: Arc::new(Notify::new()),
            pending_request_count: Arc::new(AtomicUsize::new(0)),
            shutdown_signal: watch::channel(false).0,
            synced: Mutex::new(SyncedData {
                active: true,
                endpoint: None,
                listener_started: false,
                pending_host_events: Vec::new(),
                pending_meta_requests: Vec::new(),
                pending_completions: Vec::new(),
            }),
            shutdown: Arc::new(ShutdownNotifier::new(shutdown_callback)),
            next_meta_request_id: AtomicU64::new(1),
        });

        tracing::debug!(
            ideal_vip_count,
            max_requests_in_flight,
            part_size = handle.part_size,
            "client created"
        );

        handle.rt.spawn(work_loop::run(handle.clone()));

        Ok(Client {
            _external: Arc::new(ExternalGuard {
                handle: handle.clone(),
            }),
            handle,
        })
    }

    /// Submit a meta request.
    ///
    /// Validates the definition, enqueues it for the work loop, and returns a
    /// handle that can cancel the transfer or await its result.
    pub fn make_meta_request(
        &self,
        options: MetaRequestOptions,
    ) -> Result<MetaRequestHandle, Error> {
        let host = match options.message.host() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(invalid_input("message must carry a Host header")),
        };

        let MetaRequestOptions {
            kind,
            message,
            body,
            callbacks,
        } = options;

        let ctx = PrepareContext {
            pending_count: self.handle.pending_request_count.clone(),
            work_notify: self.handle.work_notify.clone(),
        };

        let mut upload_total = None;
        let machine = match kind {
            MetaRequestKind::RangedGet => {
                if message.method != http::Method::GET {
                    return Err(invalid_input("ranged GET meta requests require a GET message"));
                }
                if callbacks.on_body.is_none() {
                    return Err(invalid_input(
                        "ranged GET meta requests require a body receiver",
                    ));
                }
                Machine::Get(RangedGet::new(message, self.handle.part_size))
            }
            MetaRequestKind::RangedPut => {
                if message.method != http::Method::PUT {
                    return Err(invalid_input("ranged PUT meta requests require a PUT message"));
                }
                let body = body.ok_or_else(|| {
                    invalid_input("ranged PUT meta requests require a body stream")
                })?;
                let content_length = body.content_length();
                if content_length == 0 {
                    return Err(invalid_input(
                        "upload body must not be empty; use a default meta request for empty objects",
                    ));
                }

                let part_size = upload_part_size(
                    content_length,
                    self.handle.part_size,
                    self.handle.max_part_size,
                )?;
                let num_parts = content_length.div_ceil(part_size) as u32;
                upload_total = Some(content_length);

                let splitter =
                    PartSplitter::new(body, part_size.try_into().expect("valid part size"));

                Machine::Put(RangedPut::new(
                    message,
                    splitter,
                    num_parts,
                    &self.handle.rt,
                    self.handle.work_notify.clone(),
                ))
            }
            MetaRequestKind::Default => Machine::Default(Passthrough::new(message)),
        };

        let shared = Arc::new(MetaRequestShared::new(self.handle.work_notify.clone()));
        // Upload progress totals are known up front; downloads learn theirs
        // from the size probe.
        if let Some(total) = upload_total {
            shared.set_total_bytes(total);
        }

        let id = self
            .handle
            .next_meta_request_id
            .fetch_add(1, Ordering::SeqCst);
        let meta_request = MetaRequest::new(id, shared.clone(), ctx, machine);
        let user_handle = MetaRequestHandle::new(shared.clone());

        {
            let mut synced = self.handle.synced.lock().expect("client state lock valid");
            if !synced.active {
                return Err(error::client_shutdown());
            }

            if !synced.listener_started {
                let endpoint = Endpoint::new(host, self.handle.tls);
                start_host_listener(&self.handle, endpoint.clone());
                synced.endpoint = Some(endpoint);
                synced.listener_started = true;
            }

            synced.pending_meta_requests.push(meta_request);
        }

        self.handle.rt.spawn(crate::meta_request::stream_bodies(
            shared,
            callbacks,
            self.handle.shutdown.clone(),
        ));
        self.handle.work_notify.notify_one();

        Ok(user_handle)
    }
}

fn ideal_vip_count(throughput_target_gbps: f64) -> usize {
    let ideal = (throughput_target_gbps / crate::THROUGHPUT_PER_VIP_GBPS).ceil() as usize;
    ideal.max(1)
}

/// Part size for an upload, raised as needed to respect the part count limit.
fn upload_part_size(content_length: u64, part_size: u64, max_part_size: u64) -> Result<u64, Error> {
    let min_for_count = content_length.div_ceil(MAX_UPLOAD_PARTS);
    let part_size = part_size.max(min_for_count);
    if part_size > max_part_size {
        return Err(invalid_input(format!(
            "a {content_length} byte upload requires parts of {part_size} bytes, over the {max_part_size} byte limit"
        )));
    }
    Ok(part_size)
}

fn start_host_listener(handle: &Arc<Handle>, endpoint: Endpoint) {
    let rt = handle.rt.clone();
    let handle = handle.clone();

    rt.spawn(async move {
        let mut shutdown = handle.shutdown_signal.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        let mut events = handle
            .host_resolver
            .listen(endpoint.host(), endpoint.port());

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        {
                            let mut synced =
                                handle.synced.lock().expect("client state lock valid");
                            if !synced.active {
                                return;
                            }
                            synced.pending_host_events.push(event);
                        }
                        handle.work_notify.notify_one();
                    }
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    });
}

/// Everything the work loop and in-flight tasks need, shared by `Arc`.
#[derive(Debug)]
pub(crate) struct Handle {
    pub(crate) part_size: u64,
    pub(crate) max_part_size: u64,
    pub(crate) ideal_vip_count: usize,
    pub(crate) max_requests_in_flight: usize,
    pub(crate) tls: bool,
    pub(crate) signing: CachedSigningConfig,
    pub(crate) signer: Arc<dyn Sign>,
    pub(crate) connect: Arc<dyn Connect>,
    pub(crate) host_resolver: Arc<dyn HostResolver>,
    pub(crate) retry: Arc<dyn RetryStrategy>,
    pub(crate) rt: tokio::runtime::Handle,
    pub(crate) work_notify: Arc<Notify>,
    pub(crate) pending_request_count: Arc<AtomicUsize>,
    pub(crate) shutdown_signal: watch::Sender<bool>,
    pub(crate) synced: Mutex<SyncedData>,
    pub(crate) shutdown: Arc<ShutdownNotifier>,
    next_meta_request_id: AtomicU64,
}

impl Handle {
    /// Begin teardown: stop accepting work and wake the work loop so it can
    /// cancel what remains.
    pub(crate) fn begin_shutdown(&self) {
        {
            let mut synced = self.synced.lock().expect("client state lock valid");
            if !synced.active {
                return;
            }
            synced.active = false;
        }
        tracing::debug!("client shutdown initiated");
        let _ = self.shutdown_signal.send(true);
        self.work_notify.notify_one();
    }
}

/// State guarded by the client lock. The work loop drains the pending lists
/// into its own thread-local state; nothing here is touched by in-flight
/// request tasks beyond pushing completions.
#[derive(Debug)]
pub(crate) struct SyncedData {
    pub(crate) active: bool,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) listener_started: bool,
    pub(crate) pending_host_events: Vec<HostEvent>,
    pub(crate) pending_meta_requests: Vec<MetaRequest>,
    pub(crate) pending_completions: Vec<RequestCompletion>,
}

struct ExternalGuard {
    handle: Arc<Handle>,
}

impl Drop for ExternalGuard {
    fn drop(&mut self) {
        self.handle.begin_shutdown();
    }
}

impl fmt::Debug for ExternalGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalGuard")
    }
}

/// Fires the user's shutdown callback when the last internal owner drops it.
pub(crate) struct ShutdownNotifier {
    callback: Mutex<Option<ShutdownCallback>>,
}

impl ShutdownNotifier {
    pub(crate) fn new(callback: Option<ShutdownCallback>) -> Self {
        Self {
            callback: Mutex::new(callback),
        }
    }

    #[cfg(test)]
    pub(crate) fn noop() -> Arc<Self> {
        Arc::new(Self::new(None))
    }
}

impl Drop for ShutdownNotifier {
    fn drop(&mut self) {
        let callback = self
            .callback
            .lock()
            .map(|mut cb| cb.take())
            .unwrap_or(None);
        if let Some(callback) = callback {
            tracing::debug!("client torn down, invoking shutdown callback");
            callback();
        }
    }
}

impl fmt::Debug for ShutdownNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownNotifier")
    }
}
