/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! VIPs and their connection slots.
//!
//! A VIP is one resolved address of the service endpoint. The client adds
//! VIPs as the host listener reports new addresses, up to the pool size
//! derived from the throughput target, and allocates a fixed number of
//! connection slots on each. A slot carries scheduling state only; the live
//! channels belong to the VIP's connection manager.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::http::ConnectionManager;
use crate::MAX_REQUEST_COUNT_PER_CONNECTION;

/// One resolved endpoint address with its connection manager.
pub(crate) struct Vip {
    pub(crate) addr: IpAddr,
    pub(crate) manager: Arc<dyn ConnectionManager>,
    active: AtomicBool,
}

impl Vip {
    pub(crate) fn new(addr: IpAddr, manager: Arc<dyn ConnectionManager>) -> Self {
        Self {
            addr,
            manager,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the VIP removed. Its connection slots are destroyed as they come
    /// back to idle; the VIP itself tears down when the last slot drops it.
    pub(crate) fn set_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Vip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vip")
            .field("addr", &self.addr)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A reusable connection slot on one VIP.
#[derive(Debug)]
pub(crate) struct VipConnection {
    pub(crate) vip: Arc<Vip>,
    request_count: u32,
}

impl VipConnection {
    pub(crate) fn new(vip: Arc<Vip>) -> Self {
        Self {
            vip,
            request_count: 0,
        }
    }

    /// Record a served request. Returns to zero at the rotation soft cap so
    /// the manager's underlying channel does not serve unbounded requests.
    pub(crate) fn notify_request_finished(&mut self) {
        self.request_count += 1;
        if self.request_count >= MAX_REQUEST_COUNT_PER_CONNECTION {
            tracing::debug!(addr = %self.vip.addr, "rotating connection slot after request soft cap");
            self.request_count = 0;
        }
    }
}
