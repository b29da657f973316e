/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Host address resolution.
//!
//! The client listens for the set of IP addresses behind the bucket endpoint
//! and adopts new ones as VIPs up to its ideal pool size. Resolution is push
//! based: a [`HostResolver`] delivers added/removed address notifications for
//! as long as the returned channel is held.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;

/// A change in the set of addresses behind a host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Addresses newly observed for the host.
    Added(Vec<IpAddr>),
    /// Addresses that stopped resolving for the host.
    Removed(Vec<IpAddr>),
}

/// Push-based source of host address changes.
pub trait HostResolver: Send + Sync + std::fmt::Debug {
    /// Start listening for address changes of `host`.
    ///
    /// The first event carries the complete initial address set. Resolution
    /// stops when the receiver is dropped.
    fn listen(&self, host: &str, port: u16) -> mpsc::UnboundedReceiver<HostEvent>;
}

/// [`HostResolver`] that periodically re-resolves the host through the
/// system's DNS and diffs the answer against the previous one.
#[derive(Debug, Clone)]
pub struct DnsHostResolver {
    refresh_interval: Duration,
}

impl DnsHostResolver {
    /// Create a resolver that re-resolves every `refresh_interval`.
    pub fn new(refresh_interval: Duration) -> Self {
        Self { refresh_interval }
    }
}

impl Default for DnsHostResolver {
    fn default() -> Self {
        // S3 DNS answers rotate quickly; re-resolving often is how the pool
        // discovers new front-end addresses.
        Self::new(Duration::from_secs(5))
    }
}

impl HostResolver for DnsHostResolver {
    fn listen(&self, host: &str, port: u16) -> mpsc::UnboundedReceiver<HostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = host.to_string();
        let refresh_interval = self.refresh_interval;

        tokio::spawn(async move {
            let mut known: HashSet<IpAddr> = HashSet::new();

            loop {
                match tokio::net::lookup_host((host.as_str(), port)).await {
                    Ok(addrs) => {
                        let current: HashSet<IpAddr> = addrs.map(|sa| sa.ip()).collect();

                        let added: Vec<IpAddr> =
                            current.difference(&known).copied().collect();
                        let removed: Vec<IpAddr> =
                            known.difference(&current).copied().collect();

                        if !added.is_empty() && tx.send(HostEvent::Added(added)).is_err() {
                            return;
                        }
                        if !removed.is_empty() && tx.send(HostEvent::Removed(removed)).is_err() {
                            return;
                        }

                        known = current;
                    }
                    Err(err) => {
                        tracing::warn!(host = %host, error = %err, "host resolution failed");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(refresh_interval).await;
            }
        });

        rx
    }
}

/// [`HostResolver`] with a fixed address set, useful for tests and endpoints
/// fronted by known addresses.
#[derive(Debug, Clone)]
pub struct StaticHostResolver {
    addrs: Vec<IpAddr>,
}

impl StaticHostResolver {
    /// Create a resolver that reports exactly `addrs` for every host.
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }
}

impl HostResolver for StaticHostResolver {
    fn listen(&self, _host: &str, _port: u16) -> mpsc::UnboundedReceiver<HostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(HostEvent::Added(self.addrs.clone()));
        rx
    }
}
