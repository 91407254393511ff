// Gitkit SSH Server - Connection Gate
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Hosts that currently hold a connection.
///
/// The lock is only held while the list is scanned or changed, never across
/// network or subprocess I/O.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    hosts: Mutex<Vec<IpAddr>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `host` unless it already holds a connection
    pub fn admit(&self, host: IpAddr) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if hosts.contains(&host) {
            return false;
        }
        hosts.push(host);
        true
    }

    /// Remove one entry for `host`
    pub fn release(&self, host: IpAddr) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = hosts.iter().position(|h| *h == host) {
            hosts.swap_remove(index);
        }
    }

    pub fn contains(&self, host: IpAddr) -> bool {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner).contains(&host)
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An admitted host; released exactly once, at the latest on drop
#[derive(Debug)]
pub struct HostLease {
    registry: Arc<ConnectionRegistry>,
    host: IpAddr,
    released: AtomicBool,
}

impl HostLease {
    /// Admit `host`, returning `None` when it already holds a connection
    pub fn acquire(registry: &Arc<ConnectionRegistry>, host: IpAddr) -> Option<Self> {
        registry.admit(host).then(|| Self {
            registry: Arc::clone(registry),
            host,
            released: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!("Releasing connection slot for {}", self.host);
            self.registry.release(self.host);
        }
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.release();
    }
}
