//! Branch port allocation.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::debug;

use super::error::BranchError;
use crate::infrastructure::config::PortSettings;

/// Picks free ports from the configured range.
///
/// Ports handed out but not yet committed to the store stay reserved in
/// process, so concurrent creates in different projects never collide.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    probe_host: bool,
    reserved: Arc<Mutex<BTreeSet<u16>>>,
}

/// A port held for an operation until it is recorded or abandoned.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    reserved: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortReservation {
    /// The reserved port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
    }
}

impl PortAllocator {
    /// Creates an allocator over `settings.min..=settings.max`.
    #[must_use]
    pub fn new(settings: &PortSettings) -> Self {
        Self {
            min: settings.min,
            max: settings.max,
            probe_host: settings.probe_host,
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Whether `port` lies in the managed range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Reserves the lowest port not in `taken`, not reserved, and (when
    /// probing) not bound by another process.
    ///
    /// # Errors
    ///
    /// Returns [`BranchError::PortExhausted`] when the range is used up.
    pub fn reserve(&self, taken: &BTreeSet<u16>) -> Result<PortReservation, BranchError> {
        let mut reserved = self.reserved.lock();
        for port in self.min..=self.max {
            if taken.contains(&port) || reserved.contains(&port) {
                continue;
            }
            if self.probe_host && !host_port_free(port) {
                debug!(port, "Skipping port bound by another process");
                continue;
            }
            reserved.insert(port);
            return Ok(PortReservation {
                port,
                reserved: Arc::clone(&self.reserved),
            });
        }
        Err(BranchError::PortExhausted {
            min: self.min,
            max: self.max,
        })
    }
}

fn host_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
