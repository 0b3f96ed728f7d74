//! Internal port lease pool
//!
//! Every instance binds an internal port leased from a single process-global
//! pool. A port is held by at most one live instance at a time and is only
//! returned once that instance's process has been reaped, so a replacement
//! can never race the old process for the bind.

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Pool of internal ports in the half-open range `[from, to)`.
///
/// Shared across every app's reconciliation loop, so all lease bookkeeping
/// happens under one mutex. Leases live only as long as this process; there
/// is no persistence across supervisor restarts.
pub struct PortPool {
    from: u16,
    to: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(from: u16, to: u16) -> Self {
        Self {
            from,
            to,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease the lowest free port in range.
    pub fn allocate(&self) -> Result<u16, Error> {
        let mut leased = self.leased.lock();
        for port in self.from..self.to {
            if leased.insert(port) {
                debug!(port, "Leased internal port");
                return Ok(port);
            }
        }
        Err(Error::PortsExhausted)
    }

    /// Return a port to the free set.
    ///
    /// Callers guarantee single ownership through the instance lifecycle
    /// (release only after the process is reaped), so double release is not
    /// guarded against here.
    pub fn release(&self, port: u16) {
        self.leased.lock().remove(&port);
        debug!(port, "Released internal port");
    }

    /// Number of currently leased ports.
    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }
}
