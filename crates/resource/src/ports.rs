// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Daemon-wide allocator for migration listener ports.
//!
//! Every acquired port must be matched by either a successful cookie
//! publication (the peer learned the port) or an explicit release on the
//! error path.

use std::collections::HashSet;
use std::sync::Mutex;

use vmm_types::{Result, VmmError};

#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Inclusive range of ports to hand out.
    pub fn new(start: u16, end: u16) -> Self {
        PortAllocator {
            start,
            end,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn acquire(&self) -> Result<u16> {
        let mut used = self.used.lock().unwrap();
        for port in self.start..=self.end {
            if used.insert(port) {
                debug!(sl!(), "acquired port {}", port);
                return Ok(port);
            }
        }
        Err(VmmError::OperationFailed(format!(
            "no free port in migration range {}-{}",
            self.start, self.end
        )))
    }

    pub fn release(&self, port: u16) {
        if port == 0 {
            return;
        }
        let mut used = self.used.lock().unwrap();
        if !used.remove(&port) {
            warn!(sl!(), "releasing port {} that was not allocated", port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let alloc = PortAllocator::new(49152, 49154);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        let c = alloc.acquire().unwrap();
        assert_eq!((a, b, c), (49152, 49153, 49154));
        assert!(alloc.acquire().is_err());

        alloc.release(b);
        assert_eq!(alloc.acquire().unwrap(), 49153);
    }

    #[test]
    fn test_exhaustion_reports_operation_failed() {
        let alloc = PortAllocator::new(49152, 49152);
        alloc.acquire().unwrap();
        let err = alloc.acquire().unwrap_err();
        assert_eq!(err.code(), "operation-failed");
    }

    #[test]
    fn test_release_zero_is_noop() {
        let alloc = PortAllocator::new(1, 2);
        alloc.release(0);
        assert_eq!(alloc.acquire().unwrap(), 1);
    }
}
