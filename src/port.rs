//! Port Allocator (C1) — hands out TCP ports from a configured range.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::{self, Error};

/// Thread-safe allocator over an inclusive `[low, high]` port range.
///
/// Operations are O(range) in the worst case (a linear scan for the lowest
/// free port); the set itself starts empty on boot and is re-populated as
/// persisted instances are loaded.
pub struct PortAllocator {
    low: u16,
    high: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low,
            high,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Acquire the lowest unused port in the configured range.
    pub fn acquire(&self) -> Result<u16, Error> {
        let mut in_use = self.in_use.lock();
        for port in self.low..=self.high {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Ok(port);
            }
        }
        Err(error::no_ports(format!(
            "no free ports in range {}-{}",
            self.low, self.high
        )))
    }

    /// Acquire a caller-chosen port, failing if it's out of range or taken.
    pub fn acquire_specific(&self, port: u16) -> Result<(), Error> {
        if port < self.low || port > self.high {
            return Err(error::invalid_port(format!(
                "port {} is outside configured range {}-{}",
                port, self.low, self.high
            )));
        }
        let mut in_use = self.in_use.lock();
        if in_use.contains(&port) {
            return Err(error::port_in_use(format!("port {} is already in use", port)));
        }
        in_use.insert(port);
        Ok(())
    }

    /// Release a port back to the pool. Idempotent.
    pub fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.in_use.lock().contains(&port)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_lowest_free_port() {
        let alloc = PortAllocator::new(8000, 8002);
        assert_eq!(alloc.acquire().unwrap(), 8000);
        assert_eq!(alloc.acquire().unwrap(), 8001);
        assert_eq!(alloc.acquire().unwrap(), 8002);
        assert!(alloc.acquire().is_err());
    }

    #[test]
    fn release_is_idempotent_and_frees_the_port() {
        let alloc = PortAllocator::new(8000, 8000);
        let p = alloc.acquire().unwrap();
        alloc.release(p);
        alloc.release(p);
        assert_eq!(alloc.acquire().unwrap(), p);
    }

    #[test]
    fn acquire_specific_rejects_out_of_range_and_duplicate() {
        let alloc = PortAllocator::new(8000, 9000);
        assert!(alloc.acquire_specific(7999).is_err());
        assert!(alloc.acquire_specific(9001).is_err());
        alloc.acquire_specific(8500).unwrap();
        assert!(alloc.acquire_specific(8500).is_err());
    }

    #[test]
    fn no_ports_error_kind() {
        let alloc = PortAllocator::new(8000, 8000);
        alloc.acquire().unwrap();
        let err = alloc.acquire().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrNoPorts);
    }
}
