/**
 * alloc.rs
 *
 * Virtual tunnel address pool. Hands one address per established peer
 * out of a configured base network and takes it back on teardown.
 */

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::AllocatorConfig;

/// Address pool with interior mutability so release works from teardown
/// paths holding only a shared reference.
pub struct IpAllocator {
    pool: Mutex<Pool>,
}

struct Pool {
    network: Ipv4Addr,
    capacity: u16,
    /// Next never-used host offset; offset 0 is the network address and
    /// is skipped.
    next: u16,
    freed: Vec<Ipv4Addr>,
    leased: HashSet<Ipv4Addr>,
    active: bool,
}

impl IpAllocator {
    pub fn new() -> Self {
        let cfg = AllocatorConfig::default();
        Self {
            pool: Mutex::new(Pool {
                network: cfg.network,
                capacity: cfg.capacity,
                next: 1,
                freed: Vec::new(),
                leased: HashSet::new(),
                active: false,
            }),
        }
    }

    pub fn configure(&self, cfg: &AllocatorConfig) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.network = cfg.network;
        pool.capacity = cfg.capacity;
    }

    /// Reset the pool and start serving. Called when the orchestrator
    /// loop starts.
    pub fn init(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.next = 1;
        pool.freed.clear();
        pool.leased.clear();
        pool.active = true;
        debug!(network = %pool.network, capacity = pool.capacity, "address pool ready");
    }

    /// Stop serving and forget all leases. Idempotent.
    pub fn stop(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.active = false;
        pool.freed.clear();
        pool.leased.clear();
    }

    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if !pool.active {
            return None;
        }
        let addr = match pool.freed.pop() {
            Some(addr) => addr,
            None if pool.next <= pool.capacity => {
                let addr = offset(pool.network, pool.next);
                pool.next += 1;
                addr
            }
            None => {
                warn!("address pool exhausted");
                return None;
            }
        };
        pool.leased.insert(addr);
        Some(addr)
    }

    pub fn release(&self, addr: Ipv4Addr) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if !pool.leased.remove(&addr) {
            // Double release, or an address from before a restart.
            warn!(%addr, "released address was not leased from this pool");
            return;
        }
        if pool.active {
            pool.freed.push(addr);
        }
    }

    /// Number of currently leased addresses.
    pub fn in_use(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).leased.len()
    }
}

impl Default for IpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn offset(network: Ipv4Addr, host: u16) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network) + u32::from(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: u16) -> IpAllocator {
        let alloc = IpAllocator::new();
        alloc.configure(&AllocatorConfig {
            network: Ipv4Addr::new(10, 99, 0, 0),
            capacity,
        });
        alloc.init();
        alloc
    }

    #[test]
    fn skips_network_address_and_counts_up() {
        let alloc = pool(4);
        assert_eq!(alloc.allocate(), Some(Ipv4Addr::new(10, 99, 0, 1)));
        assert_eq!(alloc.allocate(), Some(Ipv4Addr::new(10, 99, 0, 2)));
        assert_eq!(alloc.in_use(), 2);
    }

    #[test]
    fn released_addresses_are_reused() {
        let alloc = pool(4);
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        alloc.release(a);
        assert_eq!(alloc.allocate(), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = pool(2);
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_some());
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn stop_refuses_further_allocation() {
        let alloc = pool(4);
        let _ = alloc.allocate();
        alloc.stop();
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.in_use(), 0);
        alloc.stop(); // idempotent
    }

    #[test]
    fn double_release_is_ignored() {
        let alloc = pool(4);
        let a = alloc.allocate().unwrap();
        alloc.release(a);
        alloc.release(a);
        assert_eq!(alloc.in_use(), 0);
        // the freed list must not contain the address twice
        assert_eq!(alloc.allocate(), Some(a));
        assert_ne!(alloc.allocate(), Some(a));
    }

    #[test]
    fn init_resets_leases() {
        let alloc = pool(4);
        let _ = alloc.allocate();
        alloc.init();
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(alloc.allocate(), Some(Ipv4Addr::new(10, 99, 0, 1)));
    }
}
