//! Per-IP request and connection counters
//!
//! Both structures are fixed-window counters: they only grow between resets
//! and are cleared wholesale by a timer (the tunnel heartbeat or the NAT
//! responder's own reset tick). Keys are canonical IP addresses, so an
//! IPv4-mapped IPv6 source shares its count with the plain IPv4 address.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Fixed-window request limiter keyed by IP address
pub struct RateLimiter {
    requests: DashMap<IpAddr, u32>,
    /// Distinct addresses admitted this window, claimed before insertion
    distinct: AtomicUsize,
    max_global: usize,
    max_per_ip: u32,
}

impl RateLimiter {
    pub fn new(max_global: usize, max_per_ip: u32) -> Self {
        Self {
            requests: DashMap::new(),
            distinct: AtomicUsize::new(0),
            max_global,
            max_per_ip,
        }
    }

    /// Count one request from `ip`.
    ///
    /// Returns false without counting when the number of distinct addresses
    /// seen in this window is at or above the global cap, or when this
    /// address already used its per-IP allowance.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.distinct.load(Ordering::Acquire) >= self.max_global {
            return false;
        }

        match self.requests.entry(ip.to_canonical()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                if *count >= self.max_per_ip {
                    return false;
                }
                *count += 1;
                true
            }
            Entry::Vacant(vacant) => {
                if self.max_per_ip == 0 || !self.claim_distinct() {
                    return false;
                }
                vacant.insert(1);
                true
            }
        }
    }

    /// Take one distinct-address slot, failing once the global cap is reached
    fn claim_distinct(&self) -> bool {
        self.distinct
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.max_global).then_some(taken + 1)
            })
            .is_ok()
    }

    /// Requests counted for `ip` in the current window
    pub fn count(&self, ip: IpAddr) -> u32 {
        self.requests
            .get(&ip.to_canonical())
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Distinct addresses seen in the current window
    pub fn distinct(&self) -> usize {
        self.requests.len()
    }

    /// Start a new window
    pub fn reset(&self) {
        self.distinct.store(0, Ordering::Release);
        self.requests.clear();
    }
}

/// Active connections per IP address, bounded by the configured IP limit
pub struct ConnectionCounter {
    connections: DashMap<IpAddr, u32>,
    ip_limit: u32,
}

impl ConnectionCounter {
    pub fn new(ip_limit: u32) -> Self {
        Self {
            connections: DashMap::new(),
            ip_limit,
        }
    }

    /// Take one connection slot for `ip`, unless it is at its limit.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut count = self.connections.entry(ip.to_canonical()).or_insert(0);
        if *count >= self.ip_limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back one connection slot for `ip`. Entries reaching zero are removed.
    pub fn release(&self, ip: IpAddr) {
        if let Entry::Occupied(mut entry) = self.connections.entry(ip.to_canonical()) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// Move one connection from `from` to `to`.
    ///
    /// Moving within the same address is a no-op and always succeeds. A move
    /// to a different address needs a free slot on `to`; on failure nothing
    /// changes.
    pub fn transfer(&self, from: IpAddr, to: IpAddr) -> bool {
        if from.to_canonical() == to.to_canonical() {
            return true;
        }
        if !self.try_acquire(to) {
            return false;
        }
        self.release(from);
        true
    }

    pub fn count(&self, ip: IpAddr) -> u32 {
        self.connections
            .get(&ip.to_canonical())
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Sum of all active connections
    pub fn total(&self) -> u32 {
        self.connections.iter().map(|entry| *entry.value()).sum()
    }

    /// Number of addresses holding at least one connection
    pub fn distinct(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, last))
    }

    #[test]
    fn test_rate_limiter_per_ip_cap() {
        let limiter = RateLimiter::new(100, 3);

        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
        assert_eq!(limiter.count(ip(1)), 3);

        // Other addresses are unaffected
        assert!(limiter.allow(ip(2)));
    }

    #[test]
    fn test_rate_limiter_reset_opens_new_window() {
        let limiter = RateLimiter::new(100, 1);

        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        limiter.reset();
        assert_eq!(limiter.distinct(), 0);
        assert!(limiter.allow(ip(1)));
    }

    #[test]
    fn test_rate_limiter_global_cap() {
        let limiter = RateLimiter::new(2, 10);

        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(2)));
        // Two distinct addresses fill the window
        assert!(!limiter.allow(ip(3)));
        assert!(!limiter.allow(ip(1)));
        assert_eq!(limiter.count(ip(3)), 0);
    }

    #[test]
    fn test_rate_limiter_mapped_address_shares_count() {
        let limiter = RateLimiter::new(10, 1);
        let v4 = ip(7);
        let mapped = match v4 {
            IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
            IpAddr::V6(_) => unreachable!(),
        };

        assert!(limiter.allow(v4));
        assert!(!limiter.allow(mapped));
    }

    #[test]
    fn test_connection_counter_limit_and_release() {
        let counter = ConnectionCounter::new(2);

        assert!(counter.try_acquire(ip(1)));
        assert!(counter.try_acquire(ip(1)));
        assert!(!counter.try_acquire(ip(1)));
        assert_eq!(counter.count(ip(1)), 2);

        counter.release(ip(1));
        assert_eq!(counter.count(ip(1)), 1);
        counter.release(ip(1));
        assert_eq!(counter.count(ip(1)), 0);
        assert_eq!(counter.distinct(), 0);

        // Releasing an unknown address is harmless
        counter.release(ip(9));
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_connection_counter_transfer() {
        let counter = ConnectionCounter::new(1);
        assert!(counter.try_acquire(ip(1)));
        assert!(counter.try_acquire(ip(2)));

        // Destination is full
        assert!(!counter.transfer(ip(1), ip(2)));
        assert_eq!(counter.count(ip(1)), 1);

        // Same address never needs a new slot
        assert!(counter.transfer(ip(1), ip(1)));
        assert_eq!(counter.count(ip(1)), 1);

        assert!(counter.transfer(ip(1), ip(3)));
        assert_eq!(counter.count(ip(1)), 0);
        assert_eq!(counter.count(ip(3)), 1);
        assert_eq!(counter.total(), 2);
    }

    #[test]
    fn test_rate_limiter_global_cap_under_contention() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        const THREADS: u8 = 32;

        for _ in 0..100 {
            let limiter = Arc::new(RateLimiter::new(1, 10));
            let barrier = Arc::new(Barrier::new(THREADS as usize));

            let handles: Vec<_> = (0..THREADS)
                .map(|last| {
                    let limiter = limiter.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        limiter.allow(ip(last))
                    })
                })
                .collect();

            let admitted = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|allowed| *allowed)
                .count();
            assert_eq!(admitted, 1);
            assert_eq!(limiter.distinct(), 1);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// No address is ever admitted more than `max_per_ip` times per window.
            #[test]
            fn prop_per_ip_cap_holds(
                max_per_ip in 1u32..=20,
                requests in prop::collection::vec(0u8..8, 1..200),
            ) {
                let limiter = RateLimiter::new(1000, max_per_ip);
                let mut admitted = [0u32; 8];

                for last in requests {
                    if limiter.allow(ip(last)) {
                        admitted[last as usize] += 1;
                    }
                }

                for count in admitted {
                    prop_assert!(count <= max_per_ip);
                }
            }

            /// Acquire/release sequences never push an address past its limit
            /// and never underflow.
            #[test]
            fn prop_connection_counter_bounded(
                ip_limit in 1u32..=8,
                ops in prop::collection::vec((any::<bool>(), 0u8..4), 1..200),
            ) {
                let counter = ConnectionCounter::new(ip_limit);
                let mut model = [0u32; 4];

                for (acquire, last) in ops {
                    let slot = &mut model[last as usize];
                    if acquire {
                        let ok = counter.try_acquire(ip(last));
                        prop_assert_eq!(ok, *slot < ip_limit);
                        if ok {
                            *slot += 1;
                        }
                    } else {
                        counter.release(ip(last));
                        *slot = slot.saturating_sub(1);
                    }
                    prop_assert_eq!(counter.count(ip(last)), *slot);
                }
            }
        }
    }
}
