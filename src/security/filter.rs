//! # Connection Filter
//!
//! Admission control consulted by every acceptor before a session exists.
//!
//! - Banned addresses are always refused.
//! - Each address may hold at most `max_connections_per_ip` live connections.
//!
//! Counters are created on first admission and removed once they drop back to zero,
//! so the map only ever holds addresses with live connections. Acceptors on several
//! threads may admit and release concurrently; each check-and-increment runs under
//! the owning shard's lock.

use crate::error::{NetworkError, RefusalReason, Result};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 10;

pub trait ConnectionFilter: Send + Sync {
    /// Admit one more connection from `address` or refuse it without side effects.
    fn validate_and_add_address(&self, address: IpAddr) -> Result<()>;

    /// Release one connection slot.
    fn remove_address(&self, address: IpAddr);

    fn add_banned_address(&self, address: IpAddr);

    fn remove_banned_address(&self, address: IpAddr);

    fn banned_addresses(&self) -> Vec<IpAddr>;

    fn max_connections_per_ip(&self) -> usize;

    fn set_max_connections_per_ip(&self, max: usize);
}

#[derive(Debug)]
pub struct DefaultConnectionFilter {
    banned: DashSet<IpAddr>,
    counts: DashMap<IpAddr, usize>,
    max_connections_per_ip: AtomicUsize,
}

impl DefaultConnectionFilter {
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            banned: DashSet::new(),
            counts: DashMap::new(),
            max_connections_per_ip: AtomicUsize::new(max_connections_per_ip),
        }
    }

    /// Live connections currently counted for `address`.
    pub fn connection_count(&self, address: &IpAddr) -> usize {
        self.counts.get(address).map(|c| *c).unwrap_or(0)
    }

    /// Number of addresses with at least one live connection.
    pub fn tracked_addresses(&self) -> usize {
        self.counts.len()
    }

    pub fn is_banned(&self, address: &IpAddr) -> bool {
        self.banned.contains(address)
    }
}

impl Default for DefaultConnectionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_IP)
    }
}

impl ConnectionFilter for DefaultConnectionFilter {
    fn validate_and_add_address(&self, address: IpAddr) -> Result<()> {
        if self.banned.contains(&address) {
            warn!(%address, "Refused banned address");
            return Err(NetworkError::RefusedAddress {
                address,
                reason: RefusalReason::Banned,
            });
        }

        let max = self.max_connections_per_ip.load(Ordering::Acquire);
        match self.counts.entry(address) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= max {
                    warn!(%address, max, "Refused address at connection limit");
                    return Err(NetworkError::RefusedAddress {
                        address,
                        reason: RefusalReason::LimitReached { max },
                    });
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                if max == 0 {
                    return Err(NetworkError::RefusedAddress {
                        address,
                        reason: RefusalReason::LimitReached { max },
                    });
                }
                entry.insert(1);
            }
        }
        debug!(%address, "Admitted connection");
        Ok(())
    }

    fn remove_address(&self, address: IpAddr) {
        if let Entry::Occupied(mut entry) = self.counts.entry(address) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    fn add_banned_address(&self, address: IpAddr) {
        self.banned.insert(address);
    }

    fn remove_banned_address(&self, address: IpAddr) {
        self.banned.remove(&address);
    }

    fn banned_addresses(&self) -> Vec<IpAddr> {
        self.banned.iter().map(|a| *a).collect()
    }

    fn max_connections_per_ip(&self) -> usize {
        self.max_connections_per_ip.load(Ordering::Acquire)
    }

    fn set_max_connections_per_ip(&self, max: usize) {
        self.max_connections_per_ip.store(max, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn limit_then_release_then_admit() {
        let filter = DefaultConnectionFilter::default();
        let address = ip("1.2.3.4");
        for _ in 0..DEFAULT_MAX_CONNECTIONS_PER_IP {
            filter.validate_and_add_address(address).unwrap();
        }
        let err = filter.validate_and_add_address(address).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::RefusedAddress {
                reason: RefusalReason::LimitReached { max: 10 },
                ..
            }
        ));
        assert_eq!(filter.connection_count(&address), 10);

        filter.remove_address(address);
        filter.validate_and_add_address(address).unwrap();
        assert!(filter.validate_and_add_address(address).is_err());
    }

    #[test]
    fn banned_address_always_refused() {
        let filter = DefaultConnectionFilter::default();
        let address = ip("10.0.0.1");
        filter.add_banned_address(address);
        assert!(filter.validate_and_add_address(address).is_err());
        assert_eq!(filter.connection_count(&address), 0);
        assert_eq!(filter.banned_addresses(), vec![address]);

        filter.remove_banned_address(address);
        filter.validate_and_add_address(address).unwrap();
    }

    #[test]
    fn zero_counts_are_removed() {
        let filter = DefaultConnectionFilter::default();
        let address = ip("::1");
        filter.validate_and_add_address(address).unwrap();
        filter.validate_and_add_address(address).unwrap();
        filter.remove_address(address);
        assert_eq!(filter.tracked_addresses(), 1);
        filter.remove_address(address);
        assert_eq!(filter.tracked_addresses(), 0);
        // Releasing an unknown address is a no-op.
        filter.remove_address(address);
        assert_eq!(filter.tracked_addresses(), 0);
    }

    #[test]
    fn zero_limit_leaves_no_entry() {
        let filter = DefaultConnectionFilter::new(0);
        assert!(filter.validate_and_add_address(ip("1.1.1.1")).is_err());
        assert_eq!(filter.tracked_addresses(), 0);
    }

    #[test]
    fn concurrent_admission_never_exceeds_limit() {
        let filter = Arc::new(DefaultConnectionFilter::new(5));
        let address = ip("192.168.0.7");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let filter = filter.clone();
                std::thread::spawn(move || filter.validate_and_add_address(address).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(filter.connection_count(&address), 5);
    }
}
