use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::AllocError;

#[derive(Debug, Default)]
struct PoolState {
    by_key: HashMap<String, IpAddr>,
    by_addr: BTreeMap<IpAddr, String>,
}

impl PoolState {
    fn bind(&mut self, key: &str, address: IpAddr) {
        self.by_key.insert(key.to_string(), address);
        self.by_addr.insert(address, key.to_string());
    }
}

/// Address reservations within one CIDR, keyed by entity.
#[derive(Debug)]
pub struct IpPool {
    name: String,
    cidr: IpNet,
    state: Mutex<PoolState>,
}

impl IpPool {
    pub fn new(name: &str, cidr: IpNet) -> Self {
        Self {
            name: name.to_string(),
            cidr: cidr.trunc(),
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    /// Reserve a known address for `key`, replaying a persisted assignment.
    /// Repeating the same pair is a no-op.
    pub fn configure(&self, key: &str, address: IpAddr) -> Result<(), AllocError> {
        if !self.cidr.contains(&address) {
            return Err(AllocError::OutsidePool {
                pool: self.name.clone(),
                address,
                cidr: self.cidr,
            });
        }

        let mut state = self.lock();

        if let Some(holder) = state.by_addr.get(&address) {
            if holder == key {
                return Ok(());
            }
            return Err(AllocError::AddressInUse {
                pool: self.name.clone(),
                address,
                holder: holder.clone(),
            });
        }

        if let Some(previous) = state.by_key.get(key).copied() {
            warn!(
                pool = %self.name,
                key,
                %previous,
                %address,
                "Rebinding key to a different address"
            );
            state.by_addr.remove(&previous);
        }

        state.bind(key, address);
        debug!(pool = %self.name, key, %address, "Configured address");
        Ok(())
    }

    /// The key's existing reservation, or the lowest free host address.
    pub fn allocate(&self, key: &str) -> Result<IpAddr, AllocError> {
        let mut state = self.lock();

        if let Some(address) = state.by_key.get(key) {
            return Ok(*address);
        }

        let address = self
            .hosts()
            .find(|candidate| !state.by_addr.contains_key(candidate))
            .ok_or_else(|| AllocError::PoolExhausted {
                pool: self.name.clone(),
                cidr: self.cidr,
            })?;

        state.bind(key, address);
        debug!(pool = %self.name, key, %address, "Allocated address");
        Ok(address)
    }

    /// Candidate addresses in ascending order. IPv4 loses network and
    /// broadcast through `hosts()`; IPv6 blocks wider than /127 skip the
    /// subnet-router anycast address.
    fn hosts(&self) -> impl Iterator<Item = IpAddr> {
        let anycast = match self.cidr {
            IpNet::V6(net) if net.prefix_len() < 127 => Some(IpAddr::V6(net.network())),
            _ => None,
        };
        self.cidr.hosts().filter(move |address| Some(*address) != anycast)
    }

    /// Drop a key's reservation.
    pub fn release(&self, key: &str) -> Option<IpAddr> {
        let mut state = self.lock();
        let address = state.by_key.remove(key)?;
        state.by_addr.remove(&address);
        debug!(pool = %self.name, key, %address, "Released address");
        Some(address)
    }

    pub fn address_of(&self, key: &str) -> Option<IpAddr> {
        self.lock().by_key.get(key).copied()
    }

    pub fn in_use(&self) -> usize {
        self.lock().by_key.len()
    }

    /// Reservations ordered by address.
    pub fn assignments(&self) -> Vec<(IpAddr, String)> {
        self.lock()
            .by_addr
            .iter()
            .map(|(address, key)| (*address, key.clone()))
            .collect()
    }

    /// Number of addresses `allocate` can hand out.
    pub fn capacity(&self) -> u128 {
        let host_bits = u32::from(self.cidr.max_prefix_len() - self.cidr.prefix_len());
        let total = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
        match self.cidr {
            IpNet::V4(_) if host_bits >= 2 => total - 2,
            IpNet::V6(_) if host_bits >= 2 => total - 1,
            _ => total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool(cidr: &str) -> IpPool {
        IpPool::new("fabric", cidr.parse().unwrap())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allocate_is_idempotent_per_key() {
        let pool = pool("10.80.0.0/24");
        let first = pool.allocate("x").unwrap();
        assert_eq!(first, ip("10.80.0.1"));
        assert_eq!(pool.allocate("x").unwrap(), first);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn configured_address_is_returned_by_allocate() {
        let pool = pool("10.80.0.0/24");
        pool.configure("y", ip("10.80.0.9")).unwrap();
        assert_eq!(pool.allocate("y").unwrap(), ip("10.80.0.9"));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.allocate("z").unwrap(), ip("10.80.0.1"));
    }

    #[test]
    fn configure_tolerates_replay_and_rejects_conflicts() {
        let pool = pool("10.80.0.0/24");
        pool.configure("y", ip("10.80.0.9")).unwrap();
        pool.configure("y", ip("10.80.0.9")).unwrap();

        assert_eq!(
            pool.configure("w", ip("10.80.0.9")),
            Err(AllocError::AddressInUse {
                pool: "fabric".into(),
                address: ip("10.80.0.9"),
                holder: "y".into(),
            })
        );
        assert!(matches!(
            pool.configure("w", ip("10.81.0.1")),
            Err(AllocError::OutsidePool { .. })
        ));
    }

    #[test]
    fn configure_rebinds_a_moved_key() {
        let pool = pool("10.80.0.0/24");
        pool.configure("y", ip("10.80.0.9")).unwrap();
        pool.configure("y", ip("10.80.0.10")).unwrap();
        assert_eq!(pool.address_of("y"), Some(ip("10.80.0.10")));
        pool.configure("w", ip("10.80.0.9")).unwrap();
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn lowest_free_address_is_chosen() {
        let pool = pool("10.80.0.0/29");
        pool.configure("a", ip("10.80.0.1")).unwrap();
        pool.configure("c", ip("10.80.0.3")).unwrap();
        assert_eq!(pool.allocate("b").unwrap(), ip("10.80.0.2"));
        assert_eq!(pool.allocate("d").unwrap(), ip("10.80.0.4"));
    }

    #[test]
    fn exhaustion_and_release() {
        let pool = pool("10.80.0.0/30");
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.allocate("a").unwrap(), ip("10.80.0.1"));
        assert_eq!(pool.allocate("b").unwrap(), ip("10.80.0.2"));
        let err = pool.allocate("c").unwrap_err();
        assert!(matches!(err, AllocError::PoolExhausted { .. }));
        assert!(err.is_retryable());

        assert_eq!(pool.release("a"), Some(ip("10.80.0.1")));
        assert_eq!(pool.allocate("c").unwrap(), ip("10.80.0.1"));
    }

    #[test]
    fn point_to_point_blocks_use_every_address() {
        let pool = pool("10.80.0.0/31");
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.allocate("a").unwrap(), ip("10.80.0.0"));
        assert_eq!(pool.allocate("b").unwrap(), ip("10.80.0.1"));
    }

    #[test]
    fn ipv6_pools_skip_the_anycast_address() {
        let pool = pool("fd00::/126");
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.allocate("a").unwrap(), ip("fd00::1"));
        assert_eq!(pool.allocate("b").unwrap(), ip("fd00::2"));
        assert_eq!(pool.allocate("c").unwrap(), ip("fd00::3"));
        assert!(matches!(
            pool.allocate("d"),
            Err(AllocError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn ipv6_point_to_point_blocks_use_every_address() {
        let pool = pool("fd00::/127");
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.allocate("a").unwrap(), ip("fd00::"));
        assert_eq!(pool.allocate("b").unwrap(), ip("fd00::1"));
    }

    #[test]
    fn concurrent_workers_get_distinct_addresses() {
        let pool = Arc::new(pool("10.80.0.0/24"));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..20)
                        .map(|i| pool.allocate(&format!("w{}-{}", worker, i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let addresses: HashSet<IpAddr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(addresses.len(), 80);
        assert_eq!(pool.in_use(), 80);
    }
}
