//! Intercept addresses handed out for tunneled domains.
//!
//! The proxy front-end maps a connection to one of these addresses back to
//! the domain it was issued for. When the pool is full the least recently
//! used mapping is recycled.

use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;

struct State {
    by_domain: LruCache<String, Ipv4Addr>,
    by_ip: FxHashMap<Ipv4Addr, String>,
    next: u32,
}

pub struct InterceptPool {
    net: Ipv4Net,
    state: Mutex<State>,
}

impl InterceptPool {
    /// `capacity` is capped at the number of usable host addresses in `net`.
    pub fn new(net: Ipv4Net, capacity: usize) -> Self {
        let host_bits = 32 - u32::from(net.prefix_len());
        let usable = ((1u64 << host_bits).saturating_sub(2)).max(1);
        let capacity = capacity.clamp(1, usable.min(usize::MAX as u64) as usize);
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            net,
            state: Mutex::new(State {
                by_domain: LruCache::new(capacity),
                by_ip: FxHashMap::default(),
                next: 1,
            }),
        }
    }

    /// The address for `domain`, allocating one if needed.
    pub fn allocate(&self, domain: &str) -> Ipv4Addr {
        let mut st = self.state.lock();
        if let Some(ip) = st.by_domain.get(domain) {
            return *ip;
        }

        let ip = if st.by_domain.len() < st.by_domain.cap().get() {
            let offset = st.next;
            st.next += 1;
            Ipv4Addr::from(u32::from(self.net.network()) + offset)
        } else {
            match st.by_domain.pop_lru() {
                Some((old, ip)) => {
                    st.by_ip.remove(&ip);
                    tracing::trace!(domain = %old, %ip, "recycling intercept address");
                    ip
                }
                None => Ipv4Addr::from(u32::from(self.net.network()) + 1),
            }
        };

        st.by_domain.put(domain.to_string(), ip);
        st.by_ip.insert(ip, domain.to_string());
        ip
    }

    /// The domain an intercept address stands for.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };
        let mut st = self.state.lock();
        let domain = st.by_ip.get(&v4)?.clone();
        st.by_domain.promote(&domain);
        Some(domain)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.net.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> InterceptPool {
        InterceptPool::new("198.18.0.0/15".parse().unwrap(), capacity)
    }

    #[test]
    fn stable_per_domain() {
        let pool = pool(16);
        let a = pool.allocate("blocked.example");
        let b = pool.allocate("other.example");

        assert_ne!(a, b);
        assert_eq!(pool.allocate("blocked.example"), a);
        assert_eq!(a, Ipv4Addr::new(198, 18, 0, 1));
        assert_eq!(pool.lookup(IpAddr::V4(b)).as_deref(), Some("other.example"));
    }

    #[test]
    fn recycles_least_recently_used() {
        let pool = pool(2);
        let a = pool.allocate("a.example");
        let _b = pool.allocate("b.example");
        // Touch a so b is the oldest
        pool.lookup(IpAddr::V4(a));

        let c = pool.allocate("c.example");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.lookup(IpAddr::V4(c)).as_deref(), Some("c.example"));
        assert_eq!(pool.lookup(IpAddr::V4(a)).as_deref(), Some("a.example"));
    }

    #[test]
    fn capacity_bounded_by_network() {
        let pool = InterceptPool::new("10.9.9.0/30".parse().unwrap(), 100);
        for i in 0..10 {
            let ip = pool.allocate(&format!("d{i}.example"));
            assert!(pool.contains(IpAddr::V4(ip)));
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn membership() {
        let pool = pool(4);
        assert!(pool.contains("198.19.255.1".parse().unwrap()));
        assert!(!pool.contains("8.8.8.8".parse().unwrap()));
        assert!(!pool.contains("::1".parse().unwrap()));
        assert_eq!(pool.lookup("198.18.0.9".parse().unwrap()), None);
    }
}
