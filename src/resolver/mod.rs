//! DNS resolution combining several strategies.
//!
//! Every resolution races all strategies concurrently:
//! 1. Cache lookup (hit returns immediately)
//! 2. Join an in-flight race for the same domain, or start one
//! 3. First non-empty answer wins and is cached with a clamped TTL
//! 4. Strategies still running are drained in the background; a late answer
//!    only warms the cache

mod strategy;

pub use strategy::{
    Lookup, ResolveStrategy, StrategyKind, SystemStrategy, TunnelStrategy, UpstreamStrategy,
    query_udp,
};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::cache::{DomainRecord, RecordCache};
use crate::config::{CacheConfig, ResolverConfig};
use crate::dns;
use crate::error::ResolutionError;
use crate::policy::normalize_host;

/// A resolved address list with its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub ips: Vec<IpAddr>,
    pub ttl: Duration,
}

type Waiters = Vec<oneshot::Sender<Result<Answer, ResolutionError>>>;

struct Shared {
    strategies: Vec<Arc<dyn ResolveStrategy>>,
    cache: Arc<RecordCache<DomainRecord>>,
    inflight: Mutex<FxHashMap<String, Waiters>>,
    config: ResolverConfig,
    default_ttl: Duration,
    races: AtomicU64,
}

pub struct DnsResolver {
    shared: Arc<Shared>,
}

impl DnsResolver {
    pub fn new(
        strategies: Vec<Arc<dyn ResolveStrategy>>,
        cache: Arc<RecordCache<DomainRecord>>,
        config: &ResolverConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                strategies,
                cache,
                inflight: Mutex::new(FxHashMap::default()),
                config: config.clone(),
                default_ttl: cache_config.dns_ttl(),
                races: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve `domain` to its addresses.
    ///
    /// Concurrent calls for the same domain share one strategy race.
    pub async fn resolve(&self, domain: &str) -> Result<Answer, ResolutionError> {
        let domain = normalize_host(domain);
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(Answer {
                ips: vec![ip],
                ttl: Duration::from_secs(self.shared.config.max_ttl_secs),
            });
        }
        if !dns::is_valid_name(&domain) {
            return Err(ResolutionError::Malformed);
        }

        if let Some((record, ttl)) = self.shared.cache.get_with_ttl(&domain) {
            trace!(%domain, "resolver cache hit");
            return Ok(Answer {
                ips: record.into_ips(),
                ttl,
            });
        }

        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut inflight = self.shared.inflight.lock();
            match inflight.get_mut(&domain) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(domain.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            tokio::spawn(race(self.shared.clone(), domain));
        }

        rx.await.unwrap_or(Err(ResolutionError::NoAnswer))
    }

    /// Drop a cached answer, e.g. after every address refused connections.
    pub fn invalidate(&self, domain: &str) {
        self.shared.cache.invalidate(&normalize_host(domain));
    }

    /// Number of strategy races started so far.
    pub fn race_count(&self) -> u64 {
        self.shared.races.load(Ordering::Relaxed)
    }
}

fn notify(shared: &Shared, domain: &str, result: Result<Answer, ResolutionError>) {
    let waiters = shared.inflight.lock().remove(domain).unwrap_or_default();
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

async fn race(shared: Arc<Shared>, domain: String) {
    shared.races.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();

    let mut pending: FuturesUnordered<_> = shared
        .strategies
        .iter()
        .map(|strategy| {
            let strategy = strategy.clone();
            let domain = domain.clone();
            let timeout = shared.config.strategy_timeout();
            async move {
                let result = tokio::time::timeout(timeout, strategy.lookup(&domain))
                    .await
                    .unwrap_or(Err(ResolutionError::Timeout));
                (strategy.name(), result)
            }
        })
        .collect();

    let mut answered = false;
    let mut malformed = 0;
    let mut failed = 0;

    while let Some((name, result)) = pending.next().await {
        match result {
            Ok(lookup) if !lookup.ips.is_empty() => {
                let ttl = shared
                    .config
                    .clamp_ttl(lookup.ttl.unwrap_or(shared.default_ttl));
                if !answered {
                    answered = true;
                    shared
                        .cache
                        .put(domain.clone(), DomainRecord::new(lookup.ips.clone()), ttl);
                    debug!(
                        %domain,
                        strategy = name,
                        ips = lookup.ips.len(),
                        ttl_secs = ttl.as_secs(),
                        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "resolved"
                    );
                    notify(&shared, &domain, Ok(Answer { ips: lookup.ips, ttl }));
                } else if shared.cache.get(&domain).is_none() {
                    trace!(%domain, strategy = name, "late answer warms cache");
                    shared
                        .cache
                        .put(domain.clone(), DomainRecord::new(lookup.ips), ttl);
                }
            }
            Ok(_) => {
                failed += 1;
                trace!(%domain, strategy = name, "empty answer");
            }
            Err(e) => {
                failed += 1;
                if e == ResolutionError::Malformed {
                    malformed += 1;
                }
                trace!(%domain, strategy = name, error = %e, "strategy failed");
            }
        }
    }

    if !answered {
        let err = if failed > 0 && malformed == failed {
            ResolutionError::Malformed
        } else {
            ResolutionError::NoAnswer
        };
        debug!(%domain, error = %err, "resolution failed");
        notify(&shared, &domain, Err(err));
    }
}
