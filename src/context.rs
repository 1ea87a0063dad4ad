//! Shared daemon state, built once at startup.
//!
//! Every component receives its collaborators from here; nothing is looked
//! up globally.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendRegistry, DirectBackend, HttpConnectBackend, LanProxy, Socks5Backend, TransportKind,
};
use crate::cache::{Clock, DomainRecord, HostMeta, Record, RecordCache, SystemClock};
use crate::config::Config;
use crate::connect::ConnectManager;
use crate::error::ConfigError;
use crate::policy::{AD_DOMAINS, Blocklist, Classifier, GeoIpProvider, NoGeoIp, RangeTable};
use crate::resolver::{
    DnsResolver, ResolveStrategy, StrategyKind, SystemStrategy, TunnelStrategy, UpstreamStrategy,
};
use crate::responder::{InterceptPool, Responder};
use crate::stats::Stats;

pub struct Context {
    pub config: Config,
    pub domain_cache: Arc<RecordCache<DomainRecord>>,
    pub ip_cache: Arc<RecordCache<HostMeta>>,
    pub resolver: Arc<DnsResolver>,
    pub classifier: Arc<Classifier>,
    pub connector: Arc<ConnectManager>,
    pub intercept: Arc<InterceptPool>,
    pub responder: Arc<Responder>,
    pub stats: Arc<Stats>,
}

impl Context {
    /// Build from configuration, with tunnel backends for every configured
    /// tunnel endpoint. Caches are loaded from disk.
    pub fn build(config: Config) -> Result<Arc<Self>, ConfigError> {
        let tunnels = configured_tunnels(&config);
        let ctx = Self::assemble(config, tunnels, Arc::new(SystemClock))?;
        ctx.load_caches();
        Ok(ctx)
    }

    /// Wire every component around the given tunnel backends.
    ///
    /// The direct backend needs the resolver, and the resolver's tunnel
    /// strategy needs the tunnel backends, so tunnels come first.
    pub fn assemble(
        config: Config,
        tunnels: Vec<Arc<dyn Backend>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let domain_cache = Arc::new(
            RecordCache::new("domain", config.cache.domain_capacity, clock.clone())
                .with_path(&config.cache.domain_path),
        );
        let ip_cache = Arc::new(
            RecordCache::new("ip", config.cache.ip_capacity, clock)
                .with_path(&config.cache.ip_path),
        );

        let mut registry = BackendRegistry::new();
        for tunnel in tunnels {
            registry.register(tunnel);
        }

        let strategies = config
            .resolver
            .strategies
            .iter()
            .map(|kind| -> Arc<dyn ResolveStrategy> {
                match kind {
                    StrategyKind::System => Arc::new(SystemStrategy),
                    StrategyKind::Upstream => Arc::new(UpstreamStrategy::new(
                        config.resolver.upstreams.clone(),
                        config.resolver.strategy_timeout(),
                    )),
                    StrategyKind::Tunnel => {
                        Arc::new(TunnelStrategy::new(registry.tunnels(&config.connect.order)))
                    }
                }
            })
            .collect();
        let resolver = Arc::new(DnsResolver::new(
            strategies,
            domain_cache.clone(),
            &config.resolver,
            &config.cache,
        ));

        let lan_proxy = LanProxy::from_config(&config.connect.lan_proxy);
        if let Some(proxy) = &lan_proxy {
            info!(kind = ?proxy.kind, host = %proxy.host, port = proxy.port, "using lan proxy for direct connections");
        }
        registry.register(Arc::new(
            DirectBackend::new(resolver.clone(), config.connect.connect_timeout()).with_lan_proxy(lan_proxy),
        ));

        let classifier = Arc::new(build_classifier(
            &config,
            domain_cache.clone(),
            ip_cache.clone(),
            resolver.clone(),
        )?);

        let connector = Arc::new(ConnectManager::new(
            &config.connect,
            &config.cache,
            registry,
            classifier.clone(),
            ip_cache.clone(),
        ));

        let intercept = Arc::new(InterceptPool::new(
            config.dns.intercept_network()?,
            config.dns.intercept_capacity,
        ));
        let stats = Arc::new(Stats::new());
        let responder = Arc::new(Responder::new(
            &config.dns,
            classifier.clone(),
            resolver.clone(),
            intercept.clone(),
            stats.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            domain_cache,
            ip_cache,
            resolver,
            classifier,
            connector,
            intercept,
            responder,
            stats,
        }))
    }

    /// Load both caches. Failures leave the cache empty.
    pub fn load_caches(&self) {
        load_cache(&self.domain_cache);
        load_cache(&self.ip_cache);
    }

    /// Persist both caches. Failures are logged and skipped.
    pub fn save_caches(&self) {
        save_cache(&self.domain_cache);
        save_cache(&self.ip_cache);
    }

    /// One expiry pass over both caches and the connection pool.
    pub fn sweep(&self) {
        let domains = self.domain_cache.sweep();
        let hosts = self.ip_cache.sweep();
        let pooled = self.connector.pool().map_or(0, |p| p.sweep());
        if domains + hosts + pooled > 0 {
            debug!(domains, hosts, pooled, "expired entries swept");
        }
    }

    /// Background ticker: sweep on one interval, persist on another.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = self.clone();
        let sweep_every = Duration::from_secs(ctx.config.cache.sweep_interval_secs.max(1));
        let save_every = Duration::from_secs(ctx.config.cache.save_interval_secs.max(1));

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut save = tokio::time::interval(save_every);
            // Skip the immediate first ticks
            sweep.tick().await;
            save.tick().await;

            loop {
                tokio::select! {
                    _ = sweep.tick() => ctx.sweep(),
                    _ = save.tick() => {
                        // File I/O off the runtime threads
                        let ctx = ctx.clone();
                        let _ = tokio::task::spawn_blocking(move || ctx.save_caches()).await;
                    }
                }
            }
        })
    }
}

fn configured_tunnels(config: &Config) -> Vec<Arc<dyn Backend>> {
    let timeout = config.connect.connect_timeout();
    let dns = config.backends.tunnel_dns;
    let mut tunnels: Vec<Arc<dyn Backend>> = Vec::new();

    if let Some(addr) = config.backends.http {
        tunnels.push(Arc::new(HttpConnectBackend::new(addr, dns, timeout)));
    }
    if let Some(addr) = config.backends.socks {
        tunnels.push(Arc::new(Socks5Backend::new(addr, dns, timeout)));
    }
    if tunnels.is_empty() {
        warn!("no tunnel backend configured, TUNNEL destinations will fail");
    }
    for kind in &config.connect.order {
        if !tunnels.iter().any(|t| t.kind() == *kind) && *kind != TransportKind::Direct {
            debug!(transport = %kind, "preferred transport not configured");
        }
    }
    tunnels
}

fn build_classifier(
    config: &Config,
    domain_cache: Arc<RecordCache<DomainRecord>>,
    ip_cache: Arc<RecordCache<HostMeta>>,
    resolver: Arc<DnsResolver>,
) -> Result<Classifier, ConfigError> {
    let policy = &config.policy;

    let blocklist = match &policy.blocklist_path {
        Some(path) => load_list(path).unwrap_or_default(),
        None => Blocklist::default(),
    };

    let geoip: Arc<dyn GeoIpProvider> = match &policy.geoip_path {
        Some(path) => match RangeTable::load(path) {
            Ok(table) => {
                info!(path = %path.display(), ranges = table.len(), "geo-ip table loaded");
                Arc::new(table)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "geo-ip table unavailable");
                Arc::new(NoGeoIp)
            }
        },
        None => Arc::new(NoGeoIp),
    };

    let mut classifier = Classifier::new(policy, Arc::new(blocklist), geoip, domain_cache, ip_cache)
        .with_rules(policy.compile_rules()?)
        .with_resolver(resolver);

    if policy.block_advertisement {
        let adlist = match &policy.adlist_path {
            Some(path) => load_list(path).unwrap_or_else(|| Blocklist::from_text(AD_DOMAINS)),
            None => Blocklist::from_text(AD_DOMAINS),
        };
        classifier = classifier.with_adlist(Arc::new(adlist));
    }

    info!(
        tunnel_domains = classifier.blocklist().len(),
        rules = policy.rules.len(),
        "classifier ready"
    );
    Ok(classifier)
}

fn load_list(path: &Path) -> Option<Blocklist> {
    match Blocklist::load(path) {
        Ok(list) => Some(list),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "domain list unavailable, using built-in");
            None
        }
    }
}

fn load_cache<V: Record>(cache: &RecordCache<V>) {
    match cache.load() {
        Ok(n) => info!(cache = cache.name(), entries = n, "cache loaded"),
        Err(e) => warn!(cache = cache.name(), error = %e, "cache load failed, starting empty"),
    }
}

fn save_cache<V: Record>(cache: &RecordCache<V>) {
    match cache.save() {
        Ok(n) => debug!(cache = cache.name(), entries = n, "cache saved"),
        Err(e) => warn!(cache = cache.name(), error = %e, "cache save failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::RuleConfig;
    use crate::policy::Route;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.cache.domain_path = dir.join("domains.txt");
        config.cache.ip_path = dir.join("ips.txt");
        config.resolver.strategies = vec![StrategyKind::Tunnel];
        config
    }

    #[test]
    fn assemble_rejects_bad_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.policy.rules.push(RuleConfig {
            pattern: "10.0.0.0/99".to_string(),
            action: Route::Direct,
            priority: 0,
        });

        let result = Context::assemble(config, vec![], Arc::new(ManualClock::new(0)));
        assert!(matches!(result, Err(ConfigError::InvalidRule { .. })));
    }

    #[tokio::test]
    async fn caches_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));

        let ctx = Context::assemble(config(dir.path()), vec![], clock.clone()).unwrap();
        ctx.domain_cache.put(
            "example.com",
            DomainRecord::new(vec!["93.184.216.34".parse().unwrap()]),
            Duration::from_secs(600),
        );
        ctx.ip_cache.update("example.com", Duration::from_secs(600), |m| {
            m.record_failure(TransportKind::Direct)
        });
        ctx.save_caches();

        let restored = Context::assemble(config(dir.path()), vec![], clock).unwrap();
        restored.load_caches();
        assert!(restored.domain_cache.get("example.com").is_some());
        assert_eq!(
            restored
                .ip_cache
                .get("example.com")
                .unwrap()
                .failures(TransportKind::Direct),
            1
        );
    }

    #[tokio::test]
    async fn missing_cache_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::assemble(config(dir.path()), vec![], Arc::new(ManualClock::new(0))).unwrap();

        ctx.load_caches();
        assert!(ctx.domain_cache.is_empty());
        assert!(ctx.ip_cache.is_empty());
    }
}
