//! Policy classification.
//!
//! Combines user rules, the advertisement list, the tunnel blocklist, geo-IP
//! data and learned connection failures into one routing verdict per
//! destination. Classification only reads state; failure counters are
//! written by the connection manager.

mod blocklist;
mod geoip;
mod rules;

pub use blocklist::{AD_DOMAINS, Blocklist, TUNNEL_DOMAINS};
pub use geoip::{GeoIpProvider, NoGeoIp, RangeTable};
pub use rules::{RuleSet, UserRule};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::TransportKind;
use crate::cache::{DomainRecord, HostMeta, RecordCache};
use crate::config::PolicyConfig;
use crate::resolver::DnsResolver;

/// Where traffic for a destination goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Direct,
    Tunnel,
    #[serde(alias = "block")]
    Blocked,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Tunnel => "tunnel",
            Route::Blocked => "blocked",
        }
    }
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Route::Direct),
            "tunnel" => Ok(Route::Tunnel),
            "blocked" | "block" => Ok(Route::Blocked),
            other => Err(format!("unknown route '{other}'")),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which classification step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    UserRule,
    AdBlock,
    Blocklist,
    GeoIp,
    LearnedFailure,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub route: Route,
    pub reason: Reason,
}

impl Verdict {
    pub const fn new(route: Route, reason: Reason) -> Self {
        Self { route, reason }
    }
}

/// Lowercase, strip a trailing dot and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase()
}

fn is_local_network(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

pub struct Classifier {
    rules: RwLock<RuleSet>,
    blocklist: Arc<Blocklist>,
    adlist: Option<Arc<Blocklist>>,
    geoip: Arc<dyn GeoIpProvider>,
    domain_cache: Arc<RecordCache<DomainRecord>>,
    ip_cache: Arc<RecordCache<HostMeta>>,
    resolver: Option<Arc<DnsResolver>>,
    country_code: String,
    auto_direct: bool,
    auto_direct6: bool,
    default_route: Route,
    failure_threshold: u32,
}

impl Classifier {
    pub fn new(
        config: &PolicyConfig,
        blocklist: Arc<Blocklist>,
        geoip: Arc<dyn GeoIpProvider>,
        domain_cache: Arc<RecordCache<DomainRecord>>,
        ip_cache: Arc<RecordCache<HostMeta>>,
    ) -> Self {
        Self {
            rules: RwLock::new(RuleSet::default()),
            blocklist,
            adlist: None,
            geoip,
            domain_cache,
            ip_cache,
            resolver: None,
            country_code: config.country_code.to_uppercase(),
            auto_direct: config.auto_direct,
            auto_direct6: config.auto_direct6,
            default_route: config.default_route,
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    pub fn with_rules(self, rules: Vec<UserRule>) -> Self {
        self.set_rules(rules);
        self
    }

    /// Enable the advertisement list.
    pub fn with_adlist(mut self, adlist: Arc<Blocklist>) -> Self {
        self.adlist = Some(adlist);
        self
    }

    /// Allow the geo-IP step to resolve uncached domains.
    pub fn with_resolver(mut self, resolver: Arc<DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the user rules.
    pub fn set_rules(&self, rules: Vec<UserRule>) {
        *self.rules.write() = RuleSet::new(rules);
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Classify a domain name or IP literal.
    ///
    /// Uncached domains are resolved when the geo-IP step or a network user
    /// rule needs an address; a resolution failure just skips those checks.
    pub async fn classify(&self, host: &str) -> Verdict {
        let host = normalize_host(host);
        let mut ips = self.known_addresses(&host);
        let network_rules = self.rules.read().has_network();

        if ips.is_empty() && (self.auto_direct || network_rules) && host.parse::<IpAddr>().is_err() {
            // A network rule may outrank whatever matches by name alone
            if !network_rules {
                if let Some(verdict) = self.list_verdict(&host, &ips) {
                    return verdict;
                }
            }
            if let Some(resolver) = &self.resolver {
                if let Ok(answer) = resolver.resolve(&host).await {
                    ips = answer.ips;
                }
            }
        }

        self.evaluate(&host, &ips)
    }

    /// Classify using only cached addresses. Never touches the network.
    pub fn classify_cached(&self, host: &str) -> Verdict {
        let host = normalize_host(host);
        let ips = self.known_addresses(&host);
        self.evaluate(&host, &ips)
    }

    /// Classify with explicitly supplied addresses.
    pub fn classify_with(&self, host: &str, ips: &[IpAddr]) -> Verdict {
        self.evaluate(&normalize_host(host), ips)
    }

    fn known_addresses(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        self.domain_cache
            .get(host)
            .map(DomainRecord::into_ips)
            .unwrap_or_default()
    }

    fn evaluate(&self, host: &str, ips: &[IpAddr]) -> Verdict {
        self.list_verdict(host, ips)
            .or_else(|| self.geo_verdict(ips))
            .or_else(|| self.learned_verdict(host))
            .unwrap_or(Verdict::new(self.default_route, Reason::Default))
    }

    /// User rules, then the advertisement list, then the tunnel blocklist.
    fn list_verdict(&self, host: &str, ips: &[IpAddr]) -> Option<Verdict> {
        if let Some(rule) = self.rules.read().find(host, ips) {
            return Some(Verdict::new(rule.action, Reason::UserRule));
        }
        if self.adlist.as_ref().is_some_and(|list| list.contains(host)) {
            return Some(Verdict::new(Route::Blocked, Reason::AdBlock));
        }
        if self.blocklist.contains(host) {
            return Some(Verdict::new(Route::Tunnel, Reason::Blocklist));
        }
        None
    }

    fn geo_verdict(&self, ips: &[IpAddr]) -> Option<Verdict> {
        if !self.auto_direct {
            return None;
        }
        let ip = *ips.first()?;
        if ip.is_ipv6() && !self.auto_direct6 {
            return None;
        }
        if is_local_network(ip) {
            return Some(Verdict::new(Route::Direct, Reason::GeoIp));
        }
        let region = self.geoip.lookup(ip)?;
        (region.eq_ignore_ascii_case(&self.country_code))
            .then_some(Verdict::new(Route::Direct, Reason::GeoIp))
    }

    fn learned_verdict(&self, host: &str) -> Option<Verdict> {
        let meta = self.ip_cache.get(host)?;
        (meta.failures(TransportKind::Direct) >= self.failure_threshold)
            .then_some(Verdict::new(Route::Tunnel, Reason::LearnedFailure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use std::time::Duration;

    struct FixedGeo;

    impl GeoIpProvider for FixedGeo {
        fn lookup(&self, ip: IpAddr) -> Option<String> {
            match ip {
                IpAddr::V4(v4) if v4.octets()[0] == 114 => Some("CN".to_string()),
                _ => Some("US".to_string()),
            }
        }
    }

    struct Fixture {
        classifier: Classifier,
        domain_cache: Arc<RecordCache<DomainRecord>>,
        ip_cache: Arc<RecordCache<HostMeta>>,
    }

    fn fixture(config: PolicyConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let domain_cache = Arc::new(RecordCache::new("domain", 100, clock.clone()));
        let ip_cache = Arc::new(RecordCache::new("ip", 100, clock));
        let classifier = Classifier::new(
            &config,
            Arc::new(Blocklist::from_domains(["blocked.example"])),
            Arc::new(FixedGeo),
            domain_cache.clone(),
            ip_cache.clone(),
        )
        .with_adlist(Arc::new(Blocklist::from_domains(["ads.example"])));

        Fixture {
            classifier,
            domain_cache,
            ip_cache,
        }
    }

    fn rule(pattern: &str, action: Route, priority: i32) -> UserRule {
        UserRule::parse(pattern, action, priority).unwrap()
    }

    #[test]
    fn blocklist_hit_tunnels() {
        let f = fixture(PolicyConfig::default());

        let verdict = f.classifier.classify_cached("www.Blocked.Example.");
        assert_eq!(verdict, Verdict::new(Route::Tunnel, Reason::Blocklist));
    }

    #[test]
    fn adlist_hit_blocks() {
        let f = fixture(PolicyConfig::default());

        let verdict = f.classifier.classify_cached("tracker.ads.example");
        assert_eq!(verdict, Verdict::new(Route::Blocked, Reason::AdBlock));
    }

    #[test]
    fn user_rule_overrides_lists() {
        let f = fixture(PolicyConfig::default());
        f.classifier.set_rules(vec![
            rule("blocked.example", Route::Direct, 0),
            rule("suffix:ads.example", Route::Tunnel, 0),
        ]);

        assert_eq!(f.classifier.classify_cached("blocked.example").route, Route::Direct);
        assert_eq!(f.classifier.classify_cached("x.ads.example").route, Route::Tunnel);
    }

    #[test]
    fn geo_match_goes_direct() {
        let f = fixture(PolicyConfig::default());
        f.domain_cache.put(
            "local.example",
            DomainRecord::new(vec!["114.114.114.114".parse().unwrap()]),
            Duration::from_secs(60),
        );

        let verdict = f.classifier.classify_cached("local.example");
        assert_eq!(verdict, Verdict::new(Route::Direct, Reason::GeoIp));
        assert_eq!(f.classifier.classify_cached("10.0.0.1").reason, Reason::GeoIp);
    }

    #[test]
    fn geo_step_disabled_by_auto_direct() {
        let f = fixture(PolicyConfig {
            auto_direct: false,
            default_route: Route::Tunnel,
            ..PolicyConfig::default()
        });

        let verdict = f.classifier.classify_cached("114.114.114.114");
        assert_eq!(verdict, Verdict::new(Route::Tunnel, Reason::Default));
    }

    #[test]
    fn ipv6_geo_needs_auto_direct6() {
        let f = fixture(PolicyConfig::default());
        assert_eq!(f.classifier.classify_cached("fd00::1").reason, Reason::Default);

        let f = fixture(PolicyConfig {
            auto_direct6: true,
            ..PolicyConfig::default()
        });
        assert_eq!(f.classifier.classify_cached("fd00::1").reason, Reason::GeoIp);
    }

    #[test]
    fn repeated_direct_failures_escalate_to_tunnel() {
        let f = fixture(PolicyConfig::default());
        let host = "flaky.example";

        for _ in 0..2 {
            f.ip_cache.update(host, Duration::from_secs(60), |m| {
                m.record_failure(TransportKind::Direct)
            });
        }
        assert_eq!(f.classifier.classify_cached(host).route, Route::Direct);

        f.ip_cache.update(host, Duration::from_secs(60), |m| {
            m.record_failure(TransportKind::Direct)
        });
        let verdict = f.classifier.classify_cached(host);
        assert_eq!(verdict, Verdict::new(Route::Tunnel, Reason::LearnedFailure));
    }

    #[test]
    fn default_route_when_nothing_matches() {
        let f = fixture(PolicyConfig::default());

        let verdict = f.classifier.classify_cached("unknown.example");
        assert_eq!(verdict, Verdict::new(Route::Direct, Reason::Default));
    }

    #[tokio::test]
    async fn classify_without_resolver_falls_back_to_default() {
        let f = fixture(PolicyConfig::default());

        let verdict = f.classifier.classify("uncached.example").await;
        assert_eq!(verdict.reason, Reason::Default);
    }

    struct Answers(&'static str);

    #[async_trait::async_trait]
    impl crate::resolver::ResolveStrategy for Answers {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn lookup(&self, _domain: &str) -> Result<crate::resolver::Lookup, crate::error::ResolutionError> {
            Ok(crate::resolver::Lookup {
                ips: vec![self.0.parse().unwrap()],
                ttl: None,
            })
        }
    }

    #[tokio::test]
    async fn network_rule_resolves_uncached_domain() {
        let clock = Arc::new(ManualClock::new(0));
        let domain_cache = Arc::new(RecordCache::new("domain", 100, clock.clone()));
        let strategy: Arc<dyn crate::resolver::ResolveStrategy> = Arc::new(Answers("10.1.1.1"));
        let resolver = Arc::new(DnsResolver::new(
            vec![strategy],
            domain_cache.clone(),
            &crate::config::ResolverConfig::default(),
            &crate::config::CacheConfig::default(),
        ));
        let config = PolicyConfig {
            auto_direct: false,
            ..PolicyConfig::default()
        };
        let classifier = Classifier::new(
            &config,
            Arc::new(Blocklist::from_domains(["intranet.test"])),
            Arc::new(NoGeoIp),
            domain_cache,
            Arc::new(RecordCache::new("ip", 100, clock)),
        )
        .with_resolver(resolver)
        .with_rules(vec![rule("10.0.0.0/8", Route::Blocked, 0)]);

        let verdict = classifier.classify("intranet.test").await;
        assert_eq!(verdict, Verdict::new(Route::Blocked, Reason::UserRule));

        // Without a network rule the name lists decide and nothing resolves
        classifier.set_rules(vec![]);
        let verdict = classifier.classify("other.test").await;
        assert_eq!(verdict, Verdict::new(Route::Direct, Reason::Default));
    }

    #[test]
    fn route_parsing() {
        assert_eq!("block".parse::<Route>().unwrap(), Route::Blocked);
        assert!("sideways".parse::<Route>().is_err());
        assert_eq!(Route::Tunnel.to_string(), "tunnel");
    }
}
