//! Daemon configuration.
//!
//! Loaded from a TOML file. Every section has defaults, so an empty file (or
//! no file at all) gives a working loopback-only setup.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::TransportKind;
use crate::error::ConfigError;
use crate::policy::{Route, UserRule};
use crate::resolver::StrategyKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dns: DnsConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub proxy: ProxyConfig,
    pub policy: PolicyConfig,
    pub connect: ConnectConfig,
    pub backends: BackendsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::NotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Check value ranges and compile user rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dns.port == 0 {
            return Err(ConfigError::invalid_value("dns.port", "must be 1-65535"));
        }
        if self.dns.backup_port == Some(0) {
            return Err(ConfigError::invalid_value("dns.backup_port", "must be 1-65535"));
        }
        if self.proxy.port == 0 {
            return Err(ConfigError::invalid_value("proxy.port", "must be 1-65535"));
        }
        if self.resolver.min_ttl_secs > self.resolver.max_ttl_secs {
            return Err(ConfigError::invalid_value(
                "resolver.min_ttl_secs",
                "must not exceed resolver.max_ttl_secs",
            ));
        }
        if self.resolver.strategies.is_empty() {
            return Err(ConfigError::invalid_value(
                "resolver.strategies",
                "at least one strategy is required",
            ));
        }
        if self.cache.domain_capacity == 0 || self.cache.ip_capacity == 0 {
            return Err(ConfigError::invalid_value("cache", "capacities must be non-zero"));
        }
        if self.policy.failure_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "policy.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.connect.order.contains(&TransportKind::Direct) {
            return Err(ConfigError::invalid_value(
                "connect.order",
                "only tunnel transports may be listed",
            ));
        }
        self.connect.lan_proxy.validate()?;
        self.dns.intercept_network()?;
        self.policy.compile_rules()?;

        Ok(())
    }

    /// Addresses the proxy front-end listens on.
    ///
    /// Remote access replaces the configured addresses with the wildcard.
    pub fn proxy_listen_addrs(&self) -> Vec<SocketAddr> {
        if self.proxy.allow_remote {
            return vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.proxy.port)];
        }
        self.proxy
            .bind_ips
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.proxy.port))
            .collect()
    }

    /// Addresses the DNS responder listens on (without port).
    ///
    /// Remote access adds the wildcard next to the configured addresses.
    pub fn dns_listen_ips(&self) -> Vec<IpAddr> {
        let mut ips = self.dns.bind_ips.clone();
        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        if self.proxy.allow_remote && !ips.contains(&wildcard) {
            ips.push(wildcard);
        }
        ips
    }
}

/// How BLOCKED domains are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockResponse {
    Nxdomain,
    /// Answer with 0.0.0.0 / ::
    Sink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub bind_ips: Vec<IpAddr>,
    pub port: u16,
    /// Used when the primary port cannot be bound
    pub backup_port: Option<u16>,
    pub query_timeout_ms: u64,
    pub block_response: BlockResponse,
    /// Pool that TUNNEL answers are allocated from
    pub intercept_range: String,
    pub intercept_capacity: usize,
    pub intercept_ttl_secs: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: 53,
            backup_port: Some(8053),
            query_timeout_ms: 5000,
            block_response: BlockResponse::Nxdomain,
            intercept_range: "198.18.0.0/15".to_string(),
            intercept_capacity: 4096,
            intercept_ttl_secs: 60,
        }
    }
}

impl DnsConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn intercept_network(&self) -> Result<ipnet::Ipv4Net, ConfigError> {
        let net: ipnet::Ipv4Net = self
            .intercept_range
            .parse()
            .map_err(|_| ConfigError::invalid_value("dns.intercept_range", "not an IPv4 CIDR"))?;
        if net.prefix_len() > 30 {
            return Err(ConfigError::invalid_value(
                "dns.intercept_range",
                "range is too small",
            ));
        }
        Ok(net)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Strategies raced for every resolution
    pub strategies: Vec<StrategyKind>,
    /// Public servers queried by the upstream strategy
    pub upstreams: Vec<SocketAddr>,
    pub strategy_timeout_ms: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategies: vec![StrategyKind::System, StrategyKind::Upstream, StrategyKind::Tunnel],
            upstreams: vec![
                SocketAddr::from(([8, 8, 8, 8], 53)),
                SocketAddr::from(([1, 1, 1, 1], 53)),
            ],
            strategy_timeout_ms: 3000,
            min_ttl_secs: 60,
            max_ttl_secs: 86400,
        }
    }
}

impl ResolverConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    /// Clamp an advertised TTL into the configured window.
    pub fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(
            Duration::from_secs(self.min_ttl_secs),
            Duration::from_secs(self.max_ttl_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub domain_path: PathBuf,
    pub ip_path: PathBuf,
    pub domain_capacity: usize,
    pub ip_capacity: usize,
    /// TTL for answers that carry none (system resolution)
    pub dns_ttl_secs: u64,
    /// Lifetime of routing metadata
    pub ip_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub save_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            domain_path: PathBuf::from("data/domain_records.txt"),
            ip_path: PathBuf::from("data/ip_records.txt"),
            domain_capacity: 200,
            ip_capacity: 1000,
            dns_ttl_secs: 30 * 60,
            ip_ttl_secs: 7 * 24 * 3600,
            sweep_interval_secs: 60,
            save_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn ip_ttl(&self) -> Duration {
        Duration::from_secs(self.ip_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_ips: Vec<IpAddr>,
    pub port: u16,
    /// Listen on all interfaces
    pub allow_remote: bool,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port: 8086,
            allow_remote: false,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
        }
    }
}

impl ProxyConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// A user rule as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub action: Route,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Region whose addresses go direct
    pub country_code: String,
    pub auto_direct: bool,
    /// Apply geo matching to IPv6 destinations too
    pub auto_direct6: bool,
    pub default_route: Route,
    /// Consecutive direct failures before a destination is tunneled
    pub failure_threshold: u32,
    pub block_advertisement: bool,
    pub blocklist_path: Option<PathBuf>,
    pub adlist_path: Option<PathBuf>,
    pub geoip_path: Option<PathBuf>,
    pub rules: Vec<RuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            country_code: "CN".to_string(),
            auto_direct: true,
            auto_direct6: false,
            default_route: Route::Direct,
            failure_threshold: 3,
            block_advertisement: true,
            blocklist_path: None,
            adlist_path: None,
            geoip_path: None,
            rules: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn compile_rules(&self) -> Result<Vec<UserRule>, ConfigError> {
        self.rules
            .iter()
            .map(|r| UserRule::parse(&r.pattern, r.action, r.priority))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Tunnel preference order
    pub order: Vec<TransportKind>,
    pub connect_timeout_ms: u64,
    /// Upper bound on the whole failover sequence
    pub max_select_ms: u64,
    pub split_sni: bool,
    pub pool_enabled: bool,
    pub pool_idle_secs: u64,
    pub lan_proxy: LanProxyConfig,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            order: vec![TransportKind::Http, TransportKind::Socks],
            connect_timeout_ms: 4000,
            max_select_ms: 10_000,
            split_sni: true,
            pool_enabled: true,
            pool_idle_secs: 30,
            lan_proxy: LanProxyConfig::default(),
        }
    }
}

impl ConnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_select(&self) -> Duration {
        Duration::from_millis(self.max_select_ms)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanProxyKind {
    #[default]
    Http,
    Socks5,
}

/// Proxy on the local network that direct connections must go through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanProxyConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: LanProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl LanProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid_value("connect.lan_proxy.host", "required when enabled"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid_value("connect.lan_proxy.port", "must be 1-65535"));
        }
        let too_long = |v: &Option<String>| v.as_ref().is_some_and(|s| s.len() > 255);
        if too_long(&self.username) || too_long(&self.password) {
            return Err(ConfigError::invalid_value(
                "connect.lan_proxy",
                "username and password are limited to 255 bytes",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::invalid_value("connect.lan_proxy.password", "needs a username"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Local HTTP-CONNECT tunnel endpoint
    pub http: Option<SocketAddr>,
    /// Local SOCKS5 tunnel endpoint
    pub socks: Option<SocketAddr>,
    /// DNS server queried through a tunnel
    pub tunnel_dns: SocketAddr,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            http: None,
            socks: None,
            tunnel_dns: SocketAddr::from(([8, 8, 8, 8], 53)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            stats_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.dns.port, 53);
        assert_eq!(config.dns.backup_port, Some(8053));
        assert_eq!(config.proxy.port, 8086);
        assert_eq!(config.cache.domain_capacity, 200);
        assert_eq!(config.cache.ip_capacity, 1000);
        assert_eq!(config.policy.country_code, "CN");
        assert!(config.connect.split_sni);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_sections_and_rules() {
        let config = Config::from_toml(
            r#"
            [dns]
            port = 5353
            block_response = "sink"

            [policy]
            default_route = "tunnel"
            rules = [
                { pattern = "example.com", action = "direct", priority = 10 },
                { pattern = "10.0.0.0/8", action = "blocked" },
            ]

            [connect]
            order = ["socks", "http"]
            "#,
        )
        .unwrap();

        assert_eq!(config.dns.port, 5353);
        assert_eq!(config.dns.block_response, BlockResponse::Sink);
        assert_eq!(config.policy.default_route, Route::Tunnel);
        assert_eq!(config.connect.order, vec![TransportKind::Socks, TransportKind::Http]);
        assert_eq!(config.policy.compile_rules().unwrap().len(), 2);
    }

    #[test]
    fn lan_proxy_section() {
        let config = Config::from_toml(
            r#"
            [connect.lan_proxy]
            enabled = true
            type = "socks5"
            host = "192.168.1.2"
            port = 1080
            username = "me"
            password = "secret"
            "#,
        )
        .unwrap();

        let lan = &config.connect.lan_proxy;
        assert!(lan.enabled);
        assert_eq!(lan.kind, LanProxyKind::Socks5);
        assert_eq!(lan.port, 1080);
        assert!(config.validate().is_ok());

        assert!(!Config::default().connect.lan_proxy.enabled);

        let mut config = config;
        config.connect.lan_proxy.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_rule() {
        let mut config = Config::default();
        config.policy.rules.push(RuleConfig {
            pattern: "10.0.0.0/40".to_string(),
            action: Route::Direct,
            priority: 0,
        });

        assert!(matches!(config.validate(), Err(ConfigError::InvalidRule { .. })));
    }

    #[test]
    fn validate_rejects_inverted_ttl_window() {
        let mut config = Config::default();
        config.resolver.min_ttl_secs = 100;
        config.resolver.max_ttl_secs = 10;

        assert!(config.validate().is_err());
    }

    #[test]
    fn allow_remote_rewrites_listen_addresses() {
        let mut config = Config::default();
        assert_eq!(config.proxy_listen_addrs(), vec!["127.0.0.1:8086".parse().unwrap()]);

        config.proxy.allow_remote = true;
        assert_eq!(config.proxy_listen_addrs(), vec!["0.0.0.0:8086".parse().unwrap()]);
        assert_eq!(config.dns_listen_ips().len(), 2);
    }

    #[test]
    fn ttl_clamping() {
        let resolver = ResolverConfig::default();

        assert_eq!(resolver.clamp_ttl(Duration::from_secs(5)), Duration::from_secs(60));
        assert_eq!(resolver.clamp_ttl(Duration::from_secs(600)), Duration::from_secs(600));
        assert_eq!(
            resolver.clamp_ttl(Duration::from_secs(1_000_000)),
            Duration::from_secs(86400)
        );
    }
}
