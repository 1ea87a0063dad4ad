//! Resolution strategies raced by the resolver.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::backend::Backend;
use crate::dns::{self, TYPE_A, TYPE_AAAA};
use crate::error::ResolutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// The operating system resolver
    System,
    /// Public servers queried over UDP
    Upstream,
    /// Through the first available tunnel
    Tunnel,
}

/// Addresses returned by one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lookup {
    pub ips: Vec<IpAddr>,
    /// Advertised TTL, when the strategy has one
    pub ttl: Option<Duration>,
}

impl Lookup {
    pub fn merge(&mut self, other: Lookup) {
        for ip in other.ips {
            if !self.ips.contains(&ip) {
                self.ips.push(ip);
            }
        }
        self.ttl = match (self.ttl, other.ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

impl From<dns::ParsedAnswer> for Lookup {
    fn from(answer: dns::ParsedAnswer) -> Self {
        Self {
            ips: answer.ips,
            ttl: answer.min_ttl.map(|t| Duration::from_secs(t as u64)),
        }
    }
}

#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, domain: &str) -> Result<Lookup, ResolutionError>;
}

/// Resolution through the operating system.
pub struct SystemStrategy;

#[async_trait]
impl ResolveStrategy for SystemStrategy {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn lookup(&self, domain: &str) -> Result<Lookup, ResolutionError> {
        let addrs = tokio::net::lookup_host((domain, 0))
            .await
            .map_err(|_| ResolutionError::NoAnswer)?;

        let mut lookup = Lookup::default();
        for addr in addrs {
            if !lookup.ips.contains(&addr.ip()) {
                lookup.ips.push(addr.ip());
            }
        }
        Ok(lookup)
    }
}

/// Races A+AAAA queries against several public servers; the first server
/// with a non-empty answer wins.
pub struct UpstreamStrategy {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UpstreamStrategy {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    async fn query_server(&self, server: SocketAddr, domain: &str) -> Result<Lookup, ResolutionError> {
        let (v4, v6) = tokio::join!(
            query_udp(server, domain, TYPE_A, self.timeout),
            query_udp(server, domain, TYPE_AAAA, self.timeout),
        );

        match (v4, v6) {
            (Ok(mut a), Ok(b)) => {
                a.merge(b);
                Ok(a)
            }
            (Ok(a), Err(_)) | (Err(_), Ok(a)) => Ok(a),
            (Err(e), Err(_)) => Err(e),
        }
    }
}

#[async_trait]
impl ResolveStrategy for UpstreamStrategy {
    fn name(&self) -> &'static str {
        "upstream"
    }

    async fn lookup(&self, domain: &str) -> Result<Lookup, ResolutionError> {
        let mut pending: FuturesUnordered<_> = self
            .servers
            .iter()
            .map(|server| self.query_server(*server, domain))
            .collect();

        let mut last_err = ResolutionError::NoAnswer;
        while let Some(result) = pending.next().await {
            match result {
                Ok(lookup) if !lookup.ips.is_empty() => return Ok(lookup),
                Ok(_) => last_err = ResolutionError::NoAnswer,
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// One UDP exchange with `server`.
pub async fn query_udp(
    server: SocketAddr,
    domain: &str,
    qtype: u16,
    timeout: Duration,
) -> Result<Lookup, ResolutionError> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    tokio::time::timeout(timeout, exchange_udp(local, server, domain, qtype))
        .await
        .map_err(|_| ResolutionError::Timeout)?
}

async fn exchange_udp(
    local: SocketAddr,
    server: SocketAddr,
    domain: &str,
    qtype: u16,
) -> Result<Lookup, ResolutionError> {
    let socket = UdpSocket::bind(local).await.map_err(|_| ResolutionError::NoAnswer)?;
    socket.connect(server).await.map_err(|_| ResolutionError::NoAnswer)?;

    let id: u16 = rand::random();
    let query = dns::build_query(id, domain, qtype);
    socket.send(&query).await.map_err(|_| ResolutionError::NoAnswer)?;

    let mut buf = vec![0u8; 4096];
    loop {
        let len = socket.recv(&mut buf).await.map_err(|_| ResolutionError::NoAnswer)?;
        match dns::parse_answer(&buf[..len], id) {
            // Stray datagram with another id; keep waiting
            Err(ResolutionError::Malformed) if len >= 2 && buf[..2] != id.to_be_bytes() => {
                trace!(%server, "ignoring mismatched dns reply");
            }
            other => return other.map(Lookup::from),
        }
    }
}

/// Resolution through tunnel backends, in preference order.
pub struct TunnelStrategy {
    tunnels: Vec<Arc<dyn Backend>>,
}

impl TunnelStrategy {
    pub fn new(tunnels: Vec<Arc<dyn Backend>>) -> Self {
        Self { tunnels }
    }
}

#[async_trait]
impl ResolveStrategy for TunnelStrategy {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    async fn lookup(&self, domain: &str) -> Result<Lookup, ResolutionError> {
        let mut last_err = ResolutionError::NoAnswer;
        for tunnel in self.tunnels.iter().filter(|t| t.is_available()) {
            match tunnel.resolve_via_tunnel(domain).await {
                Ok(lookup) if !lookup.ips.is_empty() => return Ok(lookup),
                Ok(_) => last_err = ResolutionError::NoAnswer,
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}
