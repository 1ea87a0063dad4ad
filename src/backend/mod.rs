//! Backend transports.
//!
//! A backend opens a byte stream to a destination: directly, or through one
//! of the local tunnel clients. Tunnel backends can also resolve names on
//! the far side of the tunnel.

mod direct;
mod http;
mod socks;

pub use direct::{DirectBackend, LanProxy};
pub use http::HttpConnectBackend;
pub use socks::Socks5Backend;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::dns::{self, TYPE_A, TYPE_AAAA};
use crate::error::{ConnectError, ResolutionError};
use crate::resolver::Lookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    /// HTTP CONNECT tunnel client
    Http,
    /// SOCKS5 tunnel client
    Socks,
}

impl TransportKind {
    pub const COUNT: usize = 3;
    pub const ALL: [TransportKind; Self::COUNT] =
        [TransportKind::Direct, TransportKind::Http, TransportKind::Socks];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Http => "http",
            TransportKind::Socks => "socks",
        }
    }

    pub fn is_tunnel(self) -> bool {
        self != TransportKind::Direct
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(TransportKind::Direct),
            "http" => Ok(TransportKind::Http),
            "socks" => Ok(TransportKind::Socks),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything a proxied connection can be spliced onto.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Target of a proxied connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Domain name or IP literal, without brackets
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// An IP literal or a well-formed domain name.
    pub fn has_valid_host(&self) -> bool {
        self.ip().is_some() || crate::dns::is_valid_name(&self.host)
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match self.ip() {
            Some(IpAddr::V6(v6)) => format!("[{v6}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the backend is worth trying right now.
    fn is_available(&self) -> bool {
        true
    }

    async fn open_stream(&self, dest: &Destination) -> Result<BoxStream, ConnectError>;

    /// Resolve `domain` on the far side of the tunnel.
    async fn resolve_via_tunnel(&self, _domain: &str) -> Result<Lookup, ResolutionError> {
        Err(ResolutionError::NoAnswer)
    }
}

/// Username and password presented to an upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Backends by kind. A kind with no configured backend is simply absent.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    slots: [Option<Arc<dyn Backend>>; TransportKind::COUNT],
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let index = backend.kind().index();
        self.slots[index] = Some(backend);
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Backend>> {
        self.slots[kind.index()].clone()
    }

    /// Registered tunnel backends in `order`.
    pub fn tunnels(&self, order: &[TransportKind]) -> Vec<Arc<dyn Backend>> {
        order
            .iter()
            .filter(|kind| kind.is_tunnel())
            .filter_map(|kind| self.get(*kind))
            .collect()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(|kind| self.slots[kind.index()].is_some())
            .collect()
    }
}

/// Marks a tunnel client as down for a while after it refused us.
#[derive(Debug, Default)]
pub(crate) struct Health {
    down_until: Mutex<Option<Instant>>,
}

impl Health {
    pub fn is_up(&self) -> bool {
        match *self.down_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn mark_down(&self, period: Duration) {
        *self.down_until.lock() = Some(Instant::now() + period);
    }

    pub fn mark_up(&self) {
        *self.down_until.lock() = None;
    }
}

/// How long a tunnel client that refused the control connection is skipped.
pub(crate) const DOWN_PERIOD: Duration = Duration::from_secs(10);

/// Connect to a local tunnel client, tracking its health.
pub(crate) async fn connect_tunnel(
    server: SocketAddr,
    health: &Health,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    match tokio::time::timeout(timeout, TcpStream::connect(server)).await {
        Ok(Ok(stream)) => {
            health.mark_up();
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => {
            health.mark_down(DOWN_PERIOD);
            Err(ConnectError::from_io(e))
        }
        Err(_) => Err(ConnectError::Timeout),
    }
}

/// Resolve A and AAAA for `domain` over a DNS-over-TCP stream.
pub async fn dns_over_stream<S>(
    stream: &mut S,
    domain: &str,
    timeout: Duration,
) -> Result<Lookup, ResolutionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::time::timeout(timeout, exchange_tcp(stream, domain))
        .await
        .map_err(|_| ResolutionError::Timeout)?
}

async fn exchange_tcp<S>(stream: &mut S, domain: &str) -> Result<Lookup, ResolutionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut lookup = Lookup::default();
    let mut last_err = ResolutionError::NoAnswer;

    for qtype in [TYPE_A, TYPE_AAAA] {
        let id: u16 = rand::random();
        let query = dns::build_query(id, domain, qtype);

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(&query);
        stream
            .write_all(&framed)
            .await
            .map_err(|_| ResolutionError::NoAnswer)?;

        let mut len = [0u8; 2];
        stream
            .read_exact(&mut len)
            .await
            .map_err(|_| ResolutionError::NoAnswer)?;
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|_| ResolutionError::NoAnswer)?;

        match dns::parse_answer(&response, id) {
            Ok(answer) => lookup.merge(answer.into()),
            Err(e) => last_err = e,
        }
    }

    if lookup.ips.is_empty() {
        Err(last_err)
    } else {
        Ok(lookup)
    }
}
