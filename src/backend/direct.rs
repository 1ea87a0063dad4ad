//! Direct connections, optionally dialed through a proxy on the local network.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Backend, BoxStream, Credentials, Destination, TransportKind, http, socks};
use crate::config::{LanProxyConfig, LanProxyKind};
use crate::error::ConnectError;
use crate::resolver::DnsResolver;

/// Upstream proxy every direct connection goes through. The destination
/// name is handed to the proxy unresolved.
#[derive(Debug, Clone)]
pub struct LanProxy {
    pub kind: LanProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl LanProxy {
    /// `None` unless the section is enabled.
    pub fn from_config(config: &LanProxyConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let credentials = config.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: config.password.clone().unwrap_or_default(),
        });
        Some(Self {
            kind: config.kind,
            host: config.host.trim().to_string(),
            port: config.port,
            credentials,
        })
    }

    async fn open(&self, dest: &Destination) -> Result<TcpStream, ConnectError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(ConnectError::from_io)?;
        let _ = stream.set_nodelay(true);

        let auth = self.credentials.as_ref();
        match self.kind {
            LanProxyKind::Http => http::request_connect(&mut stream, dest, auth).await?,
            LanProxyKind::Socks5 => socks::negotiate(&mut stream, dest, auth)
                .await
                .map_err(ConnectError::from_io)??,
        }
        trace!(proxy = %self.host, port = self.port, %dest, "connected through lan proxy");
        Ok(stream)
    }
}

/// Plain TCP connect after local resolution.
pub struct DirectBackend {
    resolver: Arc<DnsResolver>,
    connect_timeout: Duration,
    lan_proxy: Option<LanProxy>,
}

impl DirectBackend {
    pub fn new(resolver: Arc<DnsResolver>, connect_timeout: Duration) -> Self {
        Self {
            resolver,
            connect_timeout,
            lan_proxy: None,
        }
    }

    pub fn with_lan_proxy(mut self, proxy: Option<LanProxy>) -> Self {
        self.lan_proxy = proxy;
        self
    }

    async fn connect_any(&self, addrs: &[SocketAddr]) -> Result<TcpStream, ConnectError> {
        // Split the budget so a dead first address leaves time for the rest
        let per_addr = self.connect_timeout / addrs.len().clamp(1, 4) as u32;
        let mut last_err = ConnectError::Timeout;

        for addr in addrs {
            match tokio::time::timeout(per_addr, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    trace!(%addr, error = %e, "direct connect failed");
                    last_err = ConnectError::from_io(e);
                }
                Err(_) => {
                    trace!(%addr, "direct connect timed out");
                    last_err = ConnectError::Timeout;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Backend for DirectBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn open_stream(&self, dest: &Destination) -> Result<BoxStream, ConnectError> {
        if let Some(proxy) = &self.lan_proxy {
            let stream = tokio::time::timeout(self.connect_timeout, proxy.open(dest))
                .await
                .map_err(|_| ConnectError::Timeout)??;
            return Ok(Box::new(stream));
        }

        let (ips, resolved) = match dest.ip() {
            Some(ip) => (vec![ip], false),
            None => {
                let answer = self
                    .resolver
                    .resolve(&dest.host)
                    .await
                    .map_err(|e| ConnectError::Refused(format!("resolve {}: {e}", dest.host)))?;
                (answer.ips, true)
            }
        };

        let addrs: Vec<SocketAddr> = ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, dest.port))
            .collect();

        match self.connect_any(&addrs).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                if resolved {
                    debug!(host = %dest.host, "every address failed, dropping cached answer");
                    self.resolver.invalidate(&dest.host);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DomainRecord, ManualClock, RecordCache};
    use crate::config::{CacheConfig, ResolverConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn resolver() -> (Arc<DnsResolver>, Arc<RecordCache<DomainRecord>>) {
        let cache = Arc::new(RecordCache::new("domain", 16, Arc::new(ManualClock::new(0))));
        let resolver = DnsResolver::new(
            vec![],
            cache.clone(),
            &ResolverConfig::default(),
            &CacheConfig::default(),
        );
        (Arc::new(resolver), cache)
    }

    #[tokio::test]
    async fn connects_to_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (resolver, _) = resolver();
        let direct = DirectBackend::new(resolver, Duration::from_secs(1));

        let stream = direct.open_stream(&Destination::from(addr)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn failure_invalidates_cached_answer() {
        // Bind then drop to get a port that refuses
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (resolver, cache) = resolver();
        cache.put(
            "dead.example",
            DomainRecord::new(vec!["127.0.0.1".parse().unwrap()]),
            Duration::from_secs(60),
        );
        let direct = DirectBackend::new(resolver, Duration::from_secs(1));

        let result = direct.open_stream(&Destination::new("dead.example", port)).await;
        assert!(result.is_err());
        assert!(cache.get("dead.example").is_none());
    }

    #[tokio::test]
    async fn dials_through_lan_http_proxy_without_resolving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"HTTP/1.1 200 OK\r\n\r\nhi").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let (resolver, _) = resolver();
        let lan = LanProxyConfig {
            enabled: true,
            kind: LanProxyKind::Http,
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            username: Some("alice".to_string()),
            password: Some("pw".to_string()),
        };
        let direct = DirectBackend::new(resolver.clone(), Duration::from_secs(1))
            .with_lan_proxy(LanProxy::from_config(&lan));

        let mut stream = direct
            .open_stream(&Destination::new("far.example", 443))
            .await
            .unwrap();
        let mut payload = [0u8; 2];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hi");

        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT far.example:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic YWxpY2U6cHc=\r\n"));
        assert_eq!(resolver.race_count(), 0);
    }

    #[tokio::test]
    async fn refused_by_lan_socks_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            // No acceptable method
            socket.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let (resolver, _) = resolver();
        let lan = LanProxyConfig {
            enabled: true,
            kind: LanProxyKind::Socks5,
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            ..LanProxyConfig::default()
        };
        let direct = DirectBackend::new(resolver, Duration::from_secs(1))
            .with_lan_proxy(LanProxy::from_config(&lan));

        let result = direct.open_stream(&Destination::new("far.example", 443)).await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }

    #[test]
    fn disabled_section_means_no_proxy() {
        assert!(LanProxy::from_config(&LanProxyConfig::default()).is_none());
    }
}
