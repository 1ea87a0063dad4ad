//! HTTP CONNECT tunnel client.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{
    Backend, BoxStream, Credentials, Destination, Health, TransportKind, connect_tunnel, dns_over_stream,
};
use crate::error::{ConnectError, ResolutionError};
use crate::resolver::Lookup;

/// Longest response header block accepted from the tunnel.
const MAX_HEADER_LEN: usize = 8192;

pub struct HttpConnectBackend {
    server: SocketAddr,
    tunnel_dns: SocketAddr,
    timeout: Duration,
    health: Health,
}

impl HttpConnectBackend {
    pub fn new(server: SocketAddr, tunnel_dns: SocketAddr, timeout: Duration) -> Self {
        Self {
            server,
            tunnel_dns,
            timeout,
            health: Health::default(),
        }
    }

    async fn handshake(&self, dest: &Destination) -> Result<TcpStream, ConnectError> {
        let mut stream = connect_tunnel(self.server, &self.health, self.timeout).await?;
        request_connect(&mut stream, dest, None).await?;
        Ok(stream)
    }
}

/// Send CONNECT for `dest` and wait for the 200. Payload after the response
/// head is left unread.
pub(crate) async fn request_connect<S>(
    stream: &mut S,
    dest: &Destination,
    auth: Option<&Credentials>,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = dest.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = auth {
        let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ConnectError::from_io)?;

    let head = read_response_head(stream).await?;
    let status = status_code(&head)
        .ok_or_else(|| ConnectError::Refused("malformed CONNECT response".to_string()))?;
    if status != 200 {
        debug!(%dest, status, "proxy refused CONNECT");
        return Err(ConnectError::Refused(format!("proxy answered {status}")));
    }
    Ok(())
}

/// Read up to and including the blank line ending the header block.
///
/// Reads byte-wise so no tunneled payload is consumed.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ConnectError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEADER_LEN {
            return Err(ConnectError::Refused("oversized CONNECT response".to_string()));
        }
        let n = stream.read(&mut byte).await.map_err(ConnectError::from_io)?;
        if n == 0 {
            return Err(ConnectError::Refused("tunnel closed during CONNECT".to_string()));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn status_code(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[async_trait]
impl Backend for HttpConnectBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn is_available(&self) -> bool {
        self.health.is_up()
    }

    async fn open_stream(&self, dest: &Destination) -> Result<BoxStream, ConnectError> {
        let stream = self.handshake(dest).await?;
        Ok(Box::new(stream))
    }

    async fn resolve_via_tunnel(&self, domain: &str) -> Result<Lookup, ResolutionError> {
        let mut stream = self
            .handshake(&Destination::from(self.tunnel_dns))
            .await
            .map_err(|_| ResolutionError::NoAnswer)?;
        dns_over_stream(&mut stream, domain, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_tunnel(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[test]
    fn parses_status_line() {
        assert_eq!(status_code("HTTP/1.1 200 Connection established\r\n\r\n"), Some(200));
        assert_eq!(status_code("HTTP/1.0 403 Forbidden\r\n"), Some(403));
        assert_eq!(status_code("SSH-2.0-OpenSSH\r\n"), None);
    }

    #[tokio::test]
    async fn connect_succeeds_and_keeps_payload() {
        let addr = fake_tunnel("HTTP/1.1 200 OK\r\nProxy-Agent: test\r\n\r\nhello").await;
        let backend = HttpConnectBackend::new(addr, addr, Duration::from_secs(2));

        let mut stream = backend
            .open_stream(&Destination::new("example.com", 443))
            .await
            .unwrap();
        let mut payload = [0u8; 5];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn credentials_become_basic_auth() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        let auth = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };

        let proxy = tokio::spawn(async move {
            let head = read_response_head(&mut far).await.unwrap();
            far.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            head
        });
        request_connect(&mut near, &Destination::new("example.com", 443), Some(&auth))
            .await
            .unwrap();

        let head = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn non_200_is_refused() {
        let addr = fake_tunnel("HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        let backend = HttpConnectBackend::new(addr, addr, Duration::from_secs(2));

        let result = backend.open_stream(&Destination::new("example.com", 443)).await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
        assert!(backend.is_available(), "the tunnel itself answered");
    }

    #[tokio::test]
    async fn unreachable_tunnel_is_marked_down() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let backend = HttpConnectBackend::new(addr, addr, Duration::from_secs(2));
        let result = backend.open_stream(&Destination::new("example.com", 443)).await;
        assert!(result.is_err());
        assert!(!backend.is_available());
    }
}
