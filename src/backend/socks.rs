//! SOCKS5 client (CONNECT only). Tunnels need no authentication; a LAN
//! proxy may ask for username and password.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{
    Backend, BoxStream, Credentials, Destination, Health, TransportKind, connect_tunnel, dns_over_stream,
};
use crate::error::{ConnectError, ResolutionError};
use crate::resolver::Lookup;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

pub struct Socks5Backend {
    server: SocketAddr,
    tunnel_dns: SocketAddr,
    timeout: Duration,
    health: Health,
}

impl Socks5Backend {
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
        negotiate(&mut stream, dest, None)
            .await
            .map_err(ConnectError::from_io)?
            .map(|()| stream)
    }
}

/// Greeting, optional RFC 1929 login, CONNECT request and reply. The outer
/// `io::Result` carries transport errors, the inner one protocol refusals.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    dest: &Destination,
    auth: Option<&Credentials>,
) -> std::io::Result<Result<(), ConnectError>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match auth {
        Some(_) => stream.write_all(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]).await?,
        None => stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?,
    }
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    match (choice, auth) {
        ([VERSION, METHOD_NO_AUTH], _) => {}
        ([VERSION, METHOD_USER_PASS], Some(auth)) => {
            let Some(login) = login_request(auth) else {
                return Ok(Err(ConnectError::Refused("socks credentials too long".to_string())));
            };
            stream.write_all(&login).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Ok(Err(ConnectError::Refused("socks login rejected".to_string())));
            }
        }
        _ => {
            return Ok(Err(ConnectError::Refused(
                "socks method negotiation failed".to_string(),
            )));
        }
    }

    let Some(request) = connect_request(dest) else {
        return Ok(Err(ConnectError::Refused("host name too long".to_string())));
    };
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Ok(Err(ConnectError::Refused("not a socks5 reply".to_string())));
    }
    if head[1] != 0x00 {
        return Ok(Err(ConnectError::Refused(format!(
            "socks reply code {:#04x}",
            head[1]
        ))));
    }

    // Bound address, unused
    let skip = match head[3] {
        ATYP_V4 => 4 + 2,
        ATYP_V6 => 16 + 2,
        ATYP_DOMAIN => stream.read_u8().await? as usize + 2,
        _ => return Ok(Err(ConnectError::Refused("bad socks address type".to_string()))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(Ok(()))
}

fn login_request(auth: &Credentials) -> Option<Vec<u8>> {
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(USER_PASS_VERSION);
    req.push(u8::try_from(user.len()).ok()?);
    req.extend_from_slice(user);
    req.push(u8::try_from(pass.len()).ok()?);
    req.extend_from_slice(pass);
    Some(req)
}

fn connect_request(dest: &Destination) -> Option<Vec<u8>> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    match dest.ip() {
        Some(IpAddr::V4(v4)) => {
            req.push(ATYP_V4);
            req.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            req.push(ATYP_V6);
            req.extend_from_slice(&v6.octets());
        }
        None => {
            let host = dest.host.as_bytes();
            req.push(ATYP_DOMAIN);
            req.push(u8::try_from(host.len()).ok()?);
            req.extend_from_slice(host);
        }
    }
    req.extend_from_slice(&dest.port.to_be_bytes());
    Some(req)
}

#[async_trait]
impl Backend for Socks5Backend {
    fn kind(&self) -> TransportKind {
        TransportKind::Socks
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

    async fn fake_socks(reply_code: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();

            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(head[3], ATYP_DOMAIN);
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.com");

            socket
                .write_all(&[VERSION, reply_code, 0, ATYP_V4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            socket.write_all(b"ok").await.unwrap();
        });
        addr
    }

    #[test]
    fn request_encodes_address_types() {
        let v4 = connect_request(&Destination::new("10.0.0.1", 80)).unwrap();
        assert_eq!(v4, vec![5, 1, 0, ATYP_V4, 10, 0, 0, 1, 0, 80]);

        let v6 = connect_request(&Destination::new("::1", 443)).unwrap();
        assert_eq!(v6[3], ATYP_V6);
        assert_eq!(v6.len(), 4 + 16 + 2);

        let long = "a".repeat(300);
        assert!(connect_request(&Destination::new(long, 80)).is_none());
    }

    #[tokio::test]
    async fn connect_through_socks() {
        let addr = fake_socks(0x00).await;
        let backend = Socks5Backend::new(addr, addr, Duration::from_secs(2));

        let mut stream = backend
            .open_stream(&Destination::new("example.com", 443))
            .await
            .unwrap();
        let mut payload = [0u8; 2];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ok");
    }

    #[tokio::test]
    async fn login_when_server_asks_for_it() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        let auth = Credentials {
            username: "me".to_string(),
            password: "pw".to_string(),
        };

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            far.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]);
            far.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();

            let mut login = [0u8; 7];
            far.read_exact(&mut login).await.unwrap();
            assert_eq!(&login, b"\x01\x02me\x02pw");
            far.write_all(&[USER_PASS_VERSION, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            far.read_exact(&mut request).await.unwrap();
            far.write_all(&[VERSION, 0, 0, ATYP_V4, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let result = negotiate(&mut near, &Destination::new("10.0.0.1", 80), Some(&auth))
            .await
            .unwrap();
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_login_is_refused() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        let auth = Credentials {
            username: "me".to_string(),
            password: "wrong".to_string(),
        };

        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            far.read_exact(&mut greeting).await.unwrap();
            far.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();
            let mut login = [0u8; 10];
            far.read_exact(&mut login).await.unwrap();
            far.write_all(&[USER_PASS_VERSION, 0x01]).await.unwrap();
        });

        let result = negotiate(&mut near, &Destination::new("10.0.0.1", 80), Some(&auth))
            .await
            .unwrap();
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }

    #[tokio::test]
    async fn failure_reply_is_refused() {
        let addr = fake_socks(0x05).await;
        let backend = Socks5Backend::new(addr, addr, Duration::from_secs(2));

        let result = backend.open_stream(&Destination::new("example.com", 443)).await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }
}
