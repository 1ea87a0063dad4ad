//! Local proxy front-end.
//!
//! One task per accepted connection. The first byte picks the protocol
//! (0x05 SOCKS5, 0x04 SOCKS4/4a, anything else HTTP). The target is
//! classified, a transport is opened through the connection manager and
//! bytes are piped until either side closes.
//!
//! Targets inside the intercept range are mapped back to the domain the DNS
//! responder handed that address out for.

mod http;
pub mod pipe;
mod socks;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::backend::Destination;
use crate::config::ProxyConfig;
use crate::connect::{ConnectManager, Connected, sni};
use crate::context::Context;
use crate::error::{ConnectError, HandshakeError};
use crate::policy::{Route, Verdict};
use crate::responder::InterceptPool;

/// Client protocol, which decides how replies are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Connect,
    PlainHttp,
    Socks4,
    Socks5,
}

impl Style {
    fn as_str(self) -> &'static str {
        match self {
            Style::Connect => "connect",
            Style::PlainHttp => "http",
            Style::Socks4 => "socks4",
            Style::Socks5 => "socks5",
        }
    }

    /// Plain HTTP gets the origin's own response, nothing is sent on success.
    fn success_reply(self) -> Option<Vec<u8>> {
        match self {
            Style::Connect => Some(http::ESTABLISHED.to_vec()),
            Style::PlainHttp => None,
            Style::Socks4 => Some(socks::socks4_reply(true).to_vec()),
            Style::Socks5 => Some(socks::socks5_reply(socks::REP_SUCCEEDED).to_vec()),
        }
    }

    fn failure_reply(self, err: &ConnectError) -> Vec<u8> {
        match self {
            Style::Connect | Style::PlainHttp => http::failure_response(err),
            Style::Socks4 => socks::socks4_reply(false).to_vec(),
            Style::Socks5 => socks::socks5_reply(socks::socks5_failure_code(err)).to_vec(),
        }
    }
}

struct Request {
    style: Style,
    dest: Destination,
    /// Sent to the backend before piping
    pending: Vec<u8>,
}

pub struct ProxyServer {
    listener: TcpListener,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_listener(TcpListener::bind(addr).await?))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn start(self, handler: Arc<ProxyHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((client, peer)) => {
                        let _ = client.set_nodelay(true);
                        let handler = handler.clone();
                        tokio::spawn(async move { handler.serve(client, peer).await });
                    }
                    Err(e) => debug!(error = %e, "proxy accept error"),
                }
            }
        })
    }
}

pub struct ProxyHandler {
    connector: Arc<ConnectManager>,
    intercept: Arc<InterceptPool>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(connector: Arc<ConnectManager>, intercept: Arc<InterceptPool>, config: &ProxyConfig) -> Self {
        Self {
            connector,
            intercept,
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }

    pub fn from_context(ctx: &Context) -> Self {
        Self::new(ctx.connector.clone(), ctx.intercept.clone(), &ctx.config.proxy)
    }

    /// Handle one client connection to completion.
    pub async fn serve<S>(&self, mut client: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();

        let request = match tokio::time::timeout(self.handshake_timeout, self.handshake(&mut client)).await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "proxy handshake failed");
                return;
            }
            Err(_) => {
                debug!(%peer, error = %HandshakeError::Timeout, "proxy handshake failed");
                return;
            }
        };

        let Request { style, dest, pending } = request;
        let (dest, verdict) = match self.route(dest).await {
            Ok(routed) => routed,
            Err(e) => {
                let _ = client.write_all(&style.failure_reply(&e)).await;
                debug!(%peer, error = %e, "unmapped intercept address");
                return;
            }
        };

        let Some(mut connected) = self.connect(&mut client, style, &dest, verdict, pending, peer).await
        else {
            return;
        };

        let connect_ms = start.elapsed().as_millis() as u64;
        let result = pipe::pipe(&mut client, &mut connected.stream, self.idle_timeout).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(moved) => info!(
                %peer, target = %dest, protocol = style.as_str(), route = %connected.route,
                transport = %connected.transport, connect_ms, elapsed_ms,
                up = moved.up, down = moved.down, "connection closed"
            ),
            Err(e) => info!(
                %peer, target = %dest, protocol = style.as_str(), route = %connected.route,
                transport = %connected.transport, connect_ms, elapsed_ms,
                error = %e, "connection ended"
            ),
        }
    }

    async fn handshake<S>(&self, client: &mut S) -> Result<Request, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let first = client.read_u8().await?;
        match first {
            socks::SOCKS5 => match socks::read_socks5(client).await {
                Ok(dest) => Ok(Request {
                    style: Style::Socks5,
                    dest,
                    pending: Vec::new(),
                }),
                Err(e @ HandshakeError::Malformed(_)) => {
                    let _ = client.write_all(&socks::socks5_reply(socks::REP_GENERAL_FAILURE)).await;
                    Err(e)
                }
                Err(e) => Err(e),
            },
            socks::SOCKS4 => match socks::read_socks4(client).await {
                Ok(dest) => Ok(Request {
                    style: Style::Socks4,
                    dest,
                    pending: Vec::new(),
                }),
                Err(e @ HandshakeError::Malformed(_)) => {
                    let _ = client.write_all(&socks::socks4_reply(false)).await;
                    Err(e)
                }
                Err(e) => Err(e),
            },
            _ => match http::read_request(client, first).await {
                Ok(req) => Ok(Request {
                    style: if req.tunnel { Style::Connect } else { Style::PlainHttp },
                    dest: req.dest,
                    pending: req.pending,
                }),
                Err(e @ HandshakeError::Malformed(_)) => {
                    let _ = client.write_all(&http::bad_request()).await;
                    Err(e)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Map intercept addresses back to their domain, then classify.
    async fn route(&self, dest: Destination) -> Result<(Destination, Verdict), ConnectError> {
        let dest = match dest.ip() {
            Some(ip) if self.intercept.contains(ip) => match self.intercept.lookup(ip) {
                Some(domain) => {
                    trace!(%ip, %domain, "intercept address mapped");
                    Destination::new(domain, dest.port)
                }
                None => {
                    return Err(ConnectError::Refused(format!("{ip} is not mapped to a domain")));
                }
            },
            _ => dest,
        };
        let verdict = self.connector.classifier().classify(&dest.host).await;
        Ok((dest, verdict))
    }

    /// Open the backend and acknowledge the client. `None` once the client
    /// has been told about a failure, or is gone.
    ///
    /// With SNI split, a DIRECT TLS target is acknowledged first so the
    /// client sends its ClientHello; a failure after that can only be
    /// reported by closing.
    async fn connect<S>(
        &self,
        client: &mut S,
        style: Style,
        dest: &Destination,
        verdict: Verdict,
        pending: Vec<u8>,
        peer: SocketAddr,
    ) -> Option<Connected>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if verdict.route == Route::Blocked {
            let _ = client.write_all(&style.failure_reply(&ConnectError::Blocked)).await;
            info!(%peer, target = %dest, protocol = style.as_str(), reason = ?verdict.reason, "blocked");
            return None;
        }

        let split = style != Style::PlainHttp
            && pending.is_empty()
            && self.connector.wants_preface(dest, verdict);

        if split {
            if let Some(ok) = style.success_reply() {
                client.write_all(&ok).await.ok()?;
            }
            let preface = match sni::read_preface(client, self.handshake_timeout).await {
                Ok(preface) => preface,
                Err(e) => {
                    debug!(%peer, target = %dest, error = %e, "client preface unreadable");
                    return None;
                }
            };
            return match self.connector.open_with_preface(dest, verdict, &preface).await {
                Ok(connected) => Some(connected),
                Err(e) => {
                    info!(%peer, target = %dest, protocol = style.as_str(), error = %e, "connect failed");
                    None
                }
            };
        }

        let mut connected = match self.connector.open(dest, verdict).await {
            Ok(connected) => connected,
            Err(e) => {
                let _ = client.write_all(&style.failure_reply(&e)).await;
                info!(%peer, target = %dest, protocol = style.as_str(), error = %e, "connect failed");
                return None;
            }
        };
        if let Some(ok) = style.success_reply() {
            client.write_all(&ok).await.ok()?;
        }
        if !pending.is_empty() {
            if let Err(e) = connected.stream.write_all(&pending).await {
                debug!(%peer, target = %dest, error = %e, "backend write failed");
                return None;
            }
        }
        Some(connected)
    }
}
