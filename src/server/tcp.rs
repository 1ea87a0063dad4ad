//! TCP listener for DNS queries.
//!
//! Messages carry a 2-byte length prefix. A connection may send several
//! queries; answers are written back in order. Reads are bounded by the
//! query timeout so an idle client cannot pin a task, and so are writes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::MAX_DNS_PACKET_SIZE;
use crate::responder::Responder;

pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_listener(TcpListener::bind(addr).await?))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn start(self, responder: Arc<Responder>, read_timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, responder, read_timeout))
    }
}

async fn run_accept_loop(listener: TcpListener, responder: Arc<Responder>, read_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                trace!(%peer, "dns tcp connection");
                tokio::spawn(handle_connection(client, responder.clone(), read_timeout));
            }
            Err(e) => {
                debug!(error = %e, "tcp accept error");
            }
        }
    }
}

async fn handle_connection(mut client: TcpStream, responder: Arc<Responder>, read_timeout: Duration) {
    loop {
        let query = match tokio::time::timeout(read_timeout, read_dns_message(&mut client)).await {
            Ok(Ok(Some(query))) => query,
            _ => return,
        };

        let Some(response) = responder.handle(&query).await else {
            return;
        };
        if let Err(e) = write_dns_message(&mut client, &response.to_bytes(), read_timeout).await {
            trace!(error = %e, "dns tcp write failed");
            return;
        }
    }
}

/// Write one message with its length prefix, giving up after `timeout`.
pub async fn write_dns_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
    framed.extend_from_slice(message);

    tokio::time::timeout(timeout, stream.write_all(&framed))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dns tcp write timed out"))?
}

/// Read one length-prefixed DNS message, without the prefix.
///
/// `Ok(None)` on a clean close between messages.
pub async fn read_dns_message<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 2];
    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_DNS_PACKET_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad dns message length"));
    }
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(Some(message))
}
