//! UDP listener for DNS queries.
//!
//! Each datagram is answered in its own task so a slow resolution never
//! holds up the receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::MAX_DNS_PACKET_SIZE;
use crate::dns::MAX_UDP_RESPONSE;
use crate::responder::Responder;

pub struct UdpServer {
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_socket(UdpSocket::bind(addr).await?))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn start(self, responder: Arc<Responder>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, responder))
    }
}

async fn run(socket: Arc<UdpSocket>, responder: Arc<Responder>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                // ICMP port unreachable from an earlier reply surfaces here
                debug!(error = %e, "udp recv error");
                continue;
            }
        };

        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let responder = responder.clone();

        tokio::spawn(async move {
            let Some(response) = responder.handle(&packet).await else {
                return;
            };
            let bytes = response.to_udp_bytes(MAX_UDP_RESPONSE);
            if let Err(e) = socket.send_to(&bytes, src).await {
                warn!(%src, error = %e, "udp response error");
            }
        });
    }
}
