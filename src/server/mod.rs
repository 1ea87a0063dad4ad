//! DNS listeners.
//!
//! UDP and TCP on every configured address. The primary port is tried
//! first; if it cannot be bound (privileged or already taken) the backup
//! port is used instead.

pub mod tcp;
pub mod udp;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Bind `ip:port`, falling back to `ip:backup`.
pub async fn bind_with_fallback<T, F, Fut>(
    ip: IpAddr,
    port: u16,
    backup: Option<u16>,
    protocol: Protocol,
    bind: F,
) -> io::Result<T>
where
    F: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    match bind(SocketAddr::new(ip, port)).await {
        Ok(bound) => Ok(bound),
        Err(e) => match backup {
            Some(backup) if backup != port => {
                warn!(
                    protocol = protocol.as_str(),
                    %ip, port, backup, error = %e,
                    "primary dns port unavailable, using backup"
                );
                bind(SocketAddr::new(ip, backup)).await
            }
            _ => Err(e),
        },
    }
}
