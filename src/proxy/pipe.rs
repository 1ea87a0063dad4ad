//! Bidirectional byte pipe with an idle timeout.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// client -> backend
    pub up: u64,
    /// backend -> client
    pub down: u64,
}

/// Copy between `client` and `backend` until both sides have closed, an
/// I/O error occurs, or nothing moves for `idle`.
///
/// When one side closes its write half, the other side's write half is shut
/// down and the remaining direction keeps flowing.
pub async fn pipe<A, B>(client: &mut A, backend: &mut B, idle: Duration) -> io::Result<Transferred>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let mut up_buf = vec![0u8; BUF_SIZE];
    let mut down_buf = vec![0u8; BUF_SIZE];
    let mut client_open = true;
    let mut backend_open = true;
    let mut moved = Transferred::default();

    while client_open || backend_open {
        tokio::select! {
            read = client_rd.read(&mut up_buf), if client_open => match read? {
                0 => {
                    client_open = false;
                    let _ = backend_wr.shutdown().await;
                }
                n => {
                    backend_wr.write_all(&up_buf[..n]).await?;
                    moved.up += n as u64;
                }
            },
            read = backend_rd.read(&mut down_buf), if backend_open => match read? {
                0 => {
                    backend_open = false;
                    let _ = client_wr.shutdown().await;
                }
                n => {
                    client_wr.write_all(&down_buf[..n]).await?;
                    moved.down += n as u64;
                }
            },
            _ = tokio::time::sleep(idle) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe idle timeout"));
            }
        }
    }
    Ok(moved)
}
