//! SOCKS server side: SOCKS5 without authentication, SOCKS4 and 4a.
//! Only CONNECT is served.

use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::backend::Destination;
use crate::error::{ConnectError, HandshakeError};

pub(crate) const SOCKS5: u8 = 0x05;
pub(crate) const SOCKS4: u8 = 0x04;

const CMD_CONNECT: u8 = 0x01;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

pub(crate) const REP_SUCCEEDED: u8 = 0x00;
pub(crate) const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

const MAX_ID_LEN: usize = 255;

/// SOCKS5 greeting and request; the version byte is already consumed.
pub(crate) async fn read_socks5<S>(stream: &mut S) -> Result<Destination, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[SOCKS5, NO_ACCEPTABLE_METHOD]).await?;
        return Err(HandshakeError::Unsupported("no acceptable auth method"));
    }
    stream.write_all(&[SOCKS5, NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;
    if ver != SOCKS5 {
        return Err(HandshakeError::Malformed("bad socks5 request version"));
    }
    if cmd != CMD_CONNECT {
        stream.write_all(&socks5_reply(REP_COMMAND_NOT_SUPPORTED)).await?;
        return Err(HandshakeError::Unsupported("socks5 command"));
    }

    let host = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| HandshakeError::Malformed("socks5 domain is not utf-8"))?
        }
        _ => {
            stream.write_all(&socks5_reply(REP_ATYP_NOT_SUPPORTED)).await?;
            return Err(HandshakeError::Unsupported("socks5 address type"));
        }
    };
    let port = stream.read_u16().await?;
    let dest = Destination::new(host, port);
    if !dest.has_valid_host() {
        return Err(HandshakeError::Malformed("bad socks5 domain"));
    }
    Ok(dest)
}

/// SOCKS4 or 4a request; the version byte is already consumed.
pub(crate) async fn read_socks4<S>(stream: &mut S) -> Result<Destination, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let cmd = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets).await?;
    read_nul_terminated(stream).await?; // user id, ignored

    if cmd != CMD_CONNECT {
        stream.write_all(&socks4_reply(false)).await?;
        return Err(HandshakeError::Unsupported("socks4 command"));
    }

    // 4a: 0.0.0.x with x != 0 means a domain follows the user id
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let name = read_nul_terminated(stream).await?;
        if name.is_empty() {
            return Err(HandshakeError::Malformed("empty socks4a domain"));
        }
        String::from_utf8(name).map_err(|_| HandshakeError::Malformed("socks4a domain is not utf-8"))?
    } else {
        Ipv4Addr::from(octets).to_string()
    };
    let dest = Destination::new(host, port);
    if !dest.has_valid_host() {
        return Err(HandshakeError::Malformed("bad socks4a domain"));
    }
    Ok(dest)
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut out = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => return Ok(out),
            b if out.len() < MAX_ID_LEN => out.push(b),
            _ => return Err(HandshakeError::Malformed("socks4 field too long")),
        }
    }
}

/// Reply with an unspecified bound address.
pub(crate) fn socks5_reply(code: u8) -> [u8; 10] {
    [SOCKS5, code, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0]
}

pub(crate) fn socks4_reply(granted: bool) -> [u8; 8] {
    let code = if granted { SOCKS4_GRANTED } else { SOCKS4_REJECTED };
    [0x00, code, 0, 0, 0, 0, 0, 0]
}

pub(crate) fn socks5_failure_code(err: &ConnectError) -> u8 {
    match err {
        ConnectError::Blocked => REP_NOT_ALLOWED,
        ConnectError::Timeout => REP_TTL_EXPIRED,
        ConnectError::Refused(_) => REP_REFUSED,
        ConnectError::AllTransportsFailed { .. } => REP_HOST_UNREACHABLE,
        ConnectError::TlsFailure(_) | ConnectError::Io(_) => REP_GENERAL_FAILURE,
    }
}
