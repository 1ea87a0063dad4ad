//! HTTP proxy requests: `CONNECT host:port` and plain requests in
//! absolute-URI or Host-header form.
//!
//! Plain requests are rewritten to origin form with `Connection: close`, so
//! one client connection carries exactly one routed request.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::Destination;
use crate::error::{ConnectError, HandshakeError};

const MAX_HEAD_SIZE: usize = 16 * 1024;

pub(crate) const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Hop-by-hop headers dropped from forwarded requests.
const HOP_HEADERS: &[&str] = &["connection", "proxy-connection", "keep-alive", "proxy-authorization"];

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub dest: Destination,
    /// CONNECT rather than a plain request
    pub tunnel: bool,
    /// Bytes for the backend: the rewritten head and any body already read
    /// for plain requests, early client data for CONNECT.
    pub pending: Vec<u8>,
}

/// Read a request head; `first` is the byte already consumed by protocol
/// detection.
pub(crate) async fn read_request<S>(stream: &mut S, first: u8) -> Result<HttpRequest, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![first];
    let mut chunk = [0u8; 1024];
    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HandshakeError::Malformed("request head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Malformed("connection closed inside request head"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let rest = buf.split_off(head_len);
    let head = std::str::from_utf8(&buf).map_err(|_| HandshakeError::Malformed("request head is not utf-8"))?;
    parse_head(head, rest)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &str, rest: Vec<u8>) -> Result<HttpRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::Malformed("bad request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::Malformed("bad http version"));
    }

    let headers: Vec<(&str, &str)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    if method.eq_ignore_ascii_case("CONNECT") {
        let dest = parse_authority(target, 443).ok_or(HandshakeError::Malformed("bad CONNECT target"))?;
        return Ok(HttpRequest {
            dest,
            tunnel: true,
            pending: rest,
        });
    }

    let host_header = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| *v);

    let (dest, path) = if let Some(uri) = strip_prefix_ignore_case(target, "http://") {
        let (authority, path) = match uri.find('/') {
            Some(i) => (&uri[..i], &uri[i..]),
            None => (uri, "/"),
        };
        let dest = parse_authority(authority, 80).ok_or(HandshakeError::Malformed("bad request uri"))?;
        (dest, path)
    } else if target.starts_with('/') {
        let host = host_header.ok_or(HandshakeError::Malformed("missing Host header"))?;
        let dest = parse_authority(host, 80).ok_or(HandshakeError::Malformed("bad Host header"))?;
        (dest, target)
    } else {
        return Err(HandshakeError::Malformed("unsupported request target"));
    };

    let mut out = format!("{method} {path} {version}\r\n");
    if host_header.is_none() {
        out.push_str(&format!("Host: {}\r\n", dest.authority()));
    }
    for (name, value) in &headers {
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");

    let mut pending = out.into_bytes();
    pending.extend_from_slice(&rest);
    Ok(HttpRequest {
        dest,
        tunnel: false,
        pending,
    })
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6 address takes the
/// default port.
pub(crate) fn parse_authority(authority: &str, default_port: u16) -> Option<Destination> {
    let authority = authority.trim();
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
            _ => (authority, default_port),
        }
    };
    let dest = Destination::new(host, port);
    if port == 0 || !dest.has_valid_host() {
        return None;
    }
    Some(dest)
}

/// Reply for a connect failure, closing the connection.
pub(crate) fn failure_response(err: &ConnectError) -> Vec<u8> {
    match err {
        ConnectError::Blocked => response(403, "Forbidden"),
        ConnectError::Timeout => response(504, "Gateway Timeout"),
        _ => response(502, "Bad Gateway"),
    }
}

pub(crate) fn bad_request() -> Vec<u8> {
    response(400, "Bad Request")
}

fn response(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").into_bytes()
}
