//! TLS ClientHello inspection for SNI-split routing.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16 * 1024 + 256;

/// Whether `data` starts like a TLS handshake record.
pub fn is_client_hello(data: &[u8]) -> bool {
    data.len() >= RECORD_HEADER_LEN + 1
        && data[0] == CONTENT_HANDSHAKE
        && data[1] == 0x03
        && data[RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
}

/// Read the client's first TLS record, or whatever arrives first if it is
/// not TLS. Returns an empty buffer if nothing arrives within `timeout`.
pub async fn read_preface<S>(stream: &mut S, timeout: Duration) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RECORD_HEADER_LEN];
    let first = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(n) => n?,
        Err(_) => return Ok(Vec::new()),
    };
    if first == 0 || buf[0] != CONTENT_HANDSHAKE {
        buf.truncate(first);
        return Ok(buf);
    }
    if first < RECORD_HEADER_LEN {
        tokio::time::timeout(timeout, stream.read_exact(&mut buf[first..]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "partial TLS header"))??;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return Ok(buf);
    }
    buf.resize(RECORD_HEADER_LEN + record_len, 0);
    tokio::time::timeout(timeout, stream.read_exact(&mut buf[RECORD_HEADER_LEN..]))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "partial ClientHello"))??;
    Ok(buf)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn skip_u8_prefixed(&mut self) -> Option<()> {
        let n = self.u8()? as usize;
        self.take(n).map(|_| ())
    }

    fn skip_u16_prefixed(&mut self) -> Option<()> {
        let n = self.u16()? as usize;
        self.take(n).map(|_| ())
    }
}

/// Extract the server name from a ClientHello record.
pub fn parse_sni(data: &[u8]) -> Option<String> {
    if !is_client_hello(data) {
        return None;
    }

    let mut r = Reader {
        data: &data[RECORD_HEADER_LEN + 1..],
    };
    let body_len = r.u24()?;
    let mut r = Reader {
        data: r.take(body_len)?,
    };

    r.take(2)?; // client version
    r.take(32)?; // random
    r.skip_u8_prefixed()?; // session id
    r.skip_u16_prefixed()?; // cipher suites
    r.skip_u8_prefixed()?; // compression methods

    let ext_len = r.u16()? as usize;
    let mut exts = Reader {
        data: r.take(ext_len)?,
    };

    while !exts.data.is_empty() {
        let ext_type = exts.u16()?;
        let len = exts.u16()? as usize;
        let body = exts.take(len)?;
        if ext_type == EXT_SERVER_NAME {
            return server_name(body);
        }
    }
    None
}

fn server_name(ext: &[u8]) -> Option<String> {
    let mut r = Reader { data: ext };
    let list_len = r.u16()? as usize;
    let mut list = Reader {
        data: r.take(list_len)?,
    };

    while !list.data.is_empty() {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.take(len)?;
        if name_type == NAME_TYPE_HOST && !name.is_empty() && name.len() <= 255 {
            let name = std::str::from_utf8(name).ok()?;
            return Some(name.to_ascii_lowercase());
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal ClientHello carrying `host` as SNI.
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(NAME_TYPE_HOST);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut exts = Vec::new();
        exts.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        exts.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_server_name() {
        let hello = client_hello("WWW.Example.com");
        assert!(is_client_hello(&hello));
        assert_eq!(parse_sni(&hello).as_deref(), Some("www.example.com"));
    }

    #[test]
    fn rejects_non_tls_and_truncated() {
        assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n\r\n"), None);

        let hello = client_hello("example.com");
        assert_eq!(parse_sni(&hello[..hello.len() - 4]), None);
        assert_eq!(parse_sni(&hello[..10]), None);
    }

    #[tokio::test]
    async fn reads_one_record() {
        let mut data = client_hello("example.com");
        let len = data.len();
        data.extend_from_slice(b"trailing application data");

        let mut cursor = std::io::Cursor::new(data);
        let preface = read_preface(&mut cursor, Duration::from_secs(1)).await.unwrap();
        assert_eq!(preface.len(), len);
    }

    #[tokio::test]
    async fn silent_client_gives_empty_preface() {
        let (mut client, _server) = tokio::io::duplex(64);
        let preface = read_preface(&mut client, Duration::from_millis(20)).await.unwrap();
        assert!(preface.is_empty());
    }
}
