//! DNS message parsing and construction.

use std::net::IpAddr;

use crate::error::ResolutionError;

const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// Classic UDP payload limit; larger answers are truncated so the client
/// retries over TCP.
pub const MAX_UDP_RESPONSE: usize = 512;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// Response codes we emit or interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    ///
    /// Returns `None` for anything that is not a single well-formed question:
    /// responses, empty question sections, compressed or oversized names.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if flags & FLAG_QR != 0 || qdcount == 0 {
            return None;
        }

        let (domain, pos) = read_name(data, HEADER_LEN)?;
        if domain.is_empty() {
            return None;
        }

        // Parse QTYPE and QCLASS
        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        Some(Self {
            id,
            flags,
            domain,
            qtype,
            qclass,
        })
    }

    /// Whether this asks for an address record.
    pub fn is_address(&self) -> bool {
        self.qclass == CLASS_IN && (self.qtype == TYPE_A || self.qtype == TYPE_AAAA)
    }
}

/// Read an uncompressed name starting at `pos`. Returns the lowercase name
/// and the position after its terminating zero label.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut domain = String::new();

    loop {
        let label_len = *data.get(pos)? as usize;
        pos += 1;
        if label_len == 0 {
            break;
        }
        if label_len > 63 || pos + label_len > data.len() {
            return None;
        }
        let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
        if !domain.is_empty() {
            domain.push('.');
        }
        domain.push_str(label);
        if domain.len() > 253 {
            return None;
        }
        pos += label_len;
    }

    Some((domain.to_lowercase(), pos))
}

/// Skip a possibly compressed name.
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let b = *data.get(pos)?;
        if b == 0 {
            return Some(pos + 1);
        }
        if b >= 0xC0 {
            return (pos + 2 <= data.len()).then_some(pos + 2);
        }
        pos += 1 + b as usize;
    }
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn address(name: &str, ip: IpAddr, ttl: u32) -> Self {
        let (rtype, rdata) = match ip {
            IpAddr::V4(v4) => (TYPE_A, v4.octets().to_vec()),
            IpAddr::V6(v6) => (TYPE_AAAA, v6.octets().to_vec()),
        };
        Self {
            name: name.to_string(),
            rtype,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }
}

impl DnsResponse {
    /// An empty response to `query` with the given code.
    pub fn with_rcode(query: &DnsQuery, rcode: Rcode) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | (query.flags & FLAG_RD) | FLAG_RA | rcode as u16,
            questions: vec![DnsQuestion {
                domain: query.domain.clone(),
                qtype: query.qtype,
                qclass: query.qclass,
            }],
            answers: Vec::new(),
        }
    }

    pub fn nxdomain(query: &DnsQuery) -> Self {
        Self::with_rcode(query, Rcode::NxDomain)
    }

    pub fn servfail(query: &DnsQuery) -> Self {
        Self::with_rcode(query, Rcode::ServFail)
    }

    /// Answer with the addresses that match the query type. No matching
    /// address gives an empty NOERROR answer.
    pub fn addresses(query: &DnsQuery, ips: &[IpAddr], ttl: u32) -> Self {
        let mut response = Self::with_rcode(query, Rcode::NoError);
        response.answers = ips
            .iter()
            .filter(|ip| match query.qtype {
                TYPE_A => ip.is_ipv4(),
                TYPE_AAAA => ip.is_ipv6(),
                _ => false,
            })
            .map(|ip| DnsRecord::address(&query.domain, *ip, ttl))
            .collect();
        response
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        // Questions
        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Answers
        for a in &self.answers {
            // Use compression pointer if this is the first question's domain
            if !self.questions.is_empty() && a.name == self.questions[0].domain {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }

    /// Encode for UDP: when the message exceeds `limit`, answers are dropped
    /// and the TC bit is set.
    pub fn to_udp_bytes(&self, limit: usize) -> Vec<u8> {
        let data = self.to_bytes();
        if data.len() <= limit {
            return data;
        }
        let truncated = Self {
            id: self.id,
            flags: self.flags | FLAG_TC,
            questions: self.questions.clone(),
            answers: Vec::new(),
        };
        truncated.to_bytes()
    }
}

/// Longest label a name may carry.
pub const MAX_LABEL_LEN: usize = 63;
/// Longest name in presentation form, without the trailing dot.
pub const MAX_NAME_LEN: usize = 253;

/// Whether `domain` can be put on the wire: dot-separated labels of 1 to 63
/// letters, digits, `-` or `_`. A single trailing dot is accepted.
pub fn is_valid_name(domain: &str) -> bool {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    !domain.is_empty()
        && domain.len() <= MAX_NAME_LEN
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Build a recursive query for `domain`, which must pass [`is_valid_name`].
pub fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&FLAG_RD.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    encode_domain(&mut data, domain);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&CLASS_IN.to_be_bytes());
    data
}

/// Addresses and minimum TTL extracted from an upstream answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnswer {
    pub ips: Vec<IpAddr>,
    /// Minimum TTL across the address records, if any
    pub min_ttl: Option<u32>,
}

/// Extract A/AAAA records from an upstream response to query `id`.
///
/// NXDOMAIN and other error codes are reported as `NoAnswer`; a response
/// that cannot be walked is `Malformed`.
pub fn parse_answer(response: &[u8], id: u16) -> Result<ParsedAnswer, ResolutionError> {
    if response.len() < HEADER_LEN {
        return Err(ResolutionError::Malformed);
    }
    if u16::from_be_bytes([response[0], response[1]]) != id {
        return Err(ResolutionError::Malformed);
    }

    let flags = u16::from_be_bytes([response[2], response[3]]);
    if flags & FLAG_QR == 0 {
        return Err(ResolutionError::Malformed);
    }
    if flags & 0x000F != Rcode::NoError as u16 {
        return Err(ResolutionError::NoAnswer);
    }

    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;

    let mut pos = HEADER_LEN;

    // Skip question section
    for _ in 0..qdcount {
        pos = skip_name(response, pos).ok_or(ResolutionError::Malformed)? + 4;
    }

    let mut ips = Vec::new();
    let mut min_ttl: Option<u32> = None;

    for _ in 0..ancount {
        pos = skip_name(response, pos).ok_or(ResolutionError::Malformed)?;
        if pos + 10 > response.len() {
            return Err(ResolutionError::Malformed);
        }

        let rtype = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let ttl = u32::from_be_bytes([
            response[pos + 4],
            response[pos + 5],
            response[pos + 6],
            response[pos + 7],
        ]);
        let rdlength = u16::from_be_bytes([response[pos + 8], response[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > response.len() {
            return Err(ResolutionError::Malformed);
        }
        let rdata = &response[pos..pos + rdlength];

        let ip = match (rtype, rdlength) {
            (TYPE_A, 4) => Some(IpAddr::from([rdata[0], rdata[1], rdata[2], rdata[3]])),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(IpAddr::from(octets))
            }
            _ => None,
        };
        if let Some(ip) = ip {
            ips.push(ip);
            min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));
        }

        pos += rdlength;
    }

    Ok(ParsedAnswer { ips, min_ttl })
}
