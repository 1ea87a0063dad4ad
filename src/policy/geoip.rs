//! Geo-IP lookup.
//!
//! The table format is one range per line followed by a region code:
//!
//! ```text
//! # comment
//! 1.0.1.0/24 CN
//! 1.0.8.0-1.0.15.255 CN
//! 2001:250::/35 CN
//! ```

use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

/// Maps an address to a region code.
pub trait GeoIpProvider: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Provider used when no table is configured.
pub struct NoGeoIp;

impl GeoIpProvider for NoGeoIp {
    fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Sorted, non-overlapping address ranges searched by binary search.
#[derive(Debug, Default)]
pub struct RangeTable {
    v4: Vec<(u32, u32, String)>,
    v6: Vec<(u128, u128, String)>,
}

impl RangeTable {
    /// Parse a table. Lines that do not parse are logged and skipped.
    pub fn from_text(text: &str) -> Self {
        let mut table = Self::default();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if table.insert_line(line).is_none() {
                warn!(line = index + 1, "skipping malformed geo-ip entry");
            }
        }

        table.v4.sort_by_key(|(start, _, _)| *start);
        table.v6.sort_by_key(|(start, _, _)| *start);
        table
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::from_text(&std::fs::read_to_string(path)?))
    }

    fn insert_line(&mut self, line: &str) -> Option<()> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let region = fields.next()?.to_uppercase();

        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (a.parse::<IpAddr>().ok()?, b.parse::<IpAddr>().ok()?),
            None => {
                let net: IpNet = range.parse().ok()?;
                (net.network(), net.broadcast())
            }
        };

        match (start, end) {
            (IpAddr::V4(a), IpAddr::V4(b)) if a <= b => {
                self.v4.push((u32::from(a), u32::from(b), region))
            }
            (IpAddr::V6(a), IpAddr::V6(b)) if a <= b => {
                self.v6.push((u128::from(a), u128::from(b), region))
            }
            _ => return None,
        }
        Some(())
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn search<T: Ord + Copy>(ranges: &[(T, T, String)], value: T) -> Option<String> {
    let idx = ranges.partition_point(|(start, _, _)| *start <= value);
    let (_, end, region) = ranges.get(idx.checked_sub(1)?)?;
    (value <= *end).then(|| region.clone())
}

impl GeoIpProvider for RangeTable {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => search(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => search(&self.v4, u32::from(v4)),
                None => search(&self.v6, u128::from(v6)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# sample
1.0.1.0/24 cn
1.0.8.0-1.0.15.255 CN
8.8.8.0/24 US
2001:250::/35 CN
not-a-range XX
";

    #[test]
    fn parses_and_skips_malformed() {
        let table = RangeTable::from_text(TABLE);

        assert_eq!(table.len(), 4);
    }

    #[test]
    fn lookup_v4() {
        let table = RangeTable::from_text(TABLE);

        assert_eq!(table.lookup("1.0.1.77".parse().unwrap()).as_deref(), Some("CN"));
        assert_eq!(table.lookup("1.0.12.1".parse().unwrap()).as_deref(), Some("CN"));
        assert_eq!(table.lookup("8.8.8.8".parse().unwrap()).as_deref(), Some("US"));
        assert_eq!(table.lookup("1.0.2.1".parse().unwrap()), None);
        assert_eq!(table.lookup("0.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn lookup_v6_and_mapped() {
        let table = RangeTable::from_text(TABLE);

        assert_eq!(table.lookup("2001:250::1".parse().unwrap()).as_deref(), Some("CN"));
        assert_eq!(table.lookup("::ffff:8.8.8.8".parse().unwrap()).as_deref(), Some("US"));
        assert_eq!(table.lookup("2001:db8::1".parse().unwrap()), None);
    }
}
