//! The two record types kept by the daemon.

use std::net::IpAddr;

use super::Record;
use crate::backend::TransportKind;
use crate::policy::Route;

/// Resolved addresses for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    ips: Vec<IpAddr>,
}

impl DomainRecord {
    pub fn new(ips: Vec<IpAddr>) -> Self {
        Self { ips }
    }

    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    pub fn into_ips(self) -> Vec<IpAddr> {
        self.ips
    }
}

impl Record for DomainRecord {
    fn encode(&self) -> String {
        self.ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn decode(s: &str) -> Option<Self> {
        let ips = s
            .split(',')
            .map(|part| part.trim().parse().ok())
            .collect::<Option<Vec<IpAddr>>>()?;
        if ips.is_empty() {
            return None;
        }
        Some(Self { ips })
    }
}

/// Routing metadata for a destination host.
///
/// Failure counters are written only by the connection manager; the
/// classifier reads them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMeta {
    failures: [u32; TransportKind::COUNT],
    last_success: Option<TransportKind>,
    last_route: Option<Route>,
}

impl HostMeta {
    /// Consecutive failures recorded for `kind`.
    pub fn failures(&self, kind: TransportKind) -> u32 {
        self.failures[kind.index()]
    }

    /// Returns the new count.
    pub fn record_failure(&mut self, kind: TransportKind) -> u32 {
        let count = &mut self.failures[kind.index()];
        *count = count.saturating_add(1);
        if self.last_success == Some(kind) {
            self.last_success = None;
        }
        *count
    }

    pub fn record_success(&mut self, kind: TransportKind, route: Route) {
        self.failures[kind.index()] = 0;
        self.last_success = Some(kind);
        self.last_route = Some(route);
    }

    /// Transport that last carried a connection to this host.
    pub fn last_success(&self) -> Option<TransportKind> {
        self.last_success
    }

    pub fn last_route(&self) -> Option<Route> {
        self.last_route
    }
}

impl Record for HostMeta {
    fn encode(&self) -> String {
        let mut parts: Vec<String> = TransportKind::ALL
            .iter()
            .map(|kind| format!("{}={}", kind.as_str(), self.failures(*kind)))
            .collect();
        if let Some(kind) = self.last_success {
            parts.push(format!("last={}", kind.as_str()));
        }
        if let Some(route) = self.last_route {
            parts.push(format!("route={}", route.as_str()));
        }
        parts.join(" ")
    }

    fn decode(s: &str) -> Option<Self> {
        let mut meta = HostMeta::default();
        for part in s.split_whitespace() {
            let (name, value) = part.split_once('=')?;
            match name {
                "last" => meta.last_success = Some(value.parse().ok()?),
                "route" => meta.last_route = Some(value.parse().ok()?),
                _ => {
                    let kind: TransportKind = name.parse().ok()?;
                    meta.failures[kind.index()] = value.parse().ok()?;
                }
            }
        }
        Some(meta)
    }
}
