//! User-defined routing overrides.
//!
//! Pattern syntax:
//!
//! | Pattern | Matches |
//! |---|---|
//! | `example.com` | exactly `example.com` |
//! | `*.example.com`, `.example.com`, `suffix:example.com` | `example.com` and every subdomain |
//! | `10.0.0.0/8`, `2001:db8::/32` | addresses in the network |
//! | `1.2.3.4` | that single address |

use ipnet::IpNet;
use std::net::IpAddr;

use super::Route;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Suffix(String),
    Network(IpNet),
}

/// One override rule. Higher `priority` is evaluated first; ties keep the
/// order they were written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRule {
    pattern: Pattern,
    raw: String,
    pub action: Route,
    pub priority: i32,
}

impl UserRule {
    pub fn parse(pattern: &str, action: Route, priority: i32) -> Result<Self, ConfigError> {
        let raw = pattern.trim();
        if raw.is_empty() {
            return Err(ConfigError::invalid_rule(pattern, "empty pattern"));
        }

        let parsed = if raw.contains('/') {
            let net: IpNet = raw
                .parse()
                .map_err(|_| ConfigError::invalid_rule(raw, "not a valid CIDR network"))?;
            Pattern::Network(net.trunc())
        } else if let Ok(ip) = raw.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Pattern::Network(IpNet::from(ip))
        } else if let Some(rest) = raw
            .strip_prefix("suffix:")
            .or_else(|| raw.strip_prefix("*."))
            .or_else(|| raw.strip_prefix('.'))
        {
            Pattern::Suffix(validate_domain(raw, rest)?)
        } else {
            Pattern::Exact(validate_domain(raw, raw)?)
        };

        Ok(Self {
            pattern: parsed,
            raw: raw.to_string(),
            action,
            priority,
        })
    }

    /// The pattern as written.
    pub fn pattern(&self) -> &str {
        &self.raw
    }

    /// Whether the rule covers `host` (already lowercase) or one of `ips`.
    pub fn matches(&self, host: &str, ips: &[IpAddr]) -> bool {
        match &self.pattern {
            Pattern::Exact(domain) => host == domain,
            Pattern::Suffix(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            Pattern::Network(net) => {
                let literal = host.parse::<IpAddr>().ok();
                literal
                    .iter()
                    .chain(ips.iter())
                    .any(|ip| net.contains(ip))
            }
        }
    }
}

fn validate_domain(raw: &str, domain: &str) -> Result<String, ConfigError> {
    let domain = domain.trim_end_matches('.').to_lowercase();
    if domain.is_empty() {
        return Err(ConfigError::invalid_rule(raw, "empty domain"));
    }
    let valid = domain
        .split('.')
        .all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if !valid {
        return Err(ConfigError::invalid_rule(raw, "not a valid domain name"));
    }
    Ok(domain)
}

/// Rules in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<UserRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<UserRule>) -> Self {
        // Stable sort keeps file order among equal priorities
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// First matching rule at the highest priority.
    pub fn find(&self, host: &str, ips: &[IpAddr]) -> Option<&UserRule> {
        self.rules.iter().find(|rule| rule.matches(host, ips))
    }

    /// Whether any rule matches on addresses rather than names.
    pub fn has_network(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| matches!(rule.pattern, Pattern::Network(_)))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
