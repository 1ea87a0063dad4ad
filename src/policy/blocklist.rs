//! Domain lists: the tunnel blocklist and the advertisement list.
//!
//! Both start from a list embedded at compile time and can be replaced at
//! runtime when a fresher copy is fetched.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::io;
use std::path::Path;

/// Embedded list of domains known to need the tunnel.
pub const TUNNEL_DOMAINS: &str = include_str!("tunnel_domains.txt");

/// Embedded list of advertisement/tracking domains.
pub const AD_DOMAINS: &str = include_str!("ad_domains.txt");

/// A set of domains with suffix matching.
pub struct Blocklist {
    domains: RwLock<FxHashSet<String>>,
}

impl Blocklist {
    /// Parse a newline-separated list. Blank lines and `#` comments are
    /// skipped; a leading `*.` or `.` is ignored since every entry already
    /// covers its subdomains.
    pub fn from_text(text: &str) -> Self {
        Self {
            domains: RwLock::new(parse_domains(text)),
        }
    }

    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: RwLock::new(
                domains
                    .into_iter()
                    .map(|d| normalize_entry(d.as_ref()))
                    .filter(|d| !d.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::from_text(&std::fs::read_to_string(path)?))
    }

    /// Check whether `domain` or any of its parent domains is listed.
    ///
    /// "ads.example.com" matches when "example.com" is in the list.
    pub fn contains(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let domains = self.domains.read();
        let mut current = domain.as_str();

        loop {
            if domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// Swap in a refreshed list.
    pub fn replace_with_text(&self, text: &str) {
        *self.domains.write() = parse_domains(text);
    }

    /// Returns the number of domains in the list.
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Blocklist {
    /// The embedded tunnel list.
    fn default() -> Self {
        Self::from_text(TUNNEL_DOMAINS)
    }
}

fn parse_domains(text: &str) -> FxHashSet<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let entry = normalize_entry(line);
            (!entry.is_empty()).then_some(entry)
        })
        .collect()
}

fn normalize_entry(entry: &str) -> String {
    entry
        .trim()
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_lists_parse() {
        assert!(!Blocklist::default().is_empty());
        assert!(!Blocklist::from_text(AD_DOMAINS).is_empty());
    }

    #[test]
    fn contains_exact_match() {
        let blocklist = Blocklist::from_domains(["blocked.example"]);

        assert!(blocklist.contains("blocked.example"));
    }

    #[test]
    fn contains_subdomain_match() {
        let blocklist = Blocklist::from_domains(["blocked.example"]);

        assert!(blocklist.contains("www.blocked.example"));
        assert!(blocklist.contains("a.b.blocked.example"));
        assert!(!blocklist.contains("notblocked.example"));
    }

    #[test]
    fn contains_case_insensitive_and_trailing_dot() {
        let blocklist = Blocklist::from_domains(["Blocked.Example"]);

        assert!(blocklist.contains("BLOCKED.example"));
        assert!(blocklist.contains("www.blocked.example."));
    }

    #[test]
    fn from_text_skips_comments_and_wildcards() {
        let blocklist = Blocklist::from_text("# header\n\n*.one.test\n.two.test\nthree.test\n");

        assert_eq!(blocklist.len(), 3);
        assert!(blocklist.contains("x.one.test"));
        assert!(blocklist.contains("two.test"));
    }

    #[test]
    fn replace_swaps_contents() {
        let blocklist = Blocklist::from_domains(["old.test"]);
        blocklist.replace_with_text("new.test\n");

        assert!(!blocklist.contains("old.test"));
        assert!(blocklist.contains("new.test"));
    }

    #[test]
    fn contains_handles_empty_input() {
        let blocklist = Blocklist::default();

        assert!(!blocklist.contains(""));
    }
}
