//! Error types shared across the routing core.
//!
//! Every failure is scoped to the query or connection that caused it; none of
//! these are fatal to the daemon.

use thiserror::Error;

/// A DNS resolution failure, surfaced only after every strategy gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// All strategies answered empty (or failed).
    #[error("no answer")]
    NoAnswer,

    /// No strategy answered before its deadline.
    #[error("resolution timed out")]
    Timeout,

    /// An upstream answer could not be decoded.
    #[error("malformed answer")]
    Malformed,
}

/// Failure to open a stream to a destination.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The destination is classified BLOCKED.
    #[error("destination is blocked by policy")]
    Blocked,

    #[error("connect timed out")]
    Timeout,

    /// The peer or the tunnel refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("TLS handshake failed: {0}")]
    TlsFailure(String),

    /// Every candidate transport failed.
    #[error("all {attempted} transports failed")]
    AllTransportsFailed {
        /// Number of transports actually tried
        attempted: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Map an I/O error from a connect or handshake into the taxonomy.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                Self::Refused(err.to_string())
            }
            _ => Self::Io(err),
        }
    }
}

/// Record cache persistence failure. Always recovered locally.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("corrupt cache record at line {line}")]
    Corrupt {
        /// 1-based line number in the cache file
        line: usize,
    },

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A proxy client sent a handshake we cannot act on.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),

    /// Well-formed but not something we serve; the client has already been told.
    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    #[error("handshake timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration failure, reported at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule {
        /// The rule pattern as written
        rule: String,
        reason: String,
    },

    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("configuration file not found: {path}")]
    NotFound { path: String },

    #[error("TOML parsing error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
