//! Logging initialization

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogFormat;

/// Install the global subscriber.
///
/// `level` is the default directive; `RUST_LOG` still overrides it.
pub fn init(level: &str, format: LogFormat, log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()));

    let file = match log_file {
        Some(path) => Some(Arc::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?,
        )),
        None => None,
    };

    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false));
            match file {
                Some(file) => subscriber
                    .with(fmt::layer().with_ansi(false).with_writer(file))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json());
            match file {
                Some(file) => subscriber
                    .with(fmt::layer().json().with_writer(file))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}
