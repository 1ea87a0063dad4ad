use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use routewise::config::{Config, LogFormat};
use routewise::context::Context;
use routewise::{daemon, logging};

#[derive(Parser)]
#[command(name = "routewise")]
#[command(about = "Policy routing daemon: DNS responder and local proxy", long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults apply when it does not exist.
    #[arg(short, long, default_value = "routewise.toml")]
    config: PathBuf,

    /// Listen on all interfaces instead of loopback only
    #[arg(long)]
    allow_remote: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// DNS listen port
    #[arg(long)]
    dns_port: Option<u16>,

    /// Proxy listen port
    #[arg(long)]
    proxy_port: Option<u16>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.allow_remote {
            config.proxy.allow_remote = true;
        }
        if let Some(port) = self.dns_port {
            config.dns.port = port;
        }
        if let Some(port) = self.proxy_port {
            config.proxy.port = port;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
        match (self.quiet, self.verbose) {
            (true, _) => config.logging.level = "warn".to_string(),
            (_, 0) => {}
            (_, 1) => config.logging.level = "debug".to_string(),
            _ => config.logging.level = "trace".to_string(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, from_file) = if args.config.exists() {
        (Config::load(&args.config)?, true)
    } else {
        (Config::default(), false)
    };
    args.apply(&mut config);

    logging::init(
        &config.logging.level,
        config.logging.format,
        config.logging.file.as_deref(),
    )?;
    if from_file {
        info!(path = %args.config.display(), "configuration loaded");
    } else {
        info!(path = %args.config.display(), "no configuration file, using defaults");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    rt.block_on(async {
        let ctx = Context::build(config)?;
        daemon::run(ctx).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_config() {
        let args = Args::parse_from([
            "routewise",
            "--allow-remote",
            "-vv",
            "--dns-port",
            "5353",
            "--proxy-port",
            "9000",
            "--log-format",
            "json",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert!(config.proxy.allow_remote);
        assert_eq!(config.dns.port, 5353);
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(Args::try_parse_from(["routewise", "-q", "-v"]).is_err());
    }
}
