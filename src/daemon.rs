//! Daemon orchestration.
//!
//! Binds the DNS listeners and the proxy front-end, starts the maintenance
//! ticker and the stats log, then runs until interrupted. Caches are saved
//! on the way out.

use anyhow::{Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::Context;
use crate::proxy::{ProxyHandler, ProxyServer};
use crate::server::tcp::TcpServer;
use crate::server::udp::UdpServer;
use crate::server::{Protocol, bind_with_fallback};

/// Run until ctrl-c. Fails only if no listener at all could be bound.
pub async fn run(ctx: Arc<Context>) -> Result<()> {
    let mut tasks = start_dns(&ctx).await;
    let dns_listeners = tasks.len();
    tasks.extend(start_proxy(&ctx).await);

    if tasks.is_empty() {
        bail!("no DNS or proxy listener could be bound");
    }
    if dns_listeners == 0 {
        warn!("DNS responder is not listening anywhere");
    }

    tasks.push(ctx.spawn_maintenance());
    tasks.push(spawn_stats(ctx.clone()));

    info!(
        tunnel_domains = ctx.classifier.blocklist().len(),
        cached_domains = ctx.domain_cache.len(),
        cached_hosts = ctx.ip_cache.len(),
        "routewise running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal, running until killed");
        std::future::pending::<()>().await;
    }

    info!("shutting down");
    for task in &tasks {
        task.abort();
    }
    let saving = ctx.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || saving.save_caches()).await {
        warn!(error = %e, "cache save task failed");
    }
    Ok(())
}

async fn start_dns(ctx: &Arc<Context>) -> Vec<JoinHandle<()>> {
    let dns = &ctx.config.dns;
    let mut tasks = Vec::new();

    for ip in ctx.config.dns_listen_ips() {
        match bind_with_fallback(ip, dns.port, dns.backup_port, Protocol::Udp, |addr| {
            UdpSocket::bind(addr)
        })
        .await
        {
            Ok(socket) => {
                let server = UdpServer::from_socket(socket);
                if let Ok(addr) = server.local_addr() {
                    info!(%addr, protocol = "udp", "dns listening");
                }
                tasks.push(server.start(ctx.responder.clone()));
            }
            Err(e) => warn!(%ip, port = dns.port, error = %e, "dns udp bind failed"),
        }

        match bind_with_fallback(ip, dns.port, dns.backup_port, Protocol::Tcp, |addr| {
            TcpListener::bind(addr)
        })
        .await
        {
            Ok(listener) => {
                let server = TcpServer::from_listener(listener);
                if let Ok(addr) = server.local_addr() {
                    info!(%addr, protocol = "tcp", "dns listening");
                }
                tasks.push(server.start(ctx.responder.clone(), dns.query_timeout()));
            }
            Err(e) => warn!(%ip, port = dns.port, error = %e, "dns tcp bind failed"),
        }
    }
    tasks
}

async fn start_proxy(ctx: &Arc<Context>) -> Vec<JoinHandle<()>> {
    let handler = Arc::new(ProxyHandler::from_context(ctx));
    let mut tasks = Vec::new();

    for addr in ctx.config.proxy_listen_addrs() {
        match ProxyServer::bind(addr).await {
            Ok(server) => {
                info!(%addr, "proxy listening");
                tasks.push(server.start(handler.clone()));
            }
            Err(e) => warn!(%addr, error = %e, "proxy bind failed"),
        }
    }
    tasks
}

fn spawn_stats(ctx: Arc<Context>) -> JoinHandle<()> {
    let every = Duration::from_secs(ctx.config.logging.stats_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = ctx.stats.snapshot_and_reset();
            info!(
                uptime_secs = stats.uptime_secs,
                requests = stats.requests,
                direct = stats.direct,
                tunneled = stats.tunneled,
                blocked = stats.blocked,
                failed = stats.failed,
                avg_response_ms = stats.avg_response_ms,
                domain_cache = ctx.domain_cache.len(),
                ip_cache = ctx.ip_cache.len(),
                intercepted = ctx.intercept.len(),
                dns_races = ctx.resolver.race_count(),
                "stats"
            );
        }
    })
}
