//! Connection manager: picks a transport for a verdict and fails over.
//!
//! Candidates per route:
//! - DIRECT: the direct transport, then tunnels in preference order
//! - TUNNEL: tunnels in preference order
//! - BLOCKED: none, fails immediately
//!
//! The last transport that worked for a host is tried first. Every failed
//! attempt increments that transport's counter in the host metadata; a
//! success resets it. These counters feed the classifier's learned step.

pub mod pool;
pub mod sni;

pub use pool::{ConnectionPool, PoolKey};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace};

use crate::backend::{Backend, BackendRegistry, BoxStream, Destination, TransportKind};
use crate::cache::{HostMeta, RecordCache};
use crate::config::{CacheConfig, ConnectConfig};
use crate::error::ConnectError;
use crate::policy::{Classifier, Route, Verdict, normalize_host};

/// An open stream and how it was obtained.
pub struct Connected {
    pub stream: BoxStream,
    pub transport: TransportKind,
    /// Route actually taken; differs from the requested one after an SNI re-route
    pub route: Route,
    pub attempted: usize,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("transport", &self.transport)
            .field("route", &self.route)
            .field("attempted", &self.attempted)
            .finish_non_exhaustive()
    }
}

pub struct ConnectManager {
    backends: BackendRegistry,
    classifier: Arc<Classifier>,
    ip_cache: Arc<RecordCache<HostMeta>>,
    pool: Option<Arc<ConnectionPool>>,
    order: Vec<TransportKind>,
    connect_timeout: Duration,
    max_select: Duration,
    split_sni: bool,
    meta_ttl: Duration,
}

impl ConnectManager {
    pub fn new(
        config: &ConnectConfig,
        cache_config: &CacheConfig,
        backends: BackendRegistry,
        classifier: Arc<Classifier>,
        ip_cache: Arc<RecordCache<HostMeta>>,
    ) -> Self {
        Self {
            backends,
            classifier,
            ip_cache,
            pool: config
                .pool_enabled
                .then(|| Arc::new(ConnectionPool::new(config.pool_idle()))),
            order: config.order.clone(),
            connect_timeout: config.connect_timeout(),
            max_select: config.max_select(),
            split_sni: config.split_sni,
            meta_ttl: cache_config.ip_ttl(),
        }
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_deref()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Whether a DIRECT connection to `dest` should wait for the client's
    /// ClientHello before committing to a transport.
    pub fn wants_preface(&self, dest: &Destination, verdict: Verdict) -> bool {
        self.split_sni && verdict.route == Route::Direct && dest.port == 443
    }

    /// Ordered candidate transports for `host` under `route`.
    pub fn candidates(&self, host: &str, route: Route) -> Vec<Arc<dyn Backend>> {
        let mut candidates: Vec<Arc<dyn Backend>> = match route {
            Route::Blocked => return Vec::new(),
            Route::Direct => self
                .backends
                .get(TransportKind::Direct)
                .into_iter()
                .chain(self.backends.tunnels(&self.order))
                .collect(),
            Route::Tunnel => self.backends.tunnels(&self.order),
        };

        let hint = self.ip_cache.get(host).and_then(|meta| meta.last_success());
        if let Some(hint) = hint {
            if let Some(pos) = candidates.iter().position(|b| b.kind() == hint) {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        }
        candidates
    }

    /// Open a stream to `dest` under `verdict`.
    pub async fn open(&self, dest: &Destination, verdict: Verdict) -> Result<Connected, ConnectError> {
        self.select(dest, verdict.route, false).await
    }

    /// Open a stream and forward the client's first bytes.
    ///
    /// With SNI split enabled, a DIRECT verdict is re-checked against the
    /// TLS server name first: a name classified TUNNEL or BLOCKED wins over
    /// the address-based verdict.
    pub async fn open_with_preface(
        &self,
        dest: &Destination,
        verdict: Verdict,
        preface: &[u8],
    ) -> Result<Connected, ConnectError> {
        let tls = sni::is_client_hello(preface);
        let mut target = dest.clone();
        let mut route = verdict.route;

        if self.split_sni && route == Route::Direct {
            if let Some(name) = sni::parse_sni(preface) {
                let by_name = self.classifier.classify(&name).await;
                if by_name.route != Route::Direct {
                    debug!(%dest, sni = %name, route = %by_name.route, "sni overrides verdict");
                    route = by_name.route;
                    if dest.ip().is_some() {
                        target = Destination::new(name, dest.port);
                    }
                }
            }
        }

        let mut connected = self.select(&target, route, tls).await?;
        if !preface.is_empty() {
            connected
                .stream
                .write_all(preface)
                .await
                .map_err(ConnectError::from_io)?;
        }
        Ok(connected)
    }

    async fn select(
        &self,
        dest: &Destination,
        route: Route,
        tls: bool,
    ) -> Result<Connected, ConnectError> {
        if route == Route::Blocked {
            return Err(ConnectError::Blocked);
        }

        let host = normalize_host(&dest.host);
        let start = Instant::now();
        let mut attempted = 0;

        for backend in self.candidates(&host, route) {
            let kind = backend.kind();
            if !backend.is_available() {
                trace!(%dest, transport = %kind, "skipping unavailable transport");
                continue;
            }

            let key = PoolKey::new(dest, kind, tls);
            if let Some(stream) = self.pool.as_ref().and_then(|p| p.take(&key)) {
                trace!(%dest, transport = %kind, "reusing pooled connection");
                self.record_success(&host, kind, route);
                self.warm(backend, key);
                return Ok(Connected {
                    stream,
                    transport: kind,
                    route,
                    attempted: attempted + 1,
                });
            }

            let remaining = self.max_select.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                debug!(%dest, attempted, "selection time exhausted");
                break;
            }

            attempted += 1;
            let budget = self.connect_timeout.min(remaining);
            let result = tokio::time::timeout(budget, backend.open_stream(dest))
                .await
                .unwrap_or(Err(ConnectError::Timeout));

            match result {
                Ok(stream) => {
                    self.record_success(&host, kind, route);
                    info!(
                        %dest,
                        transport = %kind,
                        route = %route,
                        attempted,
                        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "connected"
                    );
                    if tls {
                        self.warm(backend, key);
                    }
                    return Ok(Connected {
                        stream,
                        transport: kind,
                        route,
                        attempted,
                    });
                }
                Err(e) => {
                    let failures = self
                        .ip_cache
                        .update(&host, self.meta_ttl, |meta| meta.record_failure(kind));
                    debug!(%dest, transport = %kind, failures, error = %e, "transport failed");
                }
            }
        }

        Err(ConnectError::AllTransportsFailed { attempted })
    }

    fn record_success(&self, host: &str, kind: TransportKind, route: Route) {
        self.ip_cache
            .update(host, self.meta_ttl, |meta| meta.record_success(kind, route));
    }

    /// Open one spare stream in the background for the next connection.
    fn warm(&self, backend: Arc<dyn Backend>, key: PoolKey) {
        let Some(pool) = self.pool.clone() else {
            return;
        };
        if pool.has_idle(&key) {
            return;
        }
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            if let Ok(Ok(stream)) = tokio::time::timeout(timeout, backend.open_stream(&key.dest)).await {
                trace!(dest = %key.dest, transport = %key.transport, "pooled spare connection");
                pool.put(key, stream);
            }
        });
    }
}
