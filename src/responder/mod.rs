//! DNS responder: answers local queries consistently with routing policy.
//!
//! Per query: parse, classify, then serve by route.
//! - BLOCKED: NXDOMAIN or a sink address, by configuration
//! - DIRECT: the resolver's addresses and TTL
//! - TUNNEL: an intercept address the proxy maps back to the domain
//!
//! Malformed packets are dropped. Every other failure, including the
//! query deadline, is answered with SERVFAIL.

mod intercept;

pub use intercept::InterceptPool;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{BlockResponse, DnsConfig};
use crate::dns::{DnsQuery, DnsResponse, TYPE_A};
use crate::policy::{Classifier, Route, normalize_host};
use crate::resolver::DnsResolver;
use crate::stats::Stats;

/// TTL for sink answers to blocked names.
const SINK_TTL: u32 = 300;

pub struct Responder {
    classifier: Arc<Classifier>,
    resolver: Arc<DnsResolver>,
    intercept: Arc<InterceptPool>,
    stats: Arc<Stats>,
    block_response: BlockResponse,
    query_timeout: Duration,
    intercept_ttl: u32,
}

impl Responder {
    pub fn new(
        config: &DnsConfig,
        classifier: Arc<Classifier>,
        resolver: Arc<DnsResolver>,
        intercept: Arc<InterceptPool>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            classifier,
            resolver,
            intercept,
            stats,
            block_response: config.block_response,
            query_timeout: config.query_timeout(),
            intercept_ttl: config.intercept_ttl_secs,
        }
    }

    /// Answer one raw query. `None` means drop the packet.
    pub async fn handle(&self, packet: &[u8]) -> Option<DnsResponse> {
        let Some(query) = DnsQuery::parse(packet) else {
            trace!(len = packet.len(), "dropping malformed dns packet");
            return None;
        };

        let start = Instant::now();
        let answer = tokio::time::timeout(self.query_timeout, self.answer(&query)).await;
        let elapsed = start.elapsed();

        let response = match answer {
            Ok(Some((route, response))) => {
                self.stats.record(route, elapsed);
                debug!(
                    domain = %query.domain,
                    qtype = query.qtype,
                    route = %route,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "dns answer"
                );
                response
            }
            Ok(None) => {
                self.stats.record_failed(elapsed);
                debug!(domain = %query.domain, "dns resolution failed");
                DnsResponse::servfail(&query)
            }
            Err(_) => {
                self.stats.record_failed(elapsed);
                debug!(domain = %query.domain, "dns query deadline exceeded");
                DnsResponse::servfail(&query)
            }
        };
        Some(response)
    }

    /// `None` when a DIRECT resolution failed.
    async fn answer(&self, query: &DnsQuery) -> Option<(Route, DnsResponse)> {
        if !query.is_address() {
            // NODATA: the name may exist, but we only serve addresses
            return Some((Route::Direct, DnsResponse::addresses(query, &[], 0)));
        }

        let verdict = self.classifier.classify(&query.domain).await;
        let response = match verdict.route {
            Route::Blocked => match self.block_response {
                BlockResponse::Nxdomain => DnsResponse::nxdomain(query),
                BlockResponse::Sink => DnsResponse::addresses(
                    query,
                    &[
                        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    ],
                    SINK_TTL,
                ),
            },
            Route::Direct => {
                let answer = self.resolver.resolve(&query.domain).await.ok()?;
                DnsResponse::addresses(query, &answer.ips, answer.ttl.as_secs() as u32)
            }
            Route::Tunnel => {
                if query.qtype == TYPE_A {
                    let ip = self.intercept.allocate(&normalize_host(&query.domain));
                    DnsResponse::addresses(query, &[IpAddr::V4(ip)], self.intercept_ttl)
                } else {
                    // AAAA: no intercept addresses, so clients fall back to A
                    DnsResponse::addresses(query, &[], 0)
                }
            }
        };
        Some((verdict.route, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ManualClock, RecordCache};
    use crate::config::{CacheConfig, PolicyConfig, ResolverConfig};
    use crate::dns::{Rcode, TYPE_AAAA, build_query};
    use crate::error::ResolutionError;
    use crate::policy::{Blocklist, NoGeoIp, UserRule};
    use crate::resolver::{Lookup, ResolveStrategy};
    use async_trait::async_trait;

    struct Answering(Duration);

    #[async_trait]
    impl ResolveStrategy for Answering {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn lookup(&self, _domain: &str) -> Result<Lookup, ResolutionError> {
            tokio::time::sleep(self.0).await;
            Ok(Lookup {
                ips: vec!["93.184.216.34".parse().unwrap(), "2606:2800::1".parse().unwrap()],
                ttl: Some(Duration::from_secs(600)),
            })
        }
    }

    fn responder(config: DnsConfig, delay: Duration) -> Responder {
        let clock = Arc::new(ManualClock::new(0));
        let domain_cache = Arc::new(RecordCache::new("domain", 64, clock.clone()));
        let ip_cache = Arc::new(RecordCache::new("ip", 64, clock));
        let resolver = Arc::new(DnsResolver::new(
            vec![Arc::new(Answering(delay))],
            domain_cache.clone(),
            &ResolverConfig::default(),
            &CacheConfig::default(),
        ));
        let policy = PolicyConfig {
            auto_direct: false,
            ..PolicyConfig::default()
        };
        let classifier = Classifier::new(
            &policy,
            Arc::new(Blocklist::from_domains(["blocked.example"])),
            Arc::new(NoGeoIp),
            domain_cache,
            ip_cache,
        )
        .with_rules(vec![UserRule::parse("ads.example", Route::Blocked, 0).unwrap()]);

        let intercept = Arc::new(InterceptPool::new(config.intercept_network().unwrap(), 64));
        Responder::new(
            &config,
            Arc::new(classifier),
            resolver,
            intercept,
            Arc::new(Stats::new()),
        )
    }

    async fn ask(responder: &Responder, domain: &str, qtype: u16) -> DnsResponse {
        responder
            .handle(&build_query(0x4242, domain, qtype))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn malformed_packet_is_dropped() {
        let responder = responder(DnsConfig::default(), Duration::ZERO);
        assert!(responder.handle(&[0u8; 5]).await.is_none());
    }

    #[tokio::test]
    async fn direct_answers_with_resolved_addresses() {
        let responder = responder(DnsConfig::default(), Duration::ZERO);

        let a = ask(&responder, "www.example.com", TYPE_A).await;
        assert_eq!(a.id, 0x4242);
        assert_eq!(a.rcode(), Rcode::NoError as u16);
        assert_eq!(a.answers.len(), 1);
        assert_eq!(a.answers[0].ttl, 600);

        let aaaa = ask(&responder, "www.example.com", TYPE_AAAA).await;
        assert_eq!(aaaa.answers.len(), 1);
        assert_eq!(aaaa.answers[0].rdata.len(), 16);
    }

    #[tokio::test]
    async fn blocked_gets_nxdomain_or_sink() {
        let nx = responder(DnsConfig::default(), Duration::ZERO);
        let response = ask(&nx, "ads.example", TYPE_A).await;
        assert_eq!(response.rcode(), Rcode::NxDomain as u16);

        let sink = responder(
            DnsConfig {
                block_response: BlockResponse::Sink,
                ..DnsConfig::default()
            },
            Duration::ZERO,
        );
        let response = ask(&sink, "ads.example", TYPE_A).await;
        assert_eq!(response.rcode(), Rcode::NoError as u16);
        assert_eq!(response.answers[0].rdata, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn tunnel_gets_intercept_address() {
        let responder = responder(DnsConfig::default(), Duration::ZERO);

        let a = ask(&responder, "www.blocked.example", TYPE_A).await;
        assert_eq!(a.answers.len(), 1);
        let ip = IpAddr::V4(Ipv4Addr::new(
            a.answers[0].rdata[0],
            a.answers[0].rdata[1],
            a.answers[0].rdata[2],
            a.answers[0].rdata[3],
        ));
        assert_eq!(
            responder.intercept.lookup(ip).as_deref(),
            Some("www.blocked.example")
        );

        let aaaa = ask(&responder, "www.blocked.example", TYPE_AAAA).await;
        assert_eq!(aaaa.rcode(), Rcode::NoError as u16);
        assert!(aaaa.answers.is_empty());
    }

    #[tokio::test]
    async fn other_types_get_nodata() {
        let responder = responder(DnsConfig::default(), Duration::ZERO);

        let mx = ask(&responder, "example.com", 15).await;
        assert_eq!(mx.rcode(), Rcode::NoError as u16);
        assert!(mx.answers.is_empty());
    }

    #[tokio::test]
    async fn slow_resolution_is_servfail_at_deadline() {
        let responder = responder(
            DnsConfig {
                query_timeout_ms: 50,
                ..DnsConfig::default()
            },
            Duration::from_secs(2),
        );

        let start = Instant::now();
        let response = ask(&responder, "slow.example", TYPE_A).await;
        assert_eq!(response.rcode(), Rcode::ServFail as u16);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(responder.stats.snapshot_and_reset().failed, 1);
    }
}
