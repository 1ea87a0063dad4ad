//! Benchmarks for destination classification.
//!
//! Measures tunnel-list lookups and a full cache-only classification.

use criterion::{BenchmarkId, Criterion, Throughput, black_box};
use std::sync::Arc;

use routewise::cache::{ManualClock, RecordCache};
use routewise::config::PolicyConfig;
use routewise::policy::{Blocklist, Classifier, NoGeoIp, Route, TUNNEL_DOMAINS, UserRule};

fn bench_contains(c: &mut Criterion) {
    let blocklist = Blocklist::from_text(TUNNEL_DOMAINS);

    let mut group = c.benchmark_group("blocklist");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("contains", "exact_match"), |b| {
        b.iter(|| blocklist.contains(black_box("google.com")))
    });

    group.bench_function(BenchmarkId::new("contains", "subdomain_match"), |b| {
        b.iter(|| blocklist.contains(black_box("mail.static.google.com")))
    });

    group.bench_function(BenchmarkId::new("contains", "miss"), |b| {
        b.iter(|| blocklist.contains(black_box("www.example.org")))
    });

    group.bench_function(BenchmarkId::new("contains", "deep_miss"), |b| {
        b.iter(|| blocklist.contains(black_box("a.b.c.d.e.f.example.org")))
    });

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(0));
    let policy = PolicyConfig {
        auto_direct: false,
        ..PolicyConfig::default()
    };
    let classifier = Classifier::new(
        &policy,
        Arc::new(Blocklist::from_text(TUNNEL_DOMAINS)),
        Arc::new(NoGeoIp),
        Arc::new(RecordCache::new("domain", 1000, clock.clone())),
        Arc::new(RecordCache::new("ip", 1000, clock)),
    )
    .with_rules(
        (0..50)
            .map(|i| UserRule::parse(&format!("*.rule{i}.example"), Route::Direct, i))
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_default(),
    );

    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("classify_cached", "rule_hit"), |b| {
        b.iter(|| classifier.classify_cached(black_box("www.rule42.example")))
    });

    group.bench_function(BenchmarkId::new("classify_cached", "tunnel_list"), |b| {
        b.iter(|| classifier.classify_cached(black_box("www.google.com")))
    });

    group.bench_function(BenchmarkId::new("classify_cached", "default"), |b| {
        b.iter(|| classifier.classify_cached(black_box("unlisted.example.net")))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_contains(&mut criterion);
    bench_classify(&mut criterion);
    criterion.final_summary();
}
