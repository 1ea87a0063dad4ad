//! Benchmarks for the DNS wire codec.

use criterion::{Criterion, Throughput, black_box};
use std::net::IpAddr;

use routewise::dns::{DnsQuery, DnsResponse, MAX_UDP_RESPONSE, TYPE_A, build_query, parse_answer};

fn bench_codec(c: &mut Criterion) {
    let query_bytes = build_query(0x1234, "www.example.com", TYPE_A);
    let query = DnsQuery::parse(&query_bytes).unwrap_or_else(|| panic!("bench query must parse"));
    let ips: Vec<IpAddr> = (1..=8).map(|i| IpAddr::from([93, 184, 216, i])).collect();
    let response = DnsResponse::addresses(&query, &ips, 300);
    let response_bytes = response.to_bytes();

    let mut group = c.benchmark_group("dns_codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_query", |b| {
        b.iter(|| DnsQuery::parse(black_box(&query_bytes)))
    });

    group.bench_function("build_query", |b| {
        b.iter(|| build_query(black_box(0x1234), black_box("www.example.com"), TYPE_A))
    });

    group.bench_function("encode_response", |b| b.iter(|| black_box(&response).to_bytes()));

    group.bench_function("encode_truncated", |b| {
        b.iter(|| black_box(&response).to_udp_bytes(MAX_UDP_RESPONSE))
    });

    group.bench_function("parse_answer", |b| {
        b.iter(|| parse_answer(black_box(&response_bytes), 0x1234))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_codec(&mut criterion);
    criterion.final_summary();
}
