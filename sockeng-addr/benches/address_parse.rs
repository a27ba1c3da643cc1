//! Benchmarks for address parsing and classification.
//!
//! These cover the per-datagram address work of a socket:
//! - parsing dotted-quad and IPv6 text forms
//! - canonical formatting
//! - classification and subnet membership
//!
//! Run with: cargo bench -p sockeng-addr --bench address_parse

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use sockeng_addr::{parse_subnet, HostAddress};

const INPUTS: &[&str] = &[
    "192.168.10.254",
    "::1",
    "2001:db8:85a3::8a2e:370:7334",
    "::ffff:10.0.0.1",
    "fe80::1%eth0",
];

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for input in INPUTS {
        group.bench_with_input(BenchmarkId::from_parameter(input), input, |b, text| {
            b.iter(|| HostAddress::parse(black_box(text)))
        });
    }
    group.finish();
}

fn bench_display(c: &mut Criterion) {
    let addresses: Vec<HostAddress> = INPUTS.iter().filter_map(|s| HostAddress::parse(s)).collect();
    c.bench_function("display_all", |b| {
        b.iter(|| {
            for address in &addresses {
                black_box(address.to_string());
            }
        })
    });
}

fn bench_classify(c: &mut Criterion) {
    let addresses: Vec<HostAddress> = INPUTS.iter().filter_map(|s| HostAddress::parse(s)).collect();
    let (network, prefix) = parse_subnet("192.168.0.0/16");
    c.bench_function("classify_and_subnet", |b| {
        b.iter(|| {
            for address in &addresses {
                black_box(address.classify());
                black_box(address.is_in_subnet(&network, prefix));
            }
        })
    });
}

criterion_group!(benches, bench_parse, bench_display, bench_classify);
criterion_main!(benches);
