//! Benchmarks for move-detection scoring
//!
//! Measures similarity scoring across content sizes (full edit distance
//! below the 4 KiB cutoff, windowed sampling above it) and the greedy
//! pairing over growing candidate sets.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pushwork::config::MoveThresholds;
use pushwork::moves::{detect_moves, similarity, MoveSide};
use pushwork::tree::FileContent;
use std::hint::black_box;

/// Deterministic pseudo-text of the requested length
fn make_text(len: usize, seed: u64) -> String {
    let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
    let mut out = String::with_capacity(len + 8);
    let mut state = seed;
    while out.len() < len {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push_str(words[(state >> 33) as usize % words.len()]);
        out.push(' ');
    }
    out.truncate(len);
    out
}

/// A lightly edited copy of `base`
fn edit_copy(base: &str) -> String {
    let mut edited = base.to_string();
    let at = edited.len() / 2;
    edited.insert_str(at - (at % 4), "EDIT");
    edited
}

fn bench_similarity_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("similarity_by_size");

    let sizes = vec![("1_kib", 1024), ("4_kib", 4096), ("64_kib", 64 * 1024), ("1_mib", 1024 * 1024)];

    for (name, size) in sizes {
        let base = make_text(size, 7);
        let edited = edit_copy(&base);
        let a = FileContent::Text(base);
        let b = FileContent::Text(edited);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &size, |bench, _| {
            bench.iter(|| black_box(similarity(&a, &b)));
        });
    }

    group.finish();
}

fn bench_binary_similarity(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_similarity");

    let payload: Vec<u8> = (0u8..=255).cycle().take(64 * 1024).collect();
    let mut edited = payload.clone();
    edited[1000] ^= 0xff;

    let a = FileContent::Binary(payload);
    let b = FileContent::Binary(edited);

    group.throughput(Throughput::Bytes(64 * 1024));
    group.bench_function("64_kib", |bench| {
        bench.iter(|| black_box(similarity(&a, &b)));
    });

    group.finish();
}

fn bench_pairing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pairing");

    let counts = vec![("4x4", 4), ("16x16", 16), ("64x64", 64)];

    for (name, count) in counts {
        let deleted: Vec<MoveSide> = (0..count)
            .map(|i| MoveSide {
                key: format!("old/file_{i}.txt"),
                content: FileContent::Text(make_text(2048, i as u64)),
            })
            .collect();
        let created: Vec<MoveSide> = (0..count)
            .map(|i| MoveSide {
                key: format!("new/file_{i}.txt"),
                content: FileContent::Text(edit_copy(&make_text(2048, i as u64))),
            })
            .collect();
        let thresholds = MoveThresholds::default();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &count, |bench, _| {
            bench.iter(|| black_box(detect_moves(&deleted, &created, &thresholds).len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_similarity_by_size, bench_binary_similarity, bench_pairing);
criterion_main!(benches);
