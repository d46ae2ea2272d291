//! Harness Operations Benchmarks
//!
//! Benchmarks for the per-frame hot path: drop decisions, presentation
//! timestamps and completion correlation.
//!
//! Run with: `cargo bench --bench harness_ops`

use codecbench::{nearest_match, DropDecision, FramePacer, TestDefinition, TestStatistics};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_drop_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("drop_decision");

    let cases = vec![
        ("passthrough", 1.0, Vec::new()),
        ("60_to_30", 2.0, Vec::new()),
        ("30_to_24", 1.25, Vec::new()),
        ("60_to_30_explicit", 2.0, (0..1_000).step_by(7).collect::<Vec<u64>>()),
    ];

    for (name, ratio, explicit) in cases {
        let decision = DropDecision::new(explicit);
        group.bench_with_input(BenchmarkId::from_parameter(name), &ratio, |bench, &ratio| {
            bench.iter(|| {
                let kept = (0..1_000u64)
                    .filter(|&i| decision.evaluate(black_box(i), ratio).is_none())
                    .count();
                black_box(kept);
            });
        });
    }

    group.finish();
}

fn bench_presentation_time(c: &mut Criterion) {
    let pacer = FramePacer::new(Some(29.97), Some(15.0), 132);
    c.bench_function("presentation_time_1000", |bench| {
        bench.iter(|| {
            let last = (0..1_000u64)
                .map(|i| pacer.presentation_time_usec(black_box(i)))
                .last();
            black_box(last);
        });
    });
}

fn bench_nearest_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("nearest_match");

    for pending in [1usize, 8, 32, 128] {
        let candidates: Vec<i64> = (0..pending as i64).map(|i| i * 33_333).collect();
        let target = candidates[pending / 2] + 1;
        group.bench_with_input(
            BenchmarkId::from_parameter(pending),
            &candidates,
            |bench, candidates| {
                bench.iter(|| {
                    black_box(nearest_match(candidates.iter().copied(), black_box(target)));
                });
            },
        );
    }

    group.finish();
}

fn bench_correlation_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation_cycle");

    for depth in [1u64, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |bench, &depth| {
            bench.iter(|| {
                let stats = TestStatistics::new(&TestDefinition::new("bench", "mock", "clip.yuv"));
                for i in 0..300u64 {
                    stats.start_frame(i as i64 * 33_333, i);
                    // Keep `depth` submissions in flight, completing the oldest
                    if i + 1 >= depth {
                        let oldest = i + 1 - depth;
                        let _ = stats.complete_encoded(oldest as i64 * 33_333, 1_000, false);
                    }
                }
                black_box(stats.completed_count());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_drop_decision,
    bench_presentation_time,
    bench_nearest_match,
    bench_correlation_cycle
);
criterion_main!(benches);
