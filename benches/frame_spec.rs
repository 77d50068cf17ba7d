//! Frame spec expansion benchmarks.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use renderq::frame_spec::{expand, expand_with, ExclusionMode};

fn bench_expand(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_spec");
    group.sample_size(50);

    group.bench_function("long_range_with_exclusions", |b| {
        b.iter(|| black_box(expand(black_box("1-10000, ^500-1500, ^2000-2999x3, 12000"))));
    });

    group.bench_function("many_tokens_sticky", |b| {
        let spec = (0..500)
            .map(|index| format!("{}-{}x2", index * 20, index * 20 + 15))
            .collect::<Vec<_>>()
            .join(",")
            + ",^100-4000";
        b.iter(|| black_box(expand_with(black_box(&spec), ExclusionMode::Sticky)));
    });

    group.bench_function("decimal_steps", |b| {
        b.iter(|| black_box(expand(black_box("0-250x0.25, ^10-20"))));
    });

    group.finish();
}

criterion_group!(benches, bench_expand);
criterion_main!(benches);
