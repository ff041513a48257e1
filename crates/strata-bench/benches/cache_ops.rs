//! Criterion micro-benchmarks for the cache check/compute/mark hot
//! path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_bench::{realize_to, reference_profile};
use strata_core::{Stage, Value};

fn bench_guard_check(c: &mut Criterion) {
    let (mut state, entries) = reference_profile(8, 64);
    realize_to(&mut state, Stage::Position);
    let (sx, cx) = entries[0];
    state.mark_cache_value_realized(sx, cx).unwrap();
    c.bench_function("is_cache_value_realized", |b| {
        b.iter(|| black_box(state.is_cache_value_realized(sx, cx).unwrap()));
    });
}

fn bench_lazy_realize_cycle(c: &mut Criterion) {
    let (mut state, entries) = reference_profile(8, 64);
    realize_to(&mut state, Stage::Position);
    let (sx, cx) = entries[0];
    c.bench_function("lazy_compute_mark_unmark", |b| {
        b.iter(|| {
            if !state.is_cache_value_realized(sx, cx).unwrap() {
                *state.upd_cache_entry(sx, cx).unwrap() = Value::Real(1.0);
                state.mark_cache_value_realized(sx, cx).unwrap();
            }
            state.mark_cache_value_not_realized(sx, cx).unwrap();
        });
    });
}

fn bench_cache_only_invalidation(c: &mut Criterion) {
    let (mut state, _) = reference_profile(8, 64);
    realize_to(&mut state, Stage::Report);
    c.bench_function("invalidate_cache_at_position", |b| {
        b.iter(|| {
            state
                .invalidate_all_cache_at_or_above(Stage::Position)
                .unwrap();
            realize_to(&mut state, Stage::Report);
        });
    });
}

criterion_group!(
    benches,
    bench_guard_check,
    bench_lazy_realize_cycle,
    bench_cache_only_invalidation,
);
criterion_main!(benches);
