//! Criterion micro-benchmarks for configuration, compaction, and
//! invalidation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_bench::{realize_to, reference_profile};
use strata_core::Stage;

fn bench_configure_and_model(c: &mut Criterion) {
    c.bench_function("configure_8x64_to_model", |b| {
        b.iter(|| {
            let (mut state, _) = reference_profile(8, 64);
            realize_to(&mut state, Stage::Model);
            black_box(state.nq())
        });
    });
}

fn bench_realize_full_ladder(c: &mut Criterion) {
    c.bench_function("realize_empty_to_report", |b| {
        b.iter_with_setup(
            || reference_profile(8, 64).0,
            |mut state| {
                realize_to(&mut state, Stage::Report);
                black_box(state.system_stage())
            },
        );
    });
}

fn bench_invalidate_and_rerealize(c: &mut Criterion) {
    // The per-step hot path: write q (backing out Position..Report),
    // then climb back up.
    let (mut state, _) = reference_profile(8, 64);
    realize_to(&mut state, Stage::Report);
    c.bench_function("step_invalidate_rerealize", |b| {
        b.iter(|| {
            state.upd_q().unwrap()[0] += 1.0;
            realize_to(&mut state, Stage::Report);
            black_box(state.system_stage())
        });
    });
}

fn bench_version_snapshot_diff(c: &mut Criterion) {
    let (mut state, _) = reference_profile(8, 64);
    realize_to(&mut state, Stage::Report);
    let snapshot = state.system_stage_versions();
    c.bench_function("version_snapshot_diff", |b| {
        b.iter(|| black_box(state.lowest_system_stage_difference(&snapshot)));
    });
}

criterion_group!(
    benches,
    bench_configure_and_model,
    bench_realize_full_ladder,
    bench_invalidate_and_rerealize,
    bench_version_snapshot_diff,
);
criterion_main!(benches);
