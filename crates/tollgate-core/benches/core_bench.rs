//! Criterion benchmarks for tollgate-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema**: DDL init + migration overhead.
//! 2. **guards**: Clamping / truncation helpers.
//! 3. **aggregation**: Change-set aggregation at various sizes.
//! 4. **risk**: Risk evaluation with and without hard factors.
//! 5. **selection**: Threshold selection and history-hinted selection.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/tollgate-core/Cargo.toml
//! # Run only the selection group:
//! cargo bench --manifest-path crates/tollgate-core/Cargo.toml -- selection
//! ```

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use tollgate_core::analysis::{aggregate, RiskEvaluator};
use tollgate_core::gates::guards::{clamp_concurrency, clamp_int, truncate_output};
use tollgate_core::gates::{select_index, HistoryHint, LevelSelector};
use tollgate_core::models::{
    ChangeKind, CheckOutcome, CheckResult, Criticality, ExecutionRun, FileCategory, FileChange,
    ImpactSummary, RiskFactor, Termination, Verdict,
};
use tollgate_core::store::schema::{migrate_schema, SCHEMA_STATEMENTS};
use tollgate_core::OrchestratorConfig;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Synthetic change set: mostly source edits with a sprinkling of tests,
/// docs and one migration.
fn change_set(n: usize) -> Vec<FileChange> {
    let kinds = [
        ChangeKind::Modified,
        ChangeKind::Created,
        ChangeKind::Modified,
        ChangeKind::Renamed,
    ];
    (0..n)
        .map(|i| {
            let category = match i % 10 {
                0 => FileCategory::Test,
                1 => FileCategory::Documentation,
                2 if i == 2 => FileCategory::Migration,
                _ => FileCategory::Source,
            };
            FileChange::new(format!("src/pkg{}/module_{i}.rs", i / 8), kinds[i % kinds.len()])
                .with_lines((i % 40) as u64 + 1, (i % 7) as u64)
                .with_complexity_delta((i % 5) as i64 - 1)
                .with_category(category)
                .with_language("rust")
        })
        .collect()
}

fn past_run(shape: &str, level: &str) -> ExecutionRun {
    let mut run = ExecutionRun::new(level);
    run.shape_fingerprint = shape.to_string();
    run.enter_level(level, Duration::from_secs(300));
    run.append(CheckResult {
        name: "lint".to_string(),
        level: level.to_string(),
        criticality: Criticality::Required,
        outcome: CheckOutcome::Pass,
        duration: Duration::from_millis(800),
        output: String::new(),
        attempts: 1,
        reported_risk: None,
        completed_at_ms: 800,
    });
    run.finalize(Verdict::Passed, Termination::AllRequiredPassed, Duration::from_secs(1));
    run
}

// ---------------------------------------------------------------------------
// Benchmark: Schema initialization & migration
// ---------------------------------------------------------------------------

fn bench_schema_init(c: &mut Criterion) {
    c.bench_function("schema_init_and_migrate", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
            for stmt in SCHEMA_STATEMENTS {
                conn.execute_batch(stmt).unwrap();
            }
            migrate_schema(&conn).unwrap();
            black_box(&conn);
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: Guard clamping functions
// ---------------------------------------------------------------------------

fn bench_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");

    group.bench_function("clamp_int", |b| {
        b.iter(|| clamp_int(black_box(150), black_box(1), black_box(100)));
    });

    group.bench_function("clamp_concurrency", |b| {
        b.iter(|| clamp_concurrency(black_box(200), black_box(64)));
    });

    group.bench_function("truncate_output_short", |b| {
        b.iter(|| truncate_output(black_box("ok: 14 passed")));
    });

    group.bench_function("truncate_output_long", |b| {
        let long_output = "error[E0308]: mismatched types\n".repeat(4096);
        b.iter(|| truncate_output(black_box(&long_output)));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Aggregation
// ---------------------------------------------------------------------------

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");
    for size in [1usize, 50, 1_000] {
        let changes = change_set(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &changes, |b, changes| {
            b.iter(|| aggregate(black_box(changes)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Risk evaluation
// ---------------------------------------------------------------------------

fn bench_risk(c: &mut Criterion) {
    let mut group = c.benchmark_group("risk");
    let evaluator = RiskEvaluator::default();
    let metrics = aggregate(&change_set(200));

    group.bench_function("complexity_only", |b| {
        let impact = ImpactSummary::default();
        b.iter(|| evaluator.evaluate(black_box(&metrics), black_box(&impact)));
    });

    group.bench_function("hard_factors", |b| {
        let impact = ImpactSummary::default()
            .with_factor(RiskFactor::SchemaChange)
            .with_factor(RiskFactor::PublicApiChange)
            .with_factor(RiskFactor::SecuritySensitivePath)
            .with_blast_radius(40);
        b.iter(|| evaluator.evaluate(black_box(&metrics), black_box(&impact)));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Level selection
// ---------------------------------------------------------------------------

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    let catalog = OrchestratorConfig::default_catalog().unwrap();
    let evaluator = RiskEvaluator::default();

    for size in [3usize, 200] {
        let metrics = aggregate(&change_set(size));
        let risk = evaluator.evaluate(&metrics, &ImpactSummary::default());
        group.bench_with_input(BenchmarkId::new("threshold", size), &size, |b, _| {
            b.iter(|| select_index(black_box(&risk), black_box(&metrics), black_box(&catalog)));
        });
    }

    let metrics = aggregate(&change_set(3));
    let risk = evaluator.evaluate(&metrics, &ImpactSummary::default());
    let shape = metrics.shape_fingerprint(risk.level);
    let history: Vec<ExecutionRun> = (0..200)
        .map(|i| past_run(&shape, if i % 3 == 0 { "standard" } else { "light" }))
        .collect();
    let selector = LevelSelector::new(HistoryHint::default());
    group.bench_function("history_hint_200_runs", |b| {
        b.iter(|| {
            selector.select_index(
                black_box(&risk),
                black_box(&metrics),
                black_box(&catalog),
                black_box(&history),
            )
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_schema_init,
    bench_guards,
    bench_aggregation,
    bench_risk,
    bench_selection,
);
criterion_main!(benches);
