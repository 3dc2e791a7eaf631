//! Assignment hot path: full matrix vs. a filtered request.
//!
//! Run with:
//!   cargo bench -p bucketing

use std::hint::black_box;

use bucketing::testing::{TestDefinitionBuilder, matrix};
use bucketing::{
    Engine, EngineConfig, ForceGroupsOptions, FunctionRegistry, Identifiers, LoadResult,
    NoopValidator, RuleContext, TestDefinition, TestType,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn make_test(index: usize) -> TestDefinition {
    let builder = TestDefinitionBuilder::user()
        .buckets(&[(-1, "inactive"), (0, "control"), (1, "active")])
        .allocation(Some("${country == 'US' && fn:contains(LANGS, lang)}"), &[(-1, 0.2), (0, 0.4), (1, 0.4)])
        .allocation(None, &[(-1, 1.0)])
        .constant("LANGS", vec!["en", "es", "fr"]);
    // every tenth test reads the previous one's bucket
    if index % 10 == 9 {
        builder.depends_on(&format!("test{}", index - 1)).build()
    } else {
        builder.build()
    }
}

fn make_engine(size: usize) -> Engine {
    let names: Vec<String> = (0..size).map(|i| format!("test{i}")).collect();
    let tests = matrix(names.iter().enumerate().map(|(i, name)| (name.as_str(), make_test(i))));
    Engine::construct_with(
        tests,
        LoadResult::empty(),
        &EngineConfig::default(),
        &FunctionRegistry::default(),
        NoopValidator,
    )
    .expect("benchmark matrix is valid")
}

fn bench_determine_assignments(c: &mut Criterion) {
    let ids = Identifiers::single(TestType::User, "user-42");
    let ctx = RuleContext::new().with("country", "US").with("lang", "en");
    let force = ForceGroupsOptions::new();

    let mut group = c.benchmark_group("determine_assignments");
    for size in [10, 100, 1000] {
        let engine = make_engine(size);
        group.bench_with_input(BenchmarkId::new("all", size), &engine, |b, engine| {
            b.iter(|| engine.determine_assignments(black_box(&ids), &ctx, &force, &[]))
        });
        group.bench_with_input(BenchmarkId::new("filtered", size), &engine, |b, engine| {
            b.iter(|| engine.determine_assignments(black_box(&ids), &ctx, &force, &["test9"]))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_determine_assignments);
criterion_main!(benches);
