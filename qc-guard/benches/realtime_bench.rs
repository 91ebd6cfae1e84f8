//! Benchmarks for rule compilation and real-time validation latency.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use qc_guard::cache::ValidatorCache;
use qc_guard::compile::{compile_batch, compile_realtime};
use qc_guard::core::{FieldSchema, FieldType, QcConfig, Record, Rule};
use qc_guard::dsl::parse_rule;
use std::hint::black_box;
use std::time::Duration;

const RULES: &[(&str, &str)] = &[
    ("simple_range", "heart_rate between 40 and 200"),
    (
        "conditional",
        r#"if medication == "yes" then dose required, dose between 1 and 50 else dose not_in (0) endif"#,
    ),
    (
        "dates",
        "visit_date within 30 days of baseline_date and days_between(baseline_date, visit_date) >= 0",
    ),
];

fn schema() -> FieldSchema {
    FieldSchema::new()
        .field("heart_rate", FieldType::Number)
        .field("medication", FieldType::Text)
        .field("dose", FieldType::Number)
        .field("visit_date", FieldType::Date)
        .field("baseline_date", FieldType::Date)
}

fn record() -> Record {
    Record::new()
        .with("heart_rate", "72")
        .with("medication", "yes")
        .with("dose", 12.5)
        .with("visit_date", "2024-02-10")
        .with("baseline_date", "2024-01-15")
}

fn bench_compile(c: &mut Criterion) {
    let schema = schema();
    let mut group = c.benchmark_group("compile");

    for (name, source) in RULES {
        group.bench_with_input(BenchmarkId::new("realtime", name), source, |b, source| {
            b.iter(|| {
                let expr = parse_rule(black_box(source), &schema, None).unwrap();
                compile_realtime(&expr, &schema).unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("batch", name), source, |b, source| {
            b.iter(|| {
                let expr = parse_rule(black_box(source), &schema, None).unwrap();
                compile_batch(&expr, &schema).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let schema = schema();
    let record = record();
    let mut group = c.benchmark_group("evaluate");
    group.measurement_time(Duration::from_secs(5));

    for (name, source) in RULES {
        let expr = parse_rule(source, &schema, None).unwrap();
        let validator = compile_realtime(&expr, &schema).unwrap();
        group.bench_function(*name, |b| b.iter(|| validator.evaluate(black_box(&record))));
    }

    group.finish();
}

fn bench_validate_record(c: &mut Criterion) {
    let rules: Vec<Rule> = RULES
        .iter()
        .map(|(name, source)| Rule::for_field(*name, "dose", *source))
        .collect();
    let cache = ValidatorCache::load(schema(), QcConfig::default(), &rules);
    let record = record();

    c.bench_function("validate_record", |b| {
        b.iter(|| cache.validate_record(black_box(["heart_rate", "medication", "dose"]), &record))
    });
}

criterion_group!(benches, bench_compile, bench_evaluate, bench_validate_record);
criterion_main!(benches);
