//! Hot reload under concurrent validation.

use qc_guard::cache::{RefreshOutcome, ValidatorCache};
use qc_guard::core::{FieldSchema, FieldType, QcConfig, Record, Rule, RuleId};
use std::sync::atomic::{AtomicBool, Ordering};

fn schema() -> FieldSchema {
    FieldSchema::new()
        .field("heart_rate", FieldType::Number)
        .field("dose", FieldType::Number)
}

// Two generations whose rules flip together: a record passes every rule of
// one and fails every rule of the other, so a mixed view fails exactly one.
fn generation(strict: bool, version: u32) -> Vec<Rule> {
    let (hr, dose) = if strict {
        (">= 100", ">= 10")
    } else {
        ("< 100", "< 10")
    };
    vec![
        Rule::for_field("hr", "heart_rate", hr).with_version(version),
        Rule::for_field("dose", "dose", dose).with_version(version),
    ]
}

#[test]
fn test_readers_never_observe_a_mixed_rule_set() {
    let cache = ValidatorCache::load(schema(), QcConfig::default(), &generation(false, 1));
    let record = Record::new().with("heart_rate", 50).with("dose", 5);
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut last_version = 0;
                while !done.load(Ordering::Acquire) {
                    let version = cache.snapshot().version();
                    assert!(version >= last_version, "snapshot version went backwards");
                    last_version = version;

                    let failures = cache.validate_record(["heart_rate", "dose"], &record);
                    assert!(
                        failures.is_empty() || failures.len() == 2,
                        "mixed rule set observed: {failures:?}"
                    );
                }
            });
        }

        for round in 0..200u32 {
            let report = cache.refresh(&generation(round % 2 == 0, round + 2));
            assert!(report.is_clean());
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(cache.snapshot().version(), 201);
}

#[test]
fn test_broken_edit_keeps_last_good_validator() {
    let cache = ValidatorCache::load(schema(), QcConfig::default(), &generation(false, 1));
    let broken = vec![
        Rule::for_field("hr", "heart_rate", "between 40 and").with_version(2),
        Rule::for_field("dose", "dose", "< 10").with_version(2),
    ];

    let report = cache.refresh(&broken);
    assert!(!report.is_clean());
    assert!(matches!(
        report.outcomes.get(&RuleId::new("hr")),
        Some(RefreshOutcome::Retained { version: 1, .. })
    ));

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.rule(&RuleId::new("hr")).map(|r| r.version), Some(1));
    assert_eq!(snapshot.rule(&RuleId::new("dose")).map(|r| r.version), Some(2));

    let failures = cache.validate_record(["heart_rate"], &Record::new().with("heart_rate", 150));
    assert!(failures.contains_key("heart_rate"));
}

#[test]
fn test_global_cache_is_shared() {
    let rules = vec![Rule::for_field("global-hr", "heart_rate", "<= 220")];
    let report = qc_guard::cache::global().refresh_with_schema(schema(), &rules);
    assert!(report.is_clean());

    let failures = qc_guard::cache::global()
        .validate_record(["heart_rate"], &Record::new().with("heart_rate", 300));
    assert_eq!(failures.len(), 1);
}
