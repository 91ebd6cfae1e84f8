//! Rule text and identifiers must never reach generated SQL unescaped.

use qc_guard::compile::{compile_batch, compile_batch_rule, RECORD_ID_COLUMN};
use qc_guard::core::{FieldSchema, FieldType, Record, Rule};
use qc_guard::dsl::parse_rule;
use qc_guard::error::CompileError;
use qc_guard::logging::LogConfig;
use qc_guard::sources::{Dataset, SessionDataset};
use chrono::NaiveDate;

const PAYLOADS: &[&str] = &[
    "x'); DROP TABLE data; --",
    "' OR '1'='1",
    "yes' UNION SELECT * FROM data --",
    "\\'; DELETE FROM data; --",
];

fn schema() -> FieldSchema {
    FieldSchema::new()
        .field("medication", FieldType::Text)
        .field("dose", FieldType::Number)
}

#[test]
fn test_string_literals_are_bound_not_inlined() {
    for payload in PAYLOADS {
        let escaped = payload.replace('\\', "\\\\").replace('"', "\\\"");
        let source = format!("medication != \"{escaped}\"");
        let expr = parse_rule(&source, &schema(), None).unwrap();
        let fragment = compile_batch(&expr, &schema()).unwrap();
        let sql = fragment.render("data").unwrap();

        assert!(!sql.contains("DROP"), "{sql}");
        assert!(!sql.contains("DELETE"), "{sql}");
        assert!(!sql.contains("'1'='1"), "{sql}");
        assert!(sql.contains("$1"), "{sql}");
    }
}

#[tokio::test]
async fn test_payload_is_compared_as_plain_text() {
    let payload = PAYLOADS[0];
    let records = vec![
        Record::new().with("record_id", "hit").with("medication", payload),
        Record::new().with("record_id", "miss").with("medication", "yes"),
    ];
    let dataset = SessionDataset::from_records("injection", "data", &schema(), &records)
        .await
        .unwrap();

    let source = format!("medication != \"{payload}\"");
    let expr = parse_rule(&source, &schema(), None).unwrap();
    let fragment = compile_batch(&expr, &schema()).unwrap();
    let sql = fragment.render(dataset.table_name()).unwrap();
    let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let batches = dataset.query(&sql, fragment.bind(today)).await.unwrap();

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(rows, 1);
    assert!(batches[0].column_by_name(RECORD_ID_COLUMN).is_some());
    assert_eq!(dataset.row_count().await.unwrap(), 2);
}

#[test]
fn test_unknown_identifier_never_reaches_sql() {
    let err = parse_rule("dose > 0 or drop_table > 1", &schema(), None).unwrap_err();
    assert!(matches!(err, CompileError::Semantic(_)));
}

#[test]
fn test_reserved_column_name_is_rejected_by_batch_generator() {
    let schema = schema().field("select", FieldType::Number);
    let expr = parse_rule("select > 0", &schema, None).unwrap();
    let err = compile_batch(&expr, &schema).unwrap_err();
    assert!(matches!(err, CompileError::UnknownColumn { .. }));
}

#[test]
fn test_hostile_table_names_are_rejected() {
    let rule = Rule::for_field("dose", "dose", "> 0");
    let fragment = compile_batch_rule(&rule, &schema(), 4096, &LogConfig::default()).unwrap();
    for table in ["data; DROP TABLE data", "data\"--", "", "drop"] {
        assert!(fragment.render(table).is_err(), "{table}");
    }
}

#[test]
fn test_template_numeric_parameters_are_bound() {
    let schema = schema()
        .with_subject_key("subject_id")
        .with_visit_key("visit");
    let fragment =
        compile_batch_rule(&Rule::cross_visit("cv", "dose", 2.5), &schema, 4096, &LogConfig::default())
            .unwrap();
    let sql = fragment.render("data").unwrap();
    assert!(!sql.contains("2.5"), "{sql}");

    let rejected = compile_batch_rule(
        &Rule::cross_visit("cv", "dose", f64::NAN),
        &schema,
        4096,
        &LogConfig::default(),
    );
    assert!(rejected.is_err());
}
