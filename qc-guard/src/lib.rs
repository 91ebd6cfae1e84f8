//! # qc-guard - Rule Compiler and Dual-Target Validation
//!
//! qc-guard compiles data-quality rules written in a small language into two
//! executable forms: an in-memory predicate that checks one record as it is
//! entered, and a parameterized SQL query that finds every violating record in
//! a dataset. Both forms come from the same AST and agree on which records
//! violate a rule.
//!
//! ## Quick Start
//!
//! ```rust
//! use qc_guard::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> qc_guard::error::Result<()> {
//! let schema = FieldSchema::new()
//!     .field("heart_rate", FieldType::Number)
//!     .field("medication", FieldType::Text)
//!     .field("dose", FieldType::Number);
//!
//! let rules = vec![
//!     Rule::for_field("hr-range", "heart_rate", "between 40 and 200"),
//!     Rule::new(
//!         "dose-if-medicated",
//!         r#"if medication == "yes" then dose required endif"#,
//!         RuleScope::CrossField { anchor: "dose".into() },
//!     ),
//! ];
//!
//! // Real time: validate a form submission.
//! let cache = ValidatorCache::load(schema.clone(), QcConfig::default(), &rules);
//! let record = Record::new().with("heart_rate", 39).with("medication", "yes");
//! let failures = cache.validate_record(["heart_rate", "medication", "dose"], &record);
//! assert_eq!(failures.len(), 2);
//!
//! // Batch: find violations across a dataset.
//! let records = vec![record.with("record_id", "r1")];
//! let dataset = SessionDataset::from_records("trial", "data", &schema, &records).await?;
//! let repository = std::sync::Arc::new(InMemoryViolationRepository::new());
//! let engine = QcEngine::new(schema, repository, QcConfig::default());
//! let report = engine.run_batch(&rules, &dataset).await?;
//! assert_eq!(report.created(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## The rule language
//!
//! - Comparisons `< <= > >= == !=`, `between a and b` (closed interval),
//!   `in (...)`, `not_in (...)`.
//! - `and`, `or`, `not`, parentheses, `if c then ... else ... endif` with
//!   comma-separated branch lists.
//! - `required`, `required unless <condition>`.
//! - Functions `today`, `length`, `days_between`, `add_days`, `add_weeks`,
//!   `add_months`, `within`, plus `x within N days of y`.
//! - Number, string, date (`2024-01-31`) and boolean literals.
//!
//! A rule attached to a field may leave out its subject: `between 40 and 200`.
//! Missing values pass every check except `required`.
//!
//! ## Architecture
//!
//! - **`dsl`**: lexer, parser, AST and static typing
//! - **`compile`**: real-time and batch generators, batch templates
//! - **`cache`**: hot-reloadable validator table
//! - **`engine`**: batch runs, dataset locks and run reports
//! - **`sources`**: dataset handles over DataFusion
//! - **`repository`**: violation and run-history storage
//! - **`core`**: records, schemas, rules, violations and configuration

pub mod cache;
pub mod compile;
pub mod core;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod repository;
pub mod security;
pub mod sources;
