//! Field schema supplied by the host application.
//!
//! The schema serves two purposes: the parser resolves identifiers against it
//! (unknown names are semantic errors, never literals) and the batch generator
//! uses it as the whitelist of column names that may appear in generated SQL.

use super::record::{Value, DATE_FORMAT};
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Text,
    Date,
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Number => "number",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

impl FieldType {
    /// Coerces a record value to this type.
    ///
    /// Form entry frequently delivers text for typed fields, so text is parsed
    /// into numbers, dates and booleans. Any other mismatch is reported as a
    /// diagnostic string.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::Number, Value::Number(n)) if !n.is_finite() => {
                Err(format!("{n} is not a finite number"))
            }
            (FieldType::Number, Value::Number(_))
            | (FieldType::Text, Value::Text(_))
            | (FieldType::Date, Value::Date(_))
            | (FieldType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (FieldType::Number, Value::Text(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number")),
            (FieldType::Date, Value::Text(s)) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map(Value::Date)
                .map_err(|_| format!("'{s}' is not a date (expected YYYY-MM-DD)")),
            (FieldType::Boolean, Value::Text(s)) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },
            (expected, found) => Err(format!(
                "expected a {expected} value, found {}",
                found.type_name()
            )),
        }
    }
}

/// Names and types of the fields a rule may refer to, plus the key columns
/// used to identify records in batch datasets.
///
/// # Examples
///
/// ```rust
/// use qc_guard::core::{FieldSchema, FieldType};
///
/// let schema = FieldSchema::new()
///     .field("heart_rate", FieldType::Number)
///     .field("visit_date", FieldType::Date);
///
/// assert_eq!(schema.field_type("heart_rate"), Some(FieldType::Number));
/// assert!(schema.field_type("weight").is_none());
/// assert_eq!(schema.record_key(), "record_id");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    fields: IndexMap<String, FieldType>,
    record_key: String,
    subject_key: String,
    visit_key: String,
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self {
            fields: IndexMap::new(),
            record_key: "record_id".to_string(),
            subject_key: "subject_id".to_string(),
            visit_key: "visit".to_string(),
        }
    }
}

impl FieldSchema {
    /// Creates an empty schema with the default key column names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    /// Overrides the column holding the unique record identifier.
    pub fn with_record_key(mut self, column: impl Into<String>) -> Self {
        self.record_key = column.into();
        self
    }

    /// Overrides the column holding the subject identifier.
    pub fn with_subject_key(mut self, column: impl Into<String>) -> Self {
        self.subject_key = column.into();
        self
    }

    /// Overrides the column holding the visit label.
    pub fn with_visit_key(mut self, column: impl Into<String>) -> Self {
        self.visit_key = column.into();
        self
    }

    /// Returns the declared type of a field.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    /// Returns true when the name is a declared field.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterates over fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    pub fn subject_key(&self) -> &str {
        &self.subject_key
    }

    pub fn visit_key(&self) -> &str {
        &self.visit_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_text_input() {
        assert_eq!(
            FieldType::Number.coerce(&Value::Text(" 72 ".into())),
            Ok(Value::Number(72.0))
        );
        assert_eq!(
            FieldType::Date.coerce(&Value::Text("2024-02-29".into())),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
        );
        assert_eq!(
            FieldType::Boolean.coerce(&Value::Text("true".into())),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn test_coerce_rejects_mismatch() {
        assert!(FieldType::Number.coerce(&Value::Text("abc".into())).is_err());
        assert!(FieldType::Number.coerce(&Value::Text("NaN".into())).is_err());
        assert!(FieldType::Number.coerce(&Value::Number(f64::NAN)).is_err());
        assert!(FieldType::Number
            .coerce(&Value::Number(f64::NEG_INFINITY))
            .is_err());
        assert!(FieldType::Date.coerce(&Value::Text("31/01/2024".into())).is_err());
        assert!(FieldType::Text.coerce(&Value::Number(1.0)).is_err());
        assert_eq!(FieldType::Text.coerce(&Value::Null), Ok(Value::Null));
    }

    #[test]
    fn test_schema_keys() {
        let schema = FieldSchema::new()
            .field("hr", FieldType::Number)
            .with_record_key("row_id")
            .with_subject_key("usubjid")
            .with_visit_key("visitnum");
        assert_eq!(schema.record_key(), "row_id");
        assert_eq!(schema.subject_key(), "usubjid");
        assert_eq!(schema.visit_key(), "visitnum");
        assert_eq!(schema.fields().count(), 1);
    }
}
