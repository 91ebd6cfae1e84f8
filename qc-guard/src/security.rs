//! Security utilities for generated SQL.
//!
//! Generated batch queries never contain rule text. Field names reach SQL only
//! after passing the schema whitelist and [`SqlSecurity::escape_identifier`];
//! literals are always bound parameters.

use crate::error::{QcError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// SQL identifier validation and escaping utilities.
pub struct SqlSecurity;

impl SqlSecurity {
    /// Validates and escapes a SQL identifier (table or column name).
    ///
    /// # Security
    /// This function prevents SQL injection by:
    /// - Validating identifier format against allowed patterns
    /// - Rejecting identifiers that are SQL statement keywords
    /// - Quoting identifiers with double quotes
    /// - Limiting identifier length
    ///
    /// # Examples
    /// ```rust
    /// use qc_guard::security::SqlSecurity;
    ///
    /// assert_eq!(SqlSecurity::escape_identifier("heart_rate").unwrap(), "\"heart_rate\"");
    /// assert!(SqlSecurity::escape_identifier("id; DROP TABLE users--").is_err());
    /// assert!(SqlSecurity::escape_identifier(&"very_long_name_".repeat(100)).is_err());
    /// ```
    pub fn escape_identifier(identifier: &str) -> Result<String> {
        Self::validate_identifier(identifier)?;
        Ok(format!("\"{identifier}\""))
    }

    /// Validates a SQL identifier without escaping it.
    pub fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.trim().is_empty() {
            return Err(QcError::SecurityError(
                "SQL identifier cannot be empty or whitespace-only".to_string(),
            ));
        }

        if identifier.len() > 128 {
            return Err(QcError::SecurityError(
                "SQL identifier too long (max 128 characters)".to_string(),
            ));
        }

        static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
            // This regex is compile-time constant and known to be valid
            #[allow(clippy::expect_used)]
            Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("Hard-coded regex pattern should be valid")
        });

        if !IDENTIFIER_REGEX.is_match(identifier) {
            return Err(QcError::SecurityError(format!(
                "Invalid SQL identifier format: '{identifier}'. Identifiers must start with a letter or underscore and contain only letters, numbers and underscores"
            )));
        }

        Self::check_reserved(identifier)
    }

    /// Rejects identifiers that spell a statement keyword.
    fn check_reserved(identifier: &str) -> Result<()> {
        const RESERVED: &[&str] = &[
            "select", "insert", "update", "delete", "drop", "create", "alter", "truncate",
            "union", "exec", "execute", "declare", "grant", "revoke",
        ];
        let lower = identifier.to_ascii_lowercase();
        if RESERVED.contains(&lower.as_str()) {
            return Err(QcError::SecurityError(format!(
                "SQL identifier is a reserved keyword: '{identifier}'"
            )));
        }
        Ok(())
    }
}

/// Input validation for numeric template parameters.
pub struct InputValidator;

impl InputValidator {
    /// Validates a numeric threshold value.
    pub fn validate_threshold(value: f64, name: &str) -> Result<()> {
        if !value.is_finite() {
            return Err(QcError::SecurityError(format!(
                "Invalid {name} value: must be finite (not NaN or infinite)"
            )));
        }
        Ok(())
    }

    /// Validates a finite, non-negative value such as a tolerance.
    pub fn validate_non_negative(value: f64, name: &str) -> Result<()> {
        Self::validate_threshold(value, name)?;
        if value < 0.0 {
            return Err(QcError::SecurityError(format!(
                "Invalid {name} value: must not be negative, got {value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sql_identifiers() {
        assert!(SqlSecurity::validate_identifier("heart_rate").is_ok());
        assert!(SqlSecurity::validate_identifier("visit2").is_ok());
        assert!(SqlSecurity::validate_identifier("_row").is_ok());
        assert!(SqlSecurity::validate_identifier("update_date").is_ok());
    }

    #[test]
    fn test_invalid_sql_identifiers() {
        assert!(SqlSecurity::validate_identifier("").is_err());
        assert!(SqlSecurity::validate_identifier(&"a".repeat(200)).is_err());
        assert!(SqlSecurity::validate_identifier("id; DROP TABLE").is_err());
        assert!(SqlSecurity::validate_identifier("col--comment").is_err());
        assert!(SqlSecurity::validate_identifier("col name").is_err());
        assert!(SqlSecurity::validate_identifier("123col").is_err());
        assert!(SqlSecurity::validate_identifier("schema.table").is_err());
        assert!(SqlSecurity::validate_identifier("DROP").is_err());
        assert!(SqlSecurity::validate_identifier("col\"x").is_err());
    }

    #[test]
    fn test_input_validation() {
        assert!(InputValidator::validate_threshold(5.5, "k").is_ok());
        assert!(InputValidator::validate_threshold(f64::NAN, "k").is_err());
        assert!(InputValidator::validate_non_negative(0.0, "tolerance").is_ok());
        assert!(InputValidator::validate_non_negative(-1.0, "tolerance").is_err());
        assert!(InputValidator::validate_non_negative(f64::INFINITY, "tolerance").is_err());
    }
}
