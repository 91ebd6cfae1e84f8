//! Engine configuration.

use crate::logging::LogConfig;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default upper bound on rule text length, in characters.
pub const DEFAULT_MAX_RULE_LENGTH: usize = 4096;

/// Configuration shared by the compiler, the validator cache and the QC engine.
///
/// # Examples
///
/// ```rust
/// use qc_guard::core::QcConfig;
///
/// let config = QcConfig::default().with_max_workers(2);
/// assert_eq!(config.workers(), 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Maximum number of batch rules executed concurrently within one run
    pub max_workers: usize,
    /// Pins `today` for reproducible runs; UTC today when unset
    pub reference_date: Option<NaiveDate>,
    /// Rule text longer than this is rejected by the lexer
    pub max_rule_length: usize,
    #[serde(skip)]
    pub log: LogConfig,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
            reference_date: None,
            max_rule_length: DEFAULT_MAX_RULE_LENGTH,
            log: LogConfig::default(),
        }
    }
}

impl QcConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    pub fn with_max_rule_length(mut self, max_rule_length: usize) -> Self {
        self.max_rule_length = max_rule_length;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// The date `today` resolves to.
    pub fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Effective worker bound, never zero even if deserialized as such.
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }
}
