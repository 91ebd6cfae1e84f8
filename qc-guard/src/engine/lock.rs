//! Advisory per-dataset run locks.

use crate::error::{QcError, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

static SHARED: Lazy<Arc<DatasetLocks>> = Lazy::new(|| Arc::new(DatasetLocks::default()));

/// Set of datasets with a batch run in flight.
///
/// Engines created with [`QcEngine::new`](super::QcEngine::new) share one
/// process-wide instance, so two engines cannot run against the same dataset
/// at once.
#[derive(Debug, Default)]
pub struct DatasetLocks {
    held: Mutex<HashSet<String>>,
}

impl DatasetLocks {
    /// The process-wide lock set.
    pub fn shared() -> Arc<Self> {
        SHARED.clone()
    }

    /// Takes the lock for `dataset`, failing with `RunInProgress` if held.
    pub fn try_acquire(self: &Arc<Self>, dataset: &str) -> Result<DatasetGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(dataset.to_string()) {
            return Err(QcError::RunInProgress {
                dataset: dataset.to_string(),
            });
        }
        debug!(dataset.name = dataset, "Dataset lock acquired");
        Ok(DatasetGuard {
            locks: Arc::clone(self),
            dataset: dataset.to_string(),
        })
    }

    pub fn is_locked(&self, dataset: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(dataset)
    }
}

/// Releases its dataset lock when dropped.
#[derive(Debug)]
pub struct DatasetGuard {
    locks: Arc<DatasetLocks>,
    dataset: String,
}

impl Drop for DatasetGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.dataset);
        debug!(dataset.name = %self.dataset, "Dataset lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_per_dataset() {
        let locks = Arc::new(DatasetLocks::default());
        let guard = locks.try_acquire("a").unwrap();
        assert!(matches!(
            locks.try_acquire("a"),
            Err(QcError::RunInProgress { .. })
        ));
        let other = locks.try_acquire("b").unwrap();
        assert!(locks.is_locked("a"));

        drop(guard);
        assert!(!locks.is_locked("a"));
        assert!(locks.try_acquire("a").is_ok());
        drop(other);
    }
}
