//! Per-project transition locks.
//!
//! One mutex per project name, created on first use and kept for the life of
//! the process. Contention is never queued: a second transition for the same
//! name fails immediately with `OperationInProgress`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use omni_common::AgentError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ProjectLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one transition.
pub struct ProjectLock {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        debug!(project = %self.name, "project lock released");
    }
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `name` or fail without waiting.
    pub fn try_acquire(&self, name: &str) -> Result<ProjectLock, AgentError> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex
            .try_lock_owned()
            .map_err(|_| AgentError::OperationInProgress(name.to_string()))?;
        debug!(project = %name, "project lock acquired");
        Ok(ProjectLock {
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Names with a transition running right now, sorted.
    pub fn busy(&self) -> Vec<String> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = table
            .iter()
            .filter(|(_, mutex)| mutex.try_lock().is_err())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of distinct names ever locked.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
