//! Cancellation handles of running collection tasks.
//!
//! An entry exists exactly while its task is `running`: the runner registers
//! on start and removes on any terminal transition, and `cancel` removes it
//! too. Whoever removes the entry owns the terminal status write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task not found or already finished: {0}")]
pub struct NotActive(pub String);

#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        // A panicking holder cannot leave the map half-updated.
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a fresh token for `task_id`, replacing (and cancelling) a stale one.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(old) = self.lock().insert(task_id.to_string(), token.clone()) {
            old.cancel();
        }
        token
    }

    /// Remove the entry on normal completion. `true` if this call removed it,
    /// i.e. the task was not cancelled in the meantime.
    pub fn finish(&self, task_id: &str) -> bool {
        self.lock().remove(task_id).is_some()
    }

    /// Remove the entry and signal cancellation.
    pub fn cancel(&self, task_id: &str) -> Result<(), NotActive> {
        match self.lock().remove(task_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(NotActive(task_id.to_string())),
        }
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_removes_entry_and_signals() {
        let reg = CancelRegistry::new();
        let token = reg.register("task_1");
        assert!(reg.is_active("task_1"));

        assert_eq!(reg.cancel("task_1"), Ok(()));
        assert!(token.is_cancelled());
        assert!(!reg.is_active("task_1"));
        assert_eq!(reg.cancel("task_1"), Err(NotActive("task_1".into())));
    }

    #[test]
    fn test_finish_after_cancel_reports_lost_ownership() {
        let reg = CancelRegistry::new();
        reg.register("a");
        reg.register("b");
        assert!(reg.finish("a"));
        assert!(!reg.finish("a"));
        reg.cancel("b").unwrap();
        assert!(!reg.finish("b"));
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn test_unknown_task_is_not_active() {
        let reg = CancelRegistry::new();
        let err = reg.cancel("missing").unwrap_err();
        assert_eq!(err.to_string(), "task not found or already finished: missing");
    }
}
