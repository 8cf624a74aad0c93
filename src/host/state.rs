//! Run state shared between the main loop and worker threads.

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// The user connected to the delivery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub connected_at: DateTime<Utc>,
}

/// Copy of the shared state taken under the lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub exporting: bool,
    /// Human-readable status line, empty when idle.
    pub status: String,
    /// Outcome of the most recent delivery, reported by the upload worker.
    pub delivery: Option<String>,
    pub user: Option<UserInfo>,
}

#[derive(Debug, Default)]
struct Inner {
    exporting: bool,
    status: String,
    status_generation: u64,
    delivery: Option<String>,
    user: Option<UserInfo>,
    /// Meshes created by earlier runs that reclamation could not delete yet.
    unreclaimed: BTreeSet<String>,
}

/// One coarse lock over everything the UI and workers share.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking writer leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            exporting: inner.exporting,
            status: inner.status.clone(),
            delivery: inner.delivery.clone(),
            user: inner.user.clone(),
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.lock().exporting
    }

    /// Claim the single export slot.
    ///
    /// The slot is released when the returned guard is dropped, on every
    /// exit path of the caller.
    pub fn try_begin_export(self: &Arc<Self>) -> Result<ExportGuard> {
        let mut inner = self.lock();
        if inner.exporting {
            return Err(BridgeError::AlreadyExporting);
        }
        inner.exporting = true;
        Ok(ExportGuard {
            state: Arc::clone(self),
        })
    }

    /// Replace the status line. Returns a token for [`Self::clear_status_if`].
    pub fn set_status(&self, status: impl Into<String>) -> u64 {
        let mut inner = self.lock();
        inner.status = status.into();
        inner.status_generation += 1;
        inner.status_generation
    }

    /// Clear the status line unless it was replaced since `generation`.
    pub fn clear_status_if(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.status_generation != generation {
            return false;
        }
        inner.status.clear();
        true
    }

    pub fn set_delivery(&self, outcome: impl Into<String>) {
        self.lock().delivery = Some(outcome.into());
    }

    pub fn connect_user(&self, name: impl Into<String>, email: impl Into<String>) -> UserInfo {
        let user = UserInfo {
            name: name.into(),
            email: email.into(),
            connected_at: Utc::now(),
        };
        self.lock().user = Some(user.clone());
        user
    }

    pub fn disconnect_user(&self) {
        self.lock().user = None;
    }

    /// Remember run-created meshes that are still in the scene after reclamation.
    pub fn note_unreclaimed(&self, meshes: impl IntoIterator<Item = String>) {
        self.lock().unreclaimed.extend(meshes);
    }

    /// Hand the remembered leftovers to the next reclamation.
    pub fn take_unreclaimed(&self) -> BTreeSet<String> {
        std::mem::take(&mut self.lock().unreclaimed)
    }
}

/// Holds the export slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ExportGuard {
    state: Arc<SharedState>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        self.state.lock().exporting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_export_slot() {
        let state = SharedState::new();
        let guard = state.try_begin_export().unwrap();
        assert!(state.is_exporting());
        assert!(matches!(state.try_begin_export(), Err(BridgeError::AlreadyExporting)));
        drop(guard);
        assert!(!state.is_exporting());
        assert!(state.try_begin_export().is_ok());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let state = SharedState::new();
        let cloned = Arc::clone(&state);
        let result = std::thread::spawn(move || {
            let _guard = cloned.try_begin_export().unwrap();
            panic!("stage failed");
        })
        .join();
        assert!(result.is_err());
        assert!(!state.is_exporting());
    }

    #[test]
    fn test_clear_status_if_unchanged() {
        let state = SharedState::new();
        let first = state.set_status("Exporting...");
        let second = state.set_status("Export complete");
        assert!(!state.clear_status_if(first));
        assert_eq!(state.snapshot().status, "Export complete");
        assert!(state.clear_status_if(second));
        assert!(state.snapshot().status.is_empty());
    }

    #[test]
    fn test_connect_user() {
        let state = SharedState::new();
        state.connect_user("Ada", "ada@example.com");
        assert_eq!(state.snapshot().user.unwrap().name, "Ada");
        state.disconnect_user();
        assert!(state.snapshot().user.is_none());
    }

    #[test]
    fn test_take_unreclaimed_drains() {
        let state = SharedState::new();
        state.note_unreclaimed(["SHADOW_Rock".to_string()]);
        state.note_unreclaimed(["SHADOW_Rock".to_string(), "SHADOW_Tree".to_string()]);
        assert_eq!(state.take_unreclaimed().len(), 2);
        assert!(state.take_unreclaimed().is_empty());
    }
}
