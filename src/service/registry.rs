//! Process Registry
//!
//! In-memory record of which sessions have a live agent process owned by
//! this orchestrator. Populated on launch, cleared on terminal status or
//! sweep. The Reconciliation Sweeper consults it to tell a truly orphaned
//! session from one that is alive but quiet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Entry for a single live session process
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub session_id: String,
    pub project_id: String,
    cancel: CancellationToken,
}

/// Shared handle; clones see the same entries
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessEntry>> {
        // A panic while holding the lock can't leave a half-written map
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a freshly launched process
    pub fn register(&self, session_id: &str, project_id: &str, cancel: CancellationToken) {
        self.lock().insert(
            session_id.to_string(),
            ProcessEntry {
                session_id: session_id.to_string(),
                project_id: project_id.to_string(),
                cancel,
            },
        );
    }

    pub fn unregister(&self, session_id: &str) -> Option<ProcessEntry> {
        self.lock().remove(session_id)
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Signal the session's process to stop. Returns false if unknown.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The live session of a project, if this orchestrator owns one
    pub fn session_for_project(&self, project_id: &str) -> Option<String> {
        self.lock()
            .values()
            .find(|e| e.project_id == project_id)
            .map(|e| e.session_id.clone())
    }

    pub fn live_sessions(&self) -> Vec<ProcessEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
