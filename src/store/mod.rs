//! Task Store: the system of record for projects, roadmaps, sessions and
//! interventions.
//!
//! Every mutation goes through [`TaskStore::transact`], a single atomic
//! read-modify-write over the whole [`Ledger`]. Checked mutations
//! (exclusive session insert, unique intervention insert, resolve) are
//! `Ledger` methods so they compose with other changes in one transaction;
//! [`StoreExt`] adds the single-row reads and updates every store gets for
//! free.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::PathBuf;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::model::{Intervention, Ledger, Project, Session};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("no store at {0:?}; run 'autopilot init' first")]
    Missing(PathBuf),
}

/// Transactional persistence.
///
/// `transact` must either commit every change `apply` made or none of them:
/// when `apply` returns `Err`, nothing is written.
pub trait TaskStore: Send + Sync {
    fn transact(&self, apply: &mut dyn FnMut(&mut Ledger) -> Result<()>) -> Result<()>;

    /// A consistent read-only copy of the current contents
    fn snapshot(&self) -> Result<Ledger>;
}

/// Row-level operations on top of [`TaskStore::transact`].
pub trait StoreExt: TaskStore {
    /// Run `f` as one transaction and hand back its result
    fn update<T>(&self, f: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<T> {
        let mut f = Some(f);
        let mut out = None;
        self.transact(&mut |ledger| {
            let f = f
                .take()
                .ok_or_else(|| Error::InvalidState("transaction applied twice".into()))?;
            out = Some(f(ledger)?);
            Ok(())
        })?;
        out.ok_or_else(|| Error::InvalidState("transaction produced no result".into()))
    }

    fn get_project(&self, id: &str) -> Result<Project> {
        Ok(self.snapshot()?.project_or_err(id)?.clone())
    }

    fn get_session(&self, id: &str) -> Result<Session> {
        Ok(self.snapshot()?.session_or_err(id)?.clone())
    }

    fn update_session(&self, id: &str, f: impl FnOnce(&mut Session)) -> Result<Session> {
        self.update(|ledger| {
            let session = ledger.session_mut_or_err(id)?;
            f(session);
            Ok(session.clone())
        })
    }

    fn find_unresolved_intervention(&self, session_id: &str) -> Result<Option<Intervention>> {
        Ok(self
            .snapshot()?
            .unresolved_for_session(session_id)
            .cloned())
    }

}

impl<S: TaskStore + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PauseType, Record, SessionStatus, SessionType};
    use chrono::Utc;

    fn make_intervention(session: &Session) -> Intervention {
        Intervention {
            id: crate::model::new_id("int"),
            session_id: session.id.clone(),
            project_id: session.project_id.clone(),
            pause_reason: "stuck".into(),
            pause_type: PauseType::RetryLimit,
            paused_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            blocker_info: Default::default(),
            retry_stats: Default::default(),
            current_task_id: None,
            can_auto_resume: true,
        }
    }

    fn store_with_project() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .update(|ledger| {
                ledger.insert(Record::Project(Project::new("p1", "Demo")));
                Ok(())
            })
            .unwrap();
        store
    }

    fn insert_session(store: &MemoryStore, session: &Session) -> Result<()> {
        store.update(|ledger| ledger.insert_session_exclusive(session.clone()))
    }

    #[test]
    fn test_update_returns_value() {
        let store = store_with_project();
        let name = store
            .update(|ledger| Ok(ledger.project_or_err("p1")?.name.clone()))
            .unwrap();
        assert_eq!(name, "Demo");
    }

    #[test]
    fn test_exclusive_insert_rejects_second_session() {
        let store = store_with_project();
        let first = Session::new("p1", 1, SessionType::Coding, "sonnet");
        insert_session(&store, &first).unwrap();

        let second = Session::new("p1", 2, SessionType::Coding, "sonnet");
        let err = insert_session(&store, &second).unwrap_err();
        assert_eq!(err.kind(), "AlreadyRunning");
        assert!(store.snapshot().unwrap().session(&second.id).is_none());

        store
            .update(|ledger| ledger.finish_session(&first.id, SessionStatus::Completed, None))
            .unwrap();
        let third = Session::new("p1", 2, SessionType::Coding, "sonnet");
        assert!(insert_session(&store, &third).is_ok());
    }

    #[test]
    fn test_finish_session_is_noop_when_terminal() {
        let store = store_with_project();
        let session = Session::new("p1", 1, SessionType::Coding, "sonnet");
        insert_session(&store, &session).unwrap();

        let finish = |status, detail: &str| {
            store.update(|ledger| ledger.finish_session(&session.id, status, Some(detail.into())))
        };
        assert!(finish(SessionStatus::Error, "boom").unwrap());
        assert!(!finish(SessionStatus::Interrupted, "late").unwrap());

        let stored = store.get_session(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.interruption_reason.is_none());
    }

    #[test]
    fn test_update_session_and_find_unresolved() {
        let store = store_with_project();
        let session = Session::new("p1", 1, SessionType::Coding, "sonnet");
        insert_session(&store, &session).unwrap();

        let updated = store
            .update_session(&session.id, |s| s.pid = Some(42))
            .unwrap();
        assert_eq!(updated.pid, Some(42));
        assert!(store.find_unresolved_intervention(&session.id).unwrap().is_none());

        let (first, created) = store
            .update(|ledger| Ok(ledger.insert_intervention_unique(make_intervention(&session))))
            .unwrap();
        assert!(created);
        let (second, created) = store
            .update(|ledger| Ok(ledger.insert_intervention_unique(make_intervention(&session))))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(
            store.find_unresolved_intervention(&session.id).unwrap().unwrap().id,
            first.id
        );
    }

    #[test]
    fn test_failed_transaction_leaves_store_unchanged() {
        let store = store_with_project();
        let session = Session::new("p1", 1, SessionType::Coding, "sonnet");
        insert_session(&store, &session).unwrap();
        let (intervention, _) = store
            .update(|ledger| Ok(ledger.insert_intervention_unique(make_intervention(&session))))
            .unwrap();
        store
            .update(|ledger| ledger.resolve_intervention(&intervention.id, "alice", Some("fixed".into())))
            .unwrap();

        let before = store.snapshot().unwrap();
        let err = store
            .update(|ledger| {
                ledger.project_mut_or_err("p1")?.push_log("resolving again");
                ledger.resolve_intervention(&intervention.id, "bob", None)
            })
            .unwrap_err();
        assert_eq!(err.kind(), "AlreadyResolved");
        assert_eq!(store.snapshot().unwrap(), before);
    }
}
