//! Reconciliation Sweeper
//!
//! Finds sessions the store says are pending/running but that nobody is
//! driving: no entry in this orchestrator's process registry and no
//! heartbeat within the grace period. Those are marked `interrupted`.
//! An orphan is an infrastructure anomaly, not a blocker, so no
//! Intervention is ever raised here.
//!
//! A project left in `CODING` or `INITIALIZING` with no active session
//! and no session activity within the grace period has lost the loop that
//! owned it; its phase is returned to `READY` (or `UNINITIALIZED`).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Ledger, ProjectPhase, Session, SessionStatus, SessionType};
use crate::roadmap;
use crate::service::{ProcessRegistry, is_process_alive, is_same_process, terminate_pid};
use crate::store::{StoreExt, TaskStore};

pub const ORPHAN_REASON: &str = "orphaned: no active process found";

const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    /// Sessions moved to `interrupted`
    pub interrupted: Vec<String>,
    /// Projects whose phase was corrected
    pub projects_reset: Vec<String>,
    /// Roadmap rows removed for orphaned initializers
    pub rows_rolled_back: usize,
    /// Registry entries dropped because their session was already over
    pub stale_registry_entries: Vec<String>,
    /// Leftover agent processes that were terminated
    pub processes_terminated: Vec<u32>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty()
            && self.projects_reset.is_empty()
            && self.stale_registry_entries.is_empty()
            && self.processes_terminated.is_empty()
    }
}

#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn TaskStore>,
    registry: ProcessRegistry,
    grace: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn TaskStore>, registry: ProcessRegistry, grace: Duration) -> Self {
        Self {
            store,
            registry,
            grace,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // Registry entries whose session already reached a terminal state
        let snapshot = self.store.snapshot()?;
        for entry in self.registry.live_sessions() {
            let over = snapshot
                .session(&entry.session_id)
                .is_none_or(|s| s.status.is_terminal());
            if over {
                self.registry.unregister(&entry.session_id);
                debug!(session = %entry.session_id, "dropped registry entry for finished session");
                report.stale_registry_entries.push(entry.session_id);
            }
        }

        let grace = chrono::Duration::from_std(self.grace)
            .map_err(|e| Error::Config(format!("sweeper grace period out of range: {}", e)))?;
        let cutoff = Utc::now() - grace;
        let registry = self.registry.clone();

        let (orphans, rolled_back, reset) = self.store.update(|ledger| {
            let candidates: Vec<Session> = ledger
                .stale_active_sessions(cutoff)
                .into_iter()
                .filter(|s| !registry.is_live(&s.id))
                .cloned()
                .collect();

            let mut rolled_back = 0;
            let mut reset = Vec::new();
            for session in &candidates {
                ledger.finish_session(
                    &session.id,
                    SessionStatus::Interrupted,
                    Some(ORPHAN_REASON.to_string()),
                )?;

                let removed = if session.session_type == SessionType::Initializer {
                    roadmap::rollback_session(ledger, &session.id)
                } else {
                    0
                };
                rolled_back += removed;

                if let Some(current) = ledger.project(&session.project_id).map(|p| p.phase) {
                    let next = match (session.session_type, current) {
                        (SessionType::Initializer, ProjectPhase::Initializing) => {
                            Some(ProjectPhase::Uninitialized)
                        }
                        (SessionType::Coding, ProjectPhase::Coding) => Some(ProjectPhase::Ready),
                        _ => None,
                    };
                    let project = ledger.project_mut_or_err(&session.project_id)?;
                    if let Some(phase) = next {
                        project.phase = phase;
                        reset.push(session.project_id.clone());
                    }
                    project.push_log(format!(
                        "session {} interrupted by sweep ({})",
                        session.id, ORPHAN_REASON
                    ));
                    if removed > 0 {
                        project.push_log(format!("rolled back {} roadmap rows", removed));
                    }
                }
            }

            let (released, removed) = release_abandoned_phases(ledger, &registry, cutoff)?;
            rolled_back += removed;
            reset.extend(released);
            Ok((candidates, rolled_back, reset))
        })?;

        report.rows_rolled_back = rolled_back;
        report.projects_reset = reset;

        for session in orphans {
            warn!(
                project = %session.project_id,
                session = %session.id,
                "orphaned session marked interrupted"
            );
            report.interrupted.push(session.id);

            let Some(pid) = session.pid else { continue };
            if is_same_process(pid, session.pid_start_time) {
                match terminate_pid(pid, KILL_GRACE).await {
                    Ok(_) => report.processes_terminated.push(pid),
                    Err(e) => warn!(pid, error = %e, "failed to terminate orphaned agent process"),
                }
            } else if is_process_alive(pid) {
                debug!(pid, "recorded pid now belongs to another process, not signalling");
            }
        }

        if !report.is_empty() {
            info!(
                interrupted = report.interrupted.len(),
                projects_reset = report.projects_reset.len(),
                stale_entries = report.stale_registry_entries.len(),
                terminated = report.processes_terminated.len(),
                "sweep complete"
            );
        }
        Ok(report)
    }
}

/// Projects still holding `CODING`/`INITIALIZING` with nobody driving them.
/// Returns the released project ids and the roadmap rows rolled back.
fn release_abandoned_phases(
    ledger: &mut Ledger,
    registry: &ProcessRegistry,
    cutoff: DateTime<Utc>,
) -> Result<(Vec<String>, usize)> {
    let view: &Ledger = ledger;
    let held: Vec<String> = view
        .projects()
        .filter(|p| matches!(p.phase, ProjectPhase::Coding | ProjectPhase::Initializing))
        .filter(|p| view.active_session(&p.id).is_none())
        .filter(|p| registry.session_for_project(&p.id).is_none())
        .filter(|p| {
            view.latest_session(&p.id)
                .is_none_or(|s| s.ended_at.unwrap_or_else(|| s.last_activity()) < cutoff)
        })
        .map(|p| p.id.clone())
        .collect();

    let mut removed = 0;
    for project_id in &held {
        let phase = ledger.project_or_err(project_id)?.phase;
        let next = if phase == ProjectPhase::Initializing {
            let initializer = ledger
                .sessions_for(project_id)
                .into_iter()
                .rev()
                .find(|s| s.session_type == SessionType::Initializer)
                .map(|s| (s.id.clone(), s.status));
            match initializer {
                Some((_, SessionStatus::Completed)) if ledger.is_initialized(project_id) => {
                    ProjectPhase::Ready
                }
                Some((id, _)) => {
                    removed += roadmap::rollback_session(ledger, &id);
                    ProjectPhase::Uninitialized
                }
                None => ProjectPhase::Uninitialized,
            }
        } else {
            ProjectPhase::Ready
        };

        let project = ledger.project_mut_or_err(project_id)?;
        project.phase = next;
        project.stop_requested = None;
        project.push_log(format!("sweep released {} phase with no driving session", phase));
        warn!(project = %project_id, from = %phase, to = %next, "released abandoned project phase");
    }
    Ok((held, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, Record};
    use crate::service::process_start_time;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn session(project: &str, kind: SessionType, minutes_ago: i64) -> Session {
        let number = if kind == SessionType::Initializer { 0 } else { 1 };
        let mut s = Session::new(project, number, kind, "sonnet");
        s.status = SessionStatus::Running;
        s.created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        s.started_at = Some(s.created_at);
        s
    }

    fn store_with(phase: ProjectPhase, sessions: Vec<Session>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .update(|ledger| {
                let mut project = Project::new("p1", "Demo");
                project.phase = phase;
                ledger.insert(Record::Project(project));
                for s in sessions {
                    ledger.insert(Record::Session(s));
                }
                Ok(())
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_stale_session_without_process_is_interrupted() {
        let s = session("p1", SessionType::Coding, 5);
        let store = store_with(ProjectPhase::Coding, vec![s.clone()]);
        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.interrupted, vec![s.id.clone()]);

        let stored = store.get_session(&s.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Interrupted);
        assert_eq!(stored.interruption_reason.as_deref(), Some(ORPHAN_REASON));
        assert_eq!(store.snapshot().unwrap().interventions().count(), 0);
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Ready);
    }

    #[tokio::test]
    async fn test_live_or_fresh_sessions_are_left_alone() {
        let live = session("p1", SessionType::Coding, 5);
        let store = store_with(ProjectPhase::Coding, vec![live.clone()]);
        let registry = ProcessRegistry::new();
        registry.register(&live.id, "p1", CancellationToken::new());
        let sweeper = Sweeper::new(store.clone(), registry, Duration::from_secs(60));
        assert!(sweeper.sweep().await.unwrap().interrupted.is_empty());

        let fresh = session("p1", SessionType::Coding, 0);
        let store = store_with(ProjectPhase::Coding, vec![fresh.clone()]);
        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));
        assert!(sweeper.sweep().await.unwrap().interrupted.is_empty());
        assert_eq!(
            store.get_session(&fresh.id).unwrap().status,
            SessionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_recent_heartbeat_keeps_session() {
        let mut s = session("p1", SessionType::Coding, 30);
        s.last_event_at = Some(Utc::now());
        let store = store_with(ProjectPhase::Coding, vec![s]);
        let sweeper = Sweeper::new(store, ProcessRegistry::new(), Duration::from_secs(60));
        assert!(sweeper.sweep().await.unwrap().interrupted.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_initializer_rolls_back() {
        let s = session("p1", SessionType::Initializer, 5);
        let store = store_with(ProjectPhase::Initializing, vec![s.clone()]);
        let sid = s.id.clone();
        store
            .update(|ledger| {
                let epic = roadmap::add_epic(ledger, "p1", "E", None, 0, Some(&sid))?;
                roadmap::add_task(ledger, &epic.id, "T", 0, Some(&sid))?;
                Ok(())
            })
            .unwrap();

        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.rows_rolled_back, 2);
        assert_eq!(report.projects_reset, vec!["p1".to_string()]);
        let ledger = store.snapshot().unwrap();
        assert!(!ledger.is_initialized("p1"));
        assert_eq!(
            ledger.project("p1").unwrap().phase,
            ProjectPhase::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_blocked_project_stays_blocked() {
        let s = session("p1", SessionType::Coding, 5);
        let store = store_with(ProjectPhase::Blocked, vec![s]);
        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));
        sweeper.sweep().await.unwrap();
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Blocked);
    }

    #[tokio::test]
    async fn test_registry_entries_for_finished_sessions_are_dropped() {
        let mut s = session("p1", SessionType::Coding, 5);
        s.status = SessionStatus::Completed;
        let store = store_with(ProjectPhase::Ready, vec![s.clone()]);
        let registry = ProcessRegistry::new();
        registry.register(&s.id, "p1", CancellationToken::new());
        registry.register("ghost", "p1", CancellationToken::new());

        let sweeper = Sweeper::new(store, registry.clone(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.stale_registry_entries.len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_coding_phase_is_released() {
        let mut ended = session("p1", SessionType::Coding, 10);
        ended.status = SessionStatus::Completed;
        ended.ended_at = Some(Utc::now() - chrono::Duration::minutes(9));
        let store = store_with(ProjectPhase::Coding, vec![ended]);

        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();
        assert!(report.interrupted.is_empty());
        assert_eq!(report.projects_reset, vec!["p1".to_string()]);
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Ready);
    }

    #[tokio::test]
    async fn test_phase_between_loop_sessions_is_kept() {
        let mut ended = session("p1", SessionType::Coding, 10);
        ended.status = SessionStatus::Completed;
        ended.ended_at = Some(Utc::now());
        let store = store_with(ProjectPhase::Coding, vec![ended]);

        let sweeper = Sweeper::new(store.clone(), ProcessRegistry::new(), Duration::from_secs(60));
        assert!(sweeper.sweep().await.unwrap().is_empty());
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Coding);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recycled_pid_is_not_signalled() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        // The recorded process is gone; its pid now names `sleep`
        let mut reused = session("p1", SessionType::Coding, 5);
        reused.pid = Some(pid);
        reused.pid_start_time = process_start_time(pid).map(|t| t + 1);
        let mut unverified = session("p2", SessionType::Coding, 5);
        unverified.pid = Some(pid);
        let store = store_with(ProjectPhase::Coding, vec![reused, unverified]);

        let sweeper = Sweeper::new(store, ProcessRegistry::new(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.interrupted.len(), 2);
        assert!(report.processes_terminated.is_empty());
        assert!(child.try_wait().unwrap().is_none(), "unrelated process was signalled");

        child.kill().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_orphan_process_with_matching_identity_is_terminated() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let waiter = tokio::spawn(async move { child.wait().await });

        let mut orphan = session("p1", SessionType::Coding, 5);
        orphan.pid = Some(pid);
        orphan.pid_start_time = process_start_time(pid);
        let store = store_with(ProjectPhase::Coding, vec![orphan]);

        let sweeper = Sweeper::new(store, ProcessRegistry::new(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.processes_terminated, vec![pid]);
        assert!(!waiter.await.unwrap().unwrap().success());
    }
}
