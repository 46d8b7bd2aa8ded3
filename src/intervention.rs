//! Intervention Manager: the pause/resume authority.
//!
//! A session is either running freely or paused by exactly one unresolved
//! [`Intervention`]. Pausing is idempotent: a second pause for the same
//! session hands back the existing record. Every transition is one store
//! transaction, so the intervention row and the project's `BLOCKED` phase
//! land together.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Document, Intervention, Ledger, PauseType, ProjectPhase, Session, new_id,
};
use crate::roadmap::{self, QualitySignal};
use crate::service::ProcessRegistry;
use crate::store::{StoreExt, TaskStore};
use crate::tracker::Escalation;

/// Arguments to [`InterventionManager::pause`]
#[derive(Debug, Clone)]
pub struct PauseRequest {
    pub session_id: String,
    pub reason: String,
    pub pause_type: PauseType,
    pub blocker_info: Document,
    pub retry_stats: Document,
    pub current_task_id: Option<String>,
}

impl PauseRequest {
    pub fn from_escalation(session_id: &str, escalation: Escalation) -> Self {
        Self {
            session_id: session_id.to_string(),
            reason: escalation.reason,
            pause_type: escalation.pause_type,
            blocker_info: escalation.blocker_info,
            retry_stats: escalation.retry_stats,
            current_task_id: escalation.current_task_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PauseOutcome {
    pub intervention: Intervention,
    /// False when an unresolved intervention already existed
    pub created: bool,
}

/// Advisory only; nothing resumes automatically.
///
/// Retry-limit pauses are externally fixable. A timeout is worth retrying
/// only if the session was making progress.
pub fn can_auto_resume(pause_type: PauseType, session: &Session) -> bool {
    match pause_type {
        PauseType::RetryLimit => true,
        PauseType::Timeout => session.metrics.tasks_completed > 0,
        PauseType::CriticalError | PauseType::Manual => false,
    }
}

#[derive(Clone)]
pub struct InterventionManager {
    store: Arc<dyn TaskStore>,
    registry: ProcessRegistry,
}

impl InterventionManager {
    pub fn new(store: Arc<dyn TaskStore>, registry: ProcessRegistry) -> Self {
        Self { store, registry }
    }

    /// Persist a pause for a session and block its project.
    ///
    /// Works whether or not the session's process is still alive; the
    /// common case is that it already exited. A live process owned by
    /// this orchestrator is told to stop.
    pub fn pause(&self, request: PauseRequest) -> Result<PauseOutcome> {
        let outcome = self.store.update(|ledger| pause_in(ledger, &request))?;

        let i = &outcome.intervention;
        if outcome.created {
            warn!(
                project = %i.project_id,
                session = %i.session_id,
                intervention = %i.id,
                pause_type = %i.pause_type,
                reason = %i.pause_reason,
                "session paused for intervention"
            );
        } else {
            debug!(
                session = %i.session_id,
                intervention = %i.id,
                "session already paused, returning existing intervention"
            );
        }

        self.registry.cancel(&request.session_id);
        Ok(outcome)
    }

    /// Operator-requested pause against the project's active session, or
    /// its most recent one when nothing is running.
    pub fn pause_manual(&self, project_id: &str, reason: &str, requested_by: &str) -> Result<PauseOutcome> {
        let ledger = self.store.snapshot()?;
        ledger.project_or_err(project_id)?;
        let session = ledger
            .active_session(project_id)
            .or_else(|| ledger.latest_session(project_id))
            .ok_or_else(|| {
                Error::InvalidState(format!("project '{}' has no sessions to pause", project_id))
            })?;

        let mut blocker = Document::new();
        blocker.insert("requested_by".into(), json!(requested_by));
        blocker.insert("session_status".into(), json!(session.status.to_string()));

        self.pause(PauseRequest {
            session_id: session.id.clone(),
            reason: reason.to_string(),
            pause_type: PauseType::Manual,
            blocker_info: blocker,
            retry_stats: Document::new(),
            current_task_id: roadmap::next_task(&ledger, project_id).map(|t| t.id.clone()),
        })
    }

    /// Resolve an intervention. The project returns to `READY` (or
    /// `UNINITIALIZED` without a roadmap) once nothing else blocks it.
    pub fn resume(&self, intervention_id: &str, resolved_by: &str, notes: Option<String>) -> Result<Intervention> {
        let (intervention, phase) = self.store.update(|ledger| {
            let intervention = ledger.resolve_intervention(intervention_id, resolved_by, notes)?;
            let project_id = intervention.project_id.clone();
            let still_blocked = !ledger.unresolved_for_project(&project_id).is_empty();
            let initialized = ledger.is_initialized(&project_id);

            let project = ledger.project_mut_or_err(&project_id)?;
            if project.phase == ProjectPhase::Blocked && !still_blocked {
                project.phase = if initialized {
                    ProjectPhase::Ready
                } else {
                    ProjectPhase::Uninitialized
                };
            }
            project.push_log(format!(
                "intervention {} resolved by {}",
                intervention.id, resolved_by
            ));
            Ok((intervention, project.phase))
        })?;

        info!(
            project = %intervention.project_id,
            intervention = %intervention.id,
            resolved_by,
            phase = %phase,
            "intervention resolved"
        );
        Ok(intervention)
    }

    pub fn get(&self, intervention_id: &str) -> Result<Intervention> {
        self.store
            .snapshot()?
            .intervention(intervention_id)
            .cloned()
            .ok_or_else(|| Error::not_found("intervention", intervention_id))
    }

    /// Unresolved interventions, oldest first
    pub fn list_active(&self, project_id: Option<&str>) -> Result<Vec<Intervention>> {
        let ledger = self.store.snapshot()?;
        let mut active: Vec<Intervention> = ledger
            .interventions()
            .filter(|i| !i.resolved && project_id.is_none_or(|p| i.project_id == p))
            .cloned()
            .collect();
        active.sort_by_key(|i| i.paused_at);
        Ok(active)
    }

    /// Resolved interventions, most recently resolved first
    pub fn list_history(&self, project_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Intervention>> {
        let ledger = self.store.snapshot()?;
        let mut resolved: Vec<Intervention> = ledger
            .interventions()
            .filter(|i| i.resolved && project_id.is_none_or(|p| i.project_id == p))
            .cloned()
            .collect();
        resolved.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        if let Some(limit) = limit {
            resolved.truncate(limit);
        }
        Ok(resolved)
    }

    /// Flag tasks this session completed that still have failing tests.
    /// These are warnings on the session and the project log, never pauses.
    pub fn record_quality_signals(&self, session_id: &str) -> Result<Vec<QualitySignal>> {
        let signals = self.store.update(|ledger| {
            let session = ledger.session_or_err(session_id)?;
            let since = session.created_at;
            let project_id = session.project_id.clone();

            let signals: Vec<QualitySignal> = roadmap::quality_signals(ledger, &project_id)
                .into_iter()
                .filter(|s| {
                    ledger
                        .task(&s.task_id)
                        .and_then(|t| t.completed_at)
                        .is_some_and(|at| at >= since)
                })
                .collect();
            if signals.is_empty() {
                return Ok(signals);
            }

            let messages: Vec<String> = signals.iter().map(|s| s.message()).collect();
            ledger
                .session_mut_or_err(session_id)?
                .metrics
                .quality_warnings
                .extend(messages.iter().cloned());
            let project = ledger.project_mut_or_err(&project_id)?;
            for message in &messages {
                project.push_log(format!("quality: {}", message));
            }
            Ok(signals)
        })?;

        for signal in &signals {
            warn!(
                session = %session_id,
                task = %signal.task_id,
                failing = signal.failing_tests.len(),
                "task completed with failing tests"
            );
        }
        Ok(signals)
    }
}

fn pause_in(ledger: &mut Ledger, request: &PauseRequest) -> Result<PauseOutcome> {
    let session = ledger.session_or_err(&request.session_id)?.clone();
    let intervention = Intervention {
        id: new_id("int"),
        session_id: session.id.clone(),
        project_id: session.project_id.clone(),
        pause_reason: request.reason.clone(),
        pause_type: request.pause_type,
        paused_at: Utc::now(),
        resolved: false,
        resolved_at: None,
        resolved_by: None,
        resolution_notes: None,
        blocker_info: request.blocker_info.clone(),
        retry_stats: request.retry_stats.clone(),
        current_task_id: request.current_task_id.clone(),
        can_auto_resume: can_auto_resume(request.pause_type, &session),
    };
    let (intervention, created) = ledger.insert_intervention_unique(intervention);
    if created {
        let project = ledger.project_mut_or_err(&session.project_id)?;
        project.phase = ProjectPhase::Blocked;
        project.push_log(format!(
            "paused ({}): {}",
            intervention.pause_type, intervention.pause_reason
        ));
    }
    Ok(PauseOutcome {
        intervention,
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Project, Record, SessionStatus, SessionType};
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (InterventionManager, Arc<MemoryStore>, Session) {
        let store = Arc::new(MemoryStore::new());
        let mut project = Project::new("p1", "Demo");
        project.phase = ProjectPhase::Coding;
        let mut session = Session::new("p1", 1, SessionType::Coding, "sonnet");
        session.status = SessionStatus::Running;
        let s = session.clone();
        store
            .update(|ledger| {
                ledger.insert(Record::Project(project));
                ledger.insert(Record::Session(s));
                Ok(())
            })
            .unwrap();
        let manager = InterventionManager::new(store.clone(), ProcessRegistry::new());
        (manager, store, session)
    }

    fn request(session: &Session, pause_type: PauseType) -> PauseRequest {
        PauseRequest {
            session_id: session.id.clone(),
            reason: "stuck".into(),
            pause_type,
            blocker_info: Document::new(),
            retry_stats: Document::new(),
            current_task_id: None,
        }
    }

    #[test]
    fn test_pause_blocks_project() {
        let (manager, store, session) = setup();
        let outcome = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();
        assert!(outcome.created);
        assert!(outcome.intervention.can_auto_resume);
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Blocked);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let (manager, store, session) = setup();
        let first = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();
        let second = manager.pause(request(&session, PauseType::Timeout)).unwrap();
        assert!(!second.created);
        assert_eq!(first.intervention.id, second.intervention.id);
        assert_eq!(second.intervention.pause_type, PauseType::RetryLimit);
        assert_eq!(store.snapshot().unwrap().interventions().count(), 1);
    }

    #[test]
    fn test_pause_after_session_ended() {
        let (manager, store, session) = setup();
        store
            .update(|ledger| ledger.finish_session(&session.id, SessionStatus::Error, Some("exit 1".into())))
            .unwrap();
        let outcome = manager
            .pause(request(&session, PauseType::CriticalError))
            .unwrap();
        assert!(outcome.created);
        assert!(!outcome.intervention.can_auto_resume);
    }

    #[test]
    fn test_pause_cancels_live_process() {
        let (manager, _store, session) = setup();
        let token = CancellationToken::new();
        manager
            .registry
            .register(&session.id, "p1", token.clone());
        manager.pause(request(&session, PauseType::Manual)).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_pause_unknown_session() {
        let (manager, _store, _session) = setup();
        let mut req = request(&Session::new("p1", 9, SessionType::Coding, "x"), PauseType::Manual);
        req.session_id = "nope".into();
        assert_eq!(manager.pause(req).unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn test_resume_returns_project_to_ready_or_uninitialized() {
        let (manager, store, session) = setup();
        let outcome = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();

        let resolved = manager
            .resume(&outcome.intervention.id, "alice", Some("fixed API key".into()))
            .unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution_notes.as_deref(), Some("fixed API key"));
        // No roadmap in this fixture
        assert_eq!(
            store.get_project("p1").unwrap().phase,
            ProjectPhase::Uninitialized
        );
    }

    #[test]
    fn test_resume_twice_fails_without_change() {
        let (manager, store, session) = setup();
        let outcome = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();
        manager.resume(&outcome.intervention.id, "alice", None).unwrap();

        let before = store.snapshot().unwrap();
        let err = manager
            .resume(&outcome.intervention.id, "bob", None)
            .unwrap_err();
        assert_eq!(err.kind(), "AlreadyResolved");
        assert_eq!(store.snapshot().unwrap(), before);
        assert_eq!(manager.resume("missing", "bob", None).unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn test_second_pause_after_resolution_creates_new_record() {
        let (manager, _store, session) = setup();
        let first = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();
        manager.resume(&first.intervention.id, "alice", None).unwrap();
        let second = manager.pause(request(&session, PauseType::Manual)).unwrap();
        assert!(second.created);
        assert_ne!(first.intervention.id, second.intervention.id);
    }

    #[test]
    fn test_list_active_and_history() {
        let (manager, store, session) = setup();
        let first = manager.pause(request(&session, PauseType::RetryLimit)).unwrap();
        assert_eq!(manager.list_active(Some("p1")).unwrap().len(), 1);
        assert!(manager.list_active(Some("other")).unwrap().is_empty());

        manager.resume(&first.intervention.id, "alice", None).unwrap();
        store
            .update(|ledger| ledger.finish_session(&session.id, SessionStatus::Completed, None))
            .unwrap();
        let second = manager.pause_manual("p1", "look at this", "bob").unwrap();
        manager.resume(&second.intervention.id, "bob", None).unwrap();

        assert!(manager.list_active(None).unwrap().is_empty());
        let history = manager.list_history(Some("p1"), None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.intervention.id);
        assert_eq!(manager.list_history(None, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_can_auto_resume_rules() {
        let mut session = Session::new("p1", 1, SessionType::Coding, "sonnet");
        assert!(can_auto_resume(PauseType::RetryLimit, &session));
        assert!(!can_auto_resume(PauseType::CriticalError, &session));
        assert!(!can_auto_resume(PauseType::Manual, &session));
        assert!(!can_auto_resume(PauseType::Timeout, &session));
        session.metrics.tasks_completed = 1;
        assert!(can_auto_resume(PauseType::Timeout, &session));
    }

    #[test]
    fn test_quality_signals_are_recorded_not_blocking() {
        let (manager, store, session) = setup();
        let sid = session.id.clone();
        store
            .update(|ledger| {
                let epic = roadmap::add_epic(ledger, "p1", "E", None, 0, Some(&sid))?;
                let task = roadmap::add_task(ledger, &epic.id, "T", 0, Some(&sid))?;
                let test = roadmap::add_test(ledger, &task.id, "x", Some(&sid))?;
                roadmap::set_test_result(ledger, &test.id, false, Some(&sid))?;
                roadmap::complete_task(ledger, &task.id, Some(&sid))?;
                Ok(())
            })
            .unwrap();

        let signals = manager.record_quality_signals(&sid).unwrap();
        assert_eq!(signals.len(), 1);
        let stored = store.get_session(&sid).unwrap();
        assert_eq!(stored.metrics.quality_warnings.len(), 1);
        assert!(manager.list_active(None).unwrap().is_empty());
        assert_eq!(store.get_project("p1").unwrap().phase, ProjectPhase::Coding);
    }
}
