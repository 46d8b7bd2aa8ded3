//! Session Orchestrator
//!
//! Sequences sessions for a project: the initializer once, then coding
//! sessions in a loop until the roadmap is complete, a stop is requested,
//! the iteration cap is reached or the project blocks.
//!
//! Phase machine:
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> READY <-> CODING -> COMPLETE
//!                       |                      |
//!                       +------> BLOCKED <-----+
//! ```
//!
//! Every check-then-create step (is a session already active? is the
//! project paused?) runs inside one store transaction, so two callers
//! racing to start the same project cannot both win. A running loop keeps
//! the project in `CODING` between its sessions, which is what keeps a
//! second loop out while no session is active.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::intervention::{InterventionManager, PauseRequest};
use crate::model::{
    Intervention, Ledger, Progress, Project, ProjectPhase, ProjectSettings, Record, SandboxMode,
    Session, SessionStatus, SessionType, StopMode, Task, new_id,
};
use crate::roadmap;
use crate::service::{
    LaunchRequest, ProcessHandle, ProcessRegistry, SessionEvent, SessionRunner, is_process_alive,
    is_same_process, process_start_time, terminate_pid,
};
use crate::store::{StoreExt, TaskStore};
use crate::sweeper::{SweepReport, Sweeper};
use crate::tracker::{Escalation, Tracker, Verdict};

pub const STOPPED_REASON: &str = "stopped by request";
pub const NO_TERMINAL_EVENT: &str = "agent exited without a terminal event";
pub const INIT_CANCELLED: &str = "initialization cancelled";
pub const STOP_GRACE_EXPIRED: &str = "stop grace period expired";

const TIMEOUT_CHECK: Duration = Duration::from_millis(500);
const WAIT_POLL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Arguments to [`Orchestrator::create_project`]
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    /// Derived from the name when absent
    pub id: Option<String>,
    pub sandbox: SandboxMode,
    pub settings: ProjectSettings,
}

/// How one session ended, from the orchestrator's point of view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    /// An intervention now holds the project
    Blocked { intervention_id: String },
    Stopped,
    /// The process went away without a terminal event
    Interrupted { reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: Session,
    #[serde(flatten)]
    pub end: SessionEnd,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    #[serde(flatten)]
    pub report: SessionReport,
    pub phase: ProjectPhase,
    pub rows_rolled_back: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    Complete,
    Stopped,
    IterationCap,
    Blocked,
    Interrupted,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopExit::Complete => "complete",
            LoopExit::Stopped => "stopped",
            LoopExit::IterationCap => "iteration cap reached",
            LoopExit::Blocked => "blocked",
            LoopExit::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopSummary {
    pub project_id: String,
    pub sessions: Vec<SessionReport>,
    pub exit: LoopExit,
    pub phase: ProjectPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub project_id: String,
    pub mode: StopMode,
    /// The session that was active when the stop was requested
    pub session_id: Option<String>,
    /// True when the session had to be force-marked interrupted
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub project_id: String,
    pub session_id: Option<String>,
    pub rows_rolled_back: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub project: Project,
    pub progress: Progress,
    pub next_task: Option<Task>,
    pub active_session: Option<Session>,
    pub latest_session: Option<Session>,
    pub unresolved_interventions: Vec<Intervention>,
    /// Whether this process is driving the active session
    pub live: bool,
}

enum Claim {
    Session(Box<Project>, Session),
    Exit(LoopExit),
}

/// Why the event loop for one session stopped
enum Driven {
    Completed(Option<String>),
    Failed(String),
    Escalated(Escalation),
    Paused(Intervention),
    Stopped,
    StreamClosed,
}

/// Metrics the orchestrator owns. Task and test counters are written by
/// roadmap callbacks and are left alone here.
#[derive(Debug, Default)]
struct Counters {
    tool_calls: u64,
    tool_errors: u64,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
}

impl Counters {
    fn apply(&self, session: &mut Session) {
        session.metrics.tool_calls = self.tool_calls;
        session.metrics.tool_errors = self.tool_errors;
        session.metrics.input_tokens = self.input_tokens;
        session.metrics.output_tokens = self.output_tokens;
        session.metrics.cost_usd = self.cost_usd;
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn SessionRunner>,
    registry: ProcessRegistry,
    interventions: InterventionManager,
    sweeper: Sweeper,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn TaskStore>, runner: Arc<dyn SessionRunner>, config: Config) -> Self {
        let registry = ProcessRegistry::new();
        let interventions = InterventionManager::new(store.clone(), registry.clone());
        let sweeper = Sweeper::new(store.clone(), registry.clone(), config.sweeper.grace());
        Self {
            store,
            runner,
            registry,
            interventions,
            sweeper,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn interventions(&self) -> &InterventionManager {
        &self.interventions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Sweep before starting work, unless disabled in config
    pub async fn startup_sweep(&self) -> Result<Option<SweepReport>> {
        if !self.config.sweeper.sweep_on_startup {
            return Ok(None);
        }
        self.sweep().await.map(Some)
    }

    // -- projects --

    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        let id = match new.id {
            Some(id) => id,
            None => {
                let slug = slugify(&new.name);
                if slug.is_empty() { new_id("proj") } else { slug }
            }
        };
        let project = self.store.update(|ledger| {
            if ledger.project(&id).is_some() {
                return Err(Error::InvalidState(format!("project '{}' already exists", id)));
            }
            let mut project = Project::new(&id, &new.name);
            project.sandbox = new.sandbox;
            project.settings = new.settings;
            project.push_log("project created");
            ledger.insert(Record::Project(project.clone()));
            Ok(project)
        })?;
        info!(project = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.snapshot()?.projects().cloned().collect())
    }

    pub fn update_settings(
        &self,
        project_id: &str,
        model: Option<String>,
        max_iterations: Option<u32>,
    ) -> Result<Project> {
        self.store.update(|ledger| {
            let project = ledger.project_mut_or_err(project_id)?;
            if let Some(model) = model {
                project.settings.model = Some(model);
            }
            if let Some(max) = max_iterations {
                project.settings.max_iterations = Some(max);
            }
            project.push_log("settings updated");
            Ok(project.clone())
        })
    }

    pub fn project_status(&self, project_id: &str) -> Result<ProjectStatus> {
        let ledger = self.store.snapshot()?;
        let project = ledger.project_or_err(project_id)?.clone();
        let active_session = ledger.active_session(project_id).cloned();
        let live = active_session
            .as_ref()
            .is_some_and(|s| self.registry.is_live(&s.id));
        let mut unresolved: Vec<Intervention> = ledger
            .unresolved_for_project(project_id)
            .into_iter()
            .cloned()
            .collect();
        unresolved.sort_by_key(|i| i.paused_at);

        Ok(ProjectStatus {
            progress: ledger.progress(project_id),
            next_task: roadmap::next_task(&ledger, project_id).cloned(),
            latest_session: ledger.latest_session(project_id).cloned(),
            active_session,
            unresolved_interventions: unresolved,
            live,
            project,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.store.get_session(session_id)
    }

    pub fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        let ledger = self.store.snapshot()?;
        ledger.project_or_err(project_id)?;
        Ok(ledger.sessions_for(project_id).into_iter().cloned().collect())
    }

    // -- initialization --

    /// Run the initializer session (number 0) to build the roadmap.
    ///
    /// With `force`, an existing roadmap is discarded first. If the
    /// initializer does not finish cleanly with a non-empty roadmap, the
    /// rows it created are removed again.
    pub async fn start_initialization(&self, project_id: &str, force: bool) -> Result<InitReport> {
        let default_model = self.config.agent.model.clone();
        let (project, session) = self.store.update(|ledger| {
            let model = ledger
                .project_or_err(project_id)?
                .settings
                .model
                .clone()
                .unwrap_or(default_model);
            check_idle(ledger, project_id)?;
            if ledger.is_initialized(project_id) && !force {
                return Err(Error::AlreadyInitialized(project_id.to_string()));
            }

            let removed = if force {
                ledger.retain_roadmap(|p, _| p != project_id)
            } else {
                0
            };
            let session = Session::new(project_id, 0, SessionType::Initializer, &model);
            ledger.insert_session_exclusive(session.clone())?;

            let project = ledger.project_mut_or_err(project_id)?;
            project.phase = ProjectPhase::Initializing;
            project.stop_requested = None;
            if removed > 0 {
                project.push_log(format!("discarded {} roadmap rows to re-initialize", removed));
            }
            project.push_log(format!("initializer session {} started", session.id));
            Ok((project.clone(), session))
        })?;
        info!(project = %project_id, session = %session.id, force, "initialization started");

        let report = self.run_session(&project, session).await?;
        let (phase, rows_rolled_back) = self.settle_initialization(&report)?;
        info!(
            project = %project_id,
            session = %report.session.id,
            phase = %phase,
            rolled_back = rows_rolled_back,
            "initialization finished"
        );
        Ok(InitReport {
            report,
            phase,
            rows_rolled_back,
        })
    }

    fn settle_initialization(&self, report: &SessionReport) -> Result<(ProjectPhase, usize)> {
        let session_id = &report.session.id;
        let project_id = &report.session.project_id;
        let succeeded = report.end == SessionEnd::Completed;

        self.store.update(|ledger| {
            let built = succeeded && ledger.is_initialized(project_id);
            let removed = if built {
                0
            } else {
                roadmap::rollback_session(ledger, session_id)
            };

            let project = ledger.project_mut_or_err(project_id)?;
            if project.phase == ProjectPhase::Initializing {
                project.phase = if built {
                    ProjectPhase::Ready
                } else {
                    ProjectPhase::Uninitialized
                };
            }
            project.stop_requested = None;
            if built {
                project.push_log("roadmap created");
            } else if succeeded {
                warn!(project = %project_id, session = %session_id, "initializer finished without creating a roadmap");
                project.push_log("initializer finished without creating a roadmap");
            }
            if removed > 0 {
                project.push_log(format!("rolled back {} roadmap rows", removed));
            }
            Ok((project.phase, removed))
        })
    }

    /// Stop a running initializer and remove everything it created, so
    /// initialization can start again from scratch.
    pub async fn cancel_initialization(&self, project_id: &str) -> Result<CancelReport> {
        let (phase, active) = {
            let ledger = self.store.snapshot()?;
            let project = ledger.project_or_err(project_id)?;
            let active = ledger
                .active_session(project_id)
                .filter(|s| s.session_type == SessionType::Initializer)
                .map(|s| s.id.clone());
            (project.phase, active)
        };
        if phase != ProjectPhase::Initializing {
            return Err(Error::InvalidPhase {
                project_id: project_id.to_string(),
                phase: phase.to_string(),
                operation: "cancel initialization of",
            });
        }

        if let Some(session_id) = &active {
            // Reaches a driver in another process through the stop poll
            self.store.update(|ledger| {
                ledger.project_mut_or_err(project_id)?.stop_requested = Some(StopMode::Immediate);
                Ok(())
            })?;
            self.registry.cancel(session_id);
            let grace = self.config.orchestrator.stop_grace();
            if !self.wait_until_finished(session_id, grace).await? {
                warn!(project = %project_id, session = %session_id, "initializer did not stop in time, forcing");
            }
        }

        let (target, removed, (pid, pid_start_time)) = self.store.update(|ledger| {
            let target = active.clone().or_else(|| {
                ledger
                    .sessions_for(project_id)
                    .into_iter()
                    .rev()
                    .find(|s| s.session_type == SessionType::Initializer)
                    .map(|s| s.id.clone())
            });
            let mut process = (None, None);
            let mut removed = 0;
            if let Some(id) = &target {
                ledger.finish_session(id, SessionStatus::Interrupted, Some(INIT_CANCELLED.to_string()))?;
                let session = ledger.session_or_err(id)?;
                process = (session.pid, session.pid_start_time);
                removed = roadmap::rollback_session(ledger, id);
            }

            let project = ledger.project_mut_or_err(project_id)?;
            project.phase = ProjectPhase::Uninitialized;
            project.stop_requested = None;
            project.push_log(format!(
                "initialization cancelled, rolled back {} roadmap rows",
                removed
            ));
            Ok((target, removed, process))
        })?;

        if let Some(id) = &target {
            self.registry.unregister(id);
        }
        self.kill_leftover(pid, pid_start_time).await;
        info!(project = %project_id, rolled_back = removed, "initialization cancelled");
        Ok(CancelReport {
            project_id: project_id.to_string(),
            session_id: target,
            rows_rolled_back: removed,
        })
    }

    // -- coding loop --

    /// Run coding sessions until the roadmap is complete, a stop is
    /// requested, the iteration cap is hit, or the project blocks.
    ///
    /// `max_iterations` overrides the project setting, which overrides the
    /// config default. Zero means unlimited.
    pub async fn start_coding_loop(
        &self,
        project_id: &str,
        max_iterations: Option<u32>,
    ) -> Result<LoopSummary> {
        let mut sessions = Vec::new();
        let mut iterations: u32 = 0;

        let exit = match self
            .coding_iterations(project_id, max_iterations, &mut iterations, &mut sessions)
            .await
        {
            Ok(exit) => exit,
            Err(e) => {
                // Only a loop that claimed the project may hand it back
                if iterations > 0 {
                    self.release_coding(project_id, &e);
                }
                return Err(e);
            }
        };

        let phase = self.store.get_project(project_id)?.phase;
        info!(
            project = %project_id,
            sessions = sessions.len(),
            exit = %exit,
            phase = %phase,
            "coding loop finished"
        );
        Ok(LoopSummary {
            project_id: project_id.to_string(),
            sessions,
            exit,
            phase,
        })
    }

    async fn coding_iterations(
        &self,
        project_id: &str,
        max_iterations: Option<u32>,
        iterations: &mut u32,
        sessions: &mut Vec<SessionReport>,
    ) -> Result<LoopExit> {
        loop {
            let (project, session) = match self.claim_coding_session(project_id, max_iterations, *iterations)? {
                Claim::Session(project, session) => (project, session),
                Claim::Exit(exit) => return Ok(exit),
            };
            *iterations += 1;
            info!(
                project = %project_id,
                session = %session.id,
                number = session.session_number,
                "coding session started"
            );

            let report = self.run_session(&project, session).await?;
            self.interventions.record_quality_signals(&report.session.id)?;
            let exit = self.settle_coding(&report)?;
            sessions.push(report);
            if let Some(exit) = exit {
                return Ok(exit);
            }
        }
    }

    /// Hand the project back after the loop died on an error
    fn release_coding(&self, project_id: &str, cause: &Error) {
        let released = self.store.update(|ledger| {
            if ledger.active_session(project_id).is_some() {
                return Ok(false);
            }
            let project = ledger.project_mut_or_err(project_id)?;
            if project.phase != ProjectPhase::Coding {
                return Ok(false);
            }
            project.phase = ProjectPhase::Ready;
            project.push_log(format!("coding loop aborted: {}", cause));
            Ok(true)
        });
        match released {
            Ok(true) => warn!(project = %project_id, error = %cause, "coding loop aborted, project released"),
            Ok(false) => {}
            Err(e) => warn!(project = %project_id, error = %e, "failed to release project after loop error"),
        }
    }

    /// Top of a loop iteration: evaluate completion, the stop flag and
    /// the iteration cap, then create the next session. All in one
    /// transaction.
    fn claim_coding_session(
        &self,
        project_id: &str,
        max_iterations: Option<u32>,
        done: u32,
    ) -> Result<Claim> {
        let first = done == 0;
        let default_model = &self.config.agent.model;
        let default_cap = self.config.orchestrator.max_iterations;

        self.store.update(|ledger| {
            let project = ledger.project_or_err(project_id)?;
            if first {
                if !ledger.is_initialized(project_id) {
                    return Err(Error::NotInitialized(project_id.to_string()));
                }
                check_idle(ledger, project_id)?;
            } else if project.phase == ProjectPhase::Blocked
                || !ledger.unresolved_for_project(project_id).is_empty()
            {
                return Ok(Claim::Exit(LoopExit::Blocked));
            }

            let cap = max_iterations
                .or(project.settings.max_iterations)
                .unwrap_or(default_cap);
            let model = project
                .settings
                .model
                .clone()
                .unwrap_or_else(|| default_model.clone());
            let stop = project.stop_requested;
            let complete = ledger.progress(project_id).is_complete();

            let exit = if complete {
                Some((LoopExit::Complete, ProjectPhase::Complete, "all tasks complete".to_string()))
            } else if !first && stop.is_some() {
                Some((LoopExit::Stopped, ProjectPhase::Ready, "stopped after current session".to_string()))
            } else if cap > 0 && done >= cap {
                Some((
                    LoopExit::IterationCap,
                    ProjectPhase::Ready,
                    format!("iteration cap of {} reached", cap),
                ))
            } else {
                None
            };
            if let Some((exit, phase, message)) = exit {
                let project = ledger.project_mut_or_err(project_id)?;
                project.phase = phase;
                project.stop_requested = None;
                project.push_log(message);
                return Ok(Claim::Exit(exit));
            }

            let number = ledger.next_session_number(project_id);
            let session = Session::new(project_id, number, SessionType::Coding, &model);
            ledger.insert_session_exclusive(session.clone())?;

            let project = ledger.project_mut_or_err(project_id)?;
            project.phase = ProjectPhase::Coding;
            // A stale flag from before this loop started does not apply
            project.stop_requested = None;
            project.push_log(format!("coding session {} ({}) started", number, session.id));
            Ok(Claim::Session(Box::new(project.clone()), session))
        })
    }

    /// Record the session's end. The project stays `CODING` while the loop
    /// carries on and drops to `READY` when this session ends it.
    fn settle_coding(&self, report: &SessionReport) -> Result<Option<LoopExit>> {
        let project_id = &report.session.project_id;
        let exit = match &report.end {
            SessionEnd::Completed => None,
            SessionEnd::Blocked { .. } => return Ok(Some(LoopExit::Blocked)),
            SessionEnd::Stopped => Some(LoopExit::Stopped),
            SessionEnd::Interrupted { .. } | SessionEnd::Failed { .. } => Some(LoopExit::Interrupted),
        };

        self.store.update(|ledger| {
            let project = ledger.project_mut_or_err(project_id)?;
            if exit.is_some() && project.phase == ProjectPhase::Coding {
                project.phase = ProjectPhase::Ready;
            }
            if exit == Some(LoopExit::Stopped) {
                project.stop_requested = None;
            }
            project.push_log(format!(
                "session {} ended: {}",
                report.session.id, report.session.status
            ));
            Ok(())
        })?;
        Ok(exit)
    }

    // -- one session --

    async fn run_session(&self, project: &Project, session: Session) -> Result<SessionReport> {
        match self.launch_and_drive(project, &session).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abandon_session(&session, &e);
                Err(e)
            }
        }
    }

    async fn launch_and_drive(&self, project: &Project, session: &Session) -> Result<SessionReport> {
        let mut tracker = Tracker::new(&self.config.retry)?;
        if session.session_type == SessionType::Coding {
            let ledger = self.store.snapshot()?;
            tracker.set_current_task(roadmap::next_task(&ledger, &project.id).map(|t| t.id.clone()));
        }

        let request = LaunchRequest {
            project_id: project.id.clone(),
            project_name: project.name.clone(),
            session_id: session.id.clone(),
            session_type: session.session_type,
            model: session.model.clone(),
            prompt: self.prompt_for(project, session),
            sandbox: project.sandbox,
        };

        let mut handle = match self.runner.launch(request).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                warn!(project = %project.id, session = %session.id, error = %message, "agent launch failed");
                let driven = match tracker.critical_error("failed to launch agent", &message) {
                    Some(escalation) => Driven::Escalated(escalation),
                    None => Driven::Failed(message),
                };
                return self.settle_session(&session.id, driven, &Counters::default());
            }
        };

        self.registry
            .register(&session.id, &project.id, handle.cancel.clone());
        let pid = handle.pid;
        let pid_start_time = pid.and_then(process_start_time);
        let started = self.store.update_session(&session.id, |s| {
            if s.status == SessionStatus::Pending {
                s.status = SessionStatus::Running;
                s.started_at = Some(Utc::now());
                s.pid = pid;
                s.pid_start_time = pid_start_time;
            }
        });

        let mut counters = Counters::default();
        let driven = match started {
            Ok(_) => {
                debug!(session = %session.id, pid = ?pid, "agent running");
                self.drive(session, &mut tracker, &mut handle, &mut counters)
                    .await
            }
            Err(e) => Err(e),
        };

        handle.cancel();
        self.registry.unregister(&session.id);
        self.settle_session(&session.id, driven?, &counters)
    }

    /// Best-effort cleanup when driving a session failed outright: end the
    /// session and hand the project back so nothing is left claimed.
    fn abandon_session(&self, session: &Session, cause: &Error) {
        let reason = format!("orchestrator error: {}", cause);
        let cleaned = self.store.update(|ledger| {
            if !ledger.finish_session(&session.id, SessionStatus::Interrupted, Some(reason.clone()))? {
                return Ok(());
            }
            let removed = if session.session_type == SessionType::Initializer {
                roadmap::rollback_session(ledger, &session.id)
            } else {
                0
            };
            let project = ledger.project_mut_or_err(&session.project_id)?;
            match (session.session_type, project.phase) {
                (SessionType::Initializer, ProjectPhase::Initializing) => {
                    project.phase = ProjectPhase::Uninitialized
                }
                (SessionType::Coding, ProjectPhase::Coding) => project.phase = ProjectPhase::Ready,
                _ => {}
            }
            project.push_log(format!("session {} abandoned: {}", session.id, reason));
            if removed > 0 {
                project.push_log(format!("rolled back {} roadmap rows", removed));
            }
            Ok(())
        });
        match cleaned {
            Ok(()) => warn!(session = %session.id, error = %cause, "session abandoned after orchestrator error"),
            Err(e) => warn!(
                session = %session.id,
                error = %cause,
                cleanup_error = %e,
                "session left active after orchestrator error; the sweeper will reclaim it"
            ),
        }
    }

    async fn drive(
        &self,
        session: &Session,
        tracker: &mut Tracker,
        handle: &mut ProcessHandle,
        counters: &mut Counters,
    ) -> Result<Driven> {
        let started = Instant::now();
        let mut clock = ticker(TIMEOUT_CHECK);
        let mut heartbeat = ticker(self.config.orchestrator.heartbeat_interval());
        let mut stop_poll = ticker(self.config.orchestrator.stop_poll_interval());

        loop {
            tokio::select! {
                biased;
                event = handle.events.recv() => {
                    let Some(event) = event else {
                        // A cancelled agent closes its stream on the way out
                        if handle.cancel.is_cancelled() {
                            return self.cancelled(session);
                        }
                        return Ok(Driven::StreamClosed);
                    };
                    if let Some(driven) = on_event(session, tracker, counters, event) {
                        return Ok(driven);
                    }
                    if let Some(escalation) = tracker.check_timeout(started.elapsed()) {
                        return Ok(Driven::Escalated(escalation));
                    }
                }
                _ = handle.cancel.cancelled() => return self.cancelled(session),
                _ = clock.tick() => {
                    if let Some(escalation) = tracker.check_timeout(started.elapsed()) {
                        return Ok(Driven::Escalated(escalation));
                    }
                }
                _ = stop_poll.tick() => {
                    if let Some(driven) = self.poll_external(session)? {
                        return Ok(driven);
                    }
                }
                _ = heartbeat.tick() => {
                    self.store.update_session(&session.id, |s| {
                        if s.status.is_active() {
                            s.last_event_at = Some(Utc::now());
                            counters.apply(s);
                        }
                    })?;
                }
            }
        }
    }

    /// Cancelled through the registry: a pause or a stop
    fn cancelled(&self, session: &Session) -> Result<Driven> {
        Ok(match self.store.find_unresolved_intervention(&session.id)? {
            Some(intervention) => Driven::Paused(intervention),
            None => Driven::Stopped,
        })
    }

    /// Pick up a pause or stop raised from another process
    fn poll_external(&self, session: &Session) -> Result<Option<Driven>> {
        let ledger = self.store.snapshot()?;
        if let Some(intervention) = ledger.unresolved_for_session(&session.id) {
            return Ok(Some(Driven::Paused(intervention.clone())));
        }
        if ledger.session_or_err(&session.id)?.status.is_terminal() {
            return Ok(Some(Driven::Stopped));
        }
        let project = ledger.project_or_err(&session.project_id)?;
        if project.stop_requested == Some(StopMode::Immediate) {
            return Ok(Some(Driven::Stopped));
        }
        Ok(None)
    }

    fn settle_session(&self, session_id: &str, driven: Driven, counters: &Counters) -> Result<SessionReport> {
        let (status, detail, end) = match driven {
            Driven::Escalated(escalation) => {
                self.store.update_session(session_id, |s| counters.apply(s))?;
                let outcome = self
                    .interventions
                    .pause(PauseRequest::from_escalation(session_id, escalation))?;
                let i = outcome.intervention;
                (
                    SessionStatus::Error,
                    Some(i.pause_reason),
                    SessionEnd::Blocked { intervention_id: i.id },
                )
            }
            Driven::Paused(i) => (
                SessionStatus::Interrupted,
                Some(format!("paused by intervention {}", i.id)),
                SessionEnd::Blocked { intervention_id: i.id },
            ),
            Driven::Completed(summary) => {
                if let Some(summary) = summary {
                    debug!(session = %session_id, summary = %summary, "agent summary");
                }
                (SessionStatus::Completed, None, SessionEnd::Completed)
            }
            Driven::Failed(message) => (
                SessionStatus::Error,
                Some(message.clone()),
                SessionEnd::Failed { message },
            ),
            Driven::Stopped => (
                SessionStatus::Interrupted,
                Some(STOPPED_REASON.to_string()),
                SessionEnd::Stopped,
            ),
            Driven::StreamClosed => (
                SessionStatus::Interrupted,
                Some(NO_TERMINAL_EVENT.to_string()),
                SessionEnd::Interrupted {
                    reason: NO_TERMINAL_EVENT.to_string(),
                },
            ),
        };

        let session = self.store.update(|ledger| {
            counters.apply(ledger.session_mut_or_err(session_id)?);
            ledger.finish_session(session_id, status, detail)?;
            Ok(ledger.session_or_err(session_id)?.clone())
        })?;

        match &end {
            SessionEnd::Completed => info!(session = %session_id, "session completed"),
            SessionEnd::Interrupted { reason } => {
                warn!(session = %session_id, reason = %reason, "session interrupted")
            }
            other => info!(session = %session_id, status = %session.status, end = ?other, "session ended"),
        }
        Ok(SessionReport { session, end })
    }

    fn prompt_for(&self, project: &Project, session: &Session) -> String {
        let template = match session.session_type {
            SessionType::Initializer => &self.config.agent.initializer_prompt,
            SessionType::Coding => &self.config.agent.coding_prompt,
        };
        template
            .replace("{project_id}", &project.id)
            .replace("{project_name}", &project.name)
            .replace("{session_id}", &session.id)
    }

    // -- stopping --

    /// `after-current` only records the flag; the loop honours it before
    /// starting another session. `immediate` also cancels the live
    /// session and, if it is still active after the grace period, marks
    /// it interrupted and kills its recorded process.
    pub async fn request_stop(&self, project_id: &str, mode: StopMode) -> Result<StopOutcome> {
        let active = self.store.update(|ledger| {
            let active = ledger.active_session(project_id).map(|s| s.id.clone());
            let project = ledger.project_mut_or_err(project_id)?;
            project.stop_requested = Some(mode);
            project.push_log(format!("stop requested ({})", mode));
            Ok(active)
        })?;
        info!(project = %project_id, mode = %mode, session = ?active, "stop requested");

        let mut outcome = StopOutcome {
            project_id: project_id.to_string(),
            mode,
            session_id: active.clone(),
            forced: false,
        };
        let Some(session_id) = active else {
            return Ok(outcome);
        };
        if mode == StopMode::AfterCurrent {
            return Ok(outcome);
        }

        self.registry.cancel(&session_id);
        let grace = self.config.orchestrator.stop_grace();
        if self.wait_until_finished(&session_id, grace).await? {
            return Ok(outcome);
        }

        warn!(
            project = %project_id,
            session = %session_id,
            grace_secs = grace.as_secs(),
            "session still active after stop grace period, forcing interruption"
        );
        self.force_interrupt(&session_id, STOP_GRACE_EXPIRED).await?;
        outcome.forced = true;
        Ok(outcome)
    }

    /// Poll until the session is terminal. False on timeout.
    async fn wait_until_finished(&self, session_id: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.store.get_session(session_id)?.status.is_terminal() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn force_interrupt(&self, session_id: &str, reason: &str) -> Result<()> {
        let session = self.store.update(|ledger| {
            let changed =
                ledger.finish_session(session_id, SessionStatus::Interrupted, Some(reason.to_string()))?;
            let session = ledger.session_or_err(session_id)?.clone();
            if !changed {
                return Ok(session);
            }

            let removed = if session.session_type == SessionType::Initializer {
                roadmap::rollback_session(ledger, session_id)
            } else {
                0
            };
            let project = ledger.project_mut_or_err(&session.project_id)?;
            match (session.session_type, project.phase) {
                (SessionType::Initializer, ProjectPhase::Initializing) => {
                    project.phase = ProjectPhase::Uninitialized
                }
                (SessionType::Coding, ProjectPhase::Coding) => project.phase = ProjectPhase::Ready,
                _ => {}
            }
            project.stop_requested = None;
            project.push_log(format!("session {} force-interrupted: {}", session_id, reason));
            if removed > 0 {
                project.push_log(format!("rolled back {} roadmap rows", removed));
            }
            Ok(session)
        })?;

        self.registry.unregister(session_id);
        self.kill_leftover(session.pid, session.pid_start_time).await;
        Ok(())
    }

    /// Kill a recorded agent process, but only while the pid still names
    /// the process that was recorded for the session.
    async fn kill_leftover(&self, pid: Option<u32>, start_time: Option<u64>) {
        let Some(pid) = pid else { return };
        if !is_same_process(pid, start_time) {
            if is_process_alive(pid) {
                debug!(pid, "recorded pid now belongs to another process, not signalling");
            }
            return;
        }
        match terminate_pid(pid, KILL_GRACE).await {
            Ok(_) => info!(pid, "terminated agent process"),
            Err(e) => warn!(pid, error = %e, "failed to terminate agent process"),
        }
    }

    // -- reset --

    /// Return an idle project to `READY` (or `UNINITIALIZED` without a
    /// roadmap). `hard` also clears task completion and test results.
    pub fn reset(&self, project_id: &str, hard: bool) -> Result<Project> {
        let project = self.store.update(|ledger| {
            ledger.project_or_err(project_id)?;
            check_quiet(ledger, project_id)?;
            if hard {
                roadmap::reset_progress(ledger, project_id);
            }
            let initialized = ledger.is_initialized(project_id);
            let project = ledger.project_mut_or_err(project_id)?;
            project.phase = if initialized {
                ProjectPhase::Ready
            } else {
                ProjectPhase::Uninitialized
            };
            project.stop_requested = None;
            project.push_log(if hard { "hard reset" } else { "reset" });
            Ok(project.clone())
        })?;
        info!(project = %project_id, hard, phase = %project.phase, "project reset");
        Ok(project)
    }
}

/// Nobody owns the project: it is quiet and no loop or initializer holds
/// its phase between sessions
fn check_idle(ledger: &Ledger, project_id: &str) -> Result<()> {
    check_quiet(ledger, project_id)?;
    let phase = ledger.project_or_err(project_id)?.phase;
    if matches!(phase, ProjectPhase::Coding | ProjectPhase::Initializing) {
        return Err(Error::AlreadyRunning {
            project_id: project_id.to_string(),
            session_id: ledger
                .latest_session(project_id)
                .map(|s| s.id.clone())
                .unwrap_or_default(),
        });
    }
    Ok(())
}

/// No active session and no unresolved intervention
fn check_quiet(ledger: &Ledger, project_id: &str) -> Result<()> {
    if let Some(active) = ledger.active_session(project_id) {
        return Err(Error::AlreadyRunning {
            project_id: project_id.to_string(),
            session_id: active.id.clone(),
        });
    }
    if let Some(i) = ledger
        .unresolved_for_project(project_id)
        .into_iter()
        .min_by_key(|i| i.paused_at)
    {
        return Err(Error::AlreadyPaused {
            session_id: i.session_id.clone(),
            intervention_id: i.id.clone(),
        });
    }
    Ok(())
}

fn on_event(
    session: &Session,
    tracker: &mut Tracker,
    counters: &mut Counters,
    event: SessionEvent,
) -> Option<Driven> {
    match event {
        SessionEvent::ToolUse { tool, task_id } => {
            counters.tool_calls += 1;
            tracker.on_tool_use(&tool, task_id.as_deref());
            debug!(session = %session.id, tool = %tool, "tool use");
            None
        }
        SessionEvent::ToolResult {
            tool,
            is_error,
            content,
        } => {
            if is_error {
                counters.tool_errors += 1;
            }
            match tracker.on_tool_result(&tool, is_error, &content) {
                Verdict::Escalate(escalation) => Some(Driven::Escalated(escalation)),
                Verdict::Retry { count } => {
                    debug!(session = %session.id, tool = %tool, count, "tool failure counted");
                    None
                }
                Verdict::Success => None,
            }
        }
        SessionEvent::Usage {
            input_tokens,
            output_tokens,
            cost_usd,
        } => {
            counters.input_tokens += input_tokens;
            counters.output_tokens += output_tokens;
            counters.cost_usd += cost_usd;
            None
        }
        SessionEvent::SessionComplete { summary } => Some(Driven::Completed(summary)),
        SessionEvent::SessionError { message } => {
            Some(match tracker.critical_error("agent reported an error", &message) {
                Some(escalation) => Driven::Escalated(escalation),
                None => Driven::Failed(message),
            })
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Lowercase ASCII alphanumerics joined by single dashes
fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_helpers::{Script, ScriptedRunner, fast_config};

    fn setup(scripts: Vec<Script>) -> (Orchestrator, Arc<MemoryStore>, Arc<ScriptedRunner>) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new(store.clone(), scripts));
        let orch = Orchestrator::new(store.clone(), runner.clone(), fast_config());
        orch.create_project(NewProject {
            name: "Demo".into(),
            id: Some("p1".into()),
            ..Default::default()
        })
        .unwrap();
        (orch, store, runner)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Cool App!"), "my-cool-app");
        assert_eq!(slugify("  --x__y  "), "x-y");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn test_create_project_derives_id_and_rejects_duplicates() {
        let (orch, _, _) = setup(vec![]);
        let project = orch
            .create_project(NewProject {
                name: "Todo App".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(project.id, "todo-app");
        assert_eq!(project.phase, ProjectPhase::Uninitialized);

        let err = orch
            .create_project(NewProject {
                name: "Todo App".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_initialization_builds_roadmap_and_goes_ready() {
        let (orch, store, runner) = setup(vec![Script::new().build_roadmap(1, 2).complete()]);
        let report = orch.start_initialization("p1", false).await.unwrap();

        assert_eq!(report.report.end, SessionEnd::Completed);
        assert_eq!(report.phase, ProjectPhase::Ready);
        assert_eq!(report.report.session.session_number, 0);
        assert_eq!(store.snapshot().unwrap().progress("p1").total_tasks, 2);

        let launches = runner.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].session_type, SessionType::Initializer);
        assert!(launches[0].prompt.contains("Demo"));
    }

    #[tokio::test]
    async fn test_initialization_without_roadmap_returns_to_uninitialized() {
        let (orch, _, _) = setup(vec![Script::new().complete()]);
        let report = orch.start_initialization("p1", false).await.unwrap();
        assert_eq!(report.phase, ProjectPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_crashed_initializer_rolls_back() {
        let (orch, store, _) = setup(vec![Script::new().build_roadmap(2, 2).crash()]);
        let report = orch.start_initialization("p1", false).await.unwrap();

        assert!(matches!(report.report.end, SessionEnd::Interrupted { .. }));
        assert_eq!(report.phase, ProjectPhase::Uninitialized);
        // 2 epics, 4 tasks, 4 tests
        assert_eq!(report.rows_rolled_back, 10);
        assert!(!store.snapshot().unwrap().is_initialized("p1"));
        assert_eq!(store.snapshot().unwrap().interventions().count(), 0);
    }

    #[tokio::test]
    async fn test_already_initialized_unless_forced() {
        let (orch, store, _) = setup(vec![
            Script::new().build_roadmap(1, 1).complete(),
            Script::new().build_roadmap(1, 3).complete(),
        ]);
        orch.start_initialization("p1", false).await.unwrap();

        let err = orch.start_initialization("p1", false).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized(_)));

        let report = orch.start_initialization("p1", true).await.unwrap();
        assert_eq!(report.phase, ProjectPhase::Ready);
        assert_eq!(store.snapshot().unwrap().progress("p1").total_tasks, 3);
    }

    #[tokio::test]
    async fn test_coding_loop_requires_roadmap() {
        let (orch, _, _) = setup(vec![]);
        let err = orch.start_coding_loop("p1", None).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_usage_and_tool_counts_are_recorded() {
        let (orch, _, _) = setup(vec![
            Script::new().build_roadmap(1, 1).complete(),
            Script::new()
                .tool_use("Bash")
                .tool_error("Bash", "exit status 1")
                .usage(100, 20, 0.5)
                .complete_next_task()
                .complete(),
        ]);
        orch.start_initialization("p1", false).await.unwrap();
        let summary = orch.start_coding_loop("p1", None).await.unwrap();

        assert_eq!(summary.exit, LoopExit::Complete);
        let metrics = &summary.sessions[0].session.metrics;
        assert_eq!(metrics.tool_calls, 1);
        assert_eq!(metrics.tool_errors, 1);
        assert_eq!(metrics.input_tokens, 100);
        assert_eq!(metrics.output_tokens, 20);
        assert_eq!(metrics.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_reset_refused_while_paused() {
        let (orch, _, _) = setup(vec![
            Script::new().build_roadmap(1, 1).complete(),
            Script::new().session_error("Invalid API key"),
        ]);
        orch.start_initialization("p1", false).await.unwrap();
        let summary = orch.start_coding_loop("p1", None).await.unwrap();
        assert_eq!(summary.exit, LoopExit::Blocked);

        let err = orch.reset("p1", false).unwrap_err();
        assert!(matches!(err, Error::AlreadyPaused { .. }));
    }

    #[test]
    fn test_prompt_placeholders() {
        let (orch, _, _) = setup(vec![]);
        let project = Project::new("p9", "Nine");
        let session = Session::new("p9", 3, SessionType::Coding, "sonnet");
        let prompt = orch.prompt_for(&project, &session);
        assert!(prompt.contains("Nine"));
        assert!(prompt.contains("p9"));
        assert!(!prompt.contains("{project_id}"));
    }
}
