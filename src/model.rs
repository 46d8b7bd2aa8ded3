//! Data model for projects, roadmaps, sessions and interventions.
//!
//! Every persisted row is a [`Record`] tagged by `kind`; a [`Ledger`] holds
//! the full set and answers the queries the orchestration core needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Free-form structured context (blocker info, retry stats).
pub type Document = Map<String, Value>;

/// Generate a short random id with the given prefix, e.g. `sess-1f2e3d4c`.
pub fn new_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..8])
}

/// A log entry for tracking progress/notes on a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Docker,
    #[default]
    Local,
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxMode::Docker),
            "local" => Ok(SandboxMode::Local),
            other => Err(format!("unknown sandbox mode '{}' (expected docker or local)", other)),
        }
    }
}

/// Mutable per-project settings. `None` falls back to config defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 0 or absent means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Orchestrator phase of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Coding,
    Blocked,
    Complete,
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectPhase::Uninitialized => "UNINITIALIZED",
            ProjectPhase::Initializing => "INITIALIZING",
            ProjectPhase::Ready => "READY",
            ProjectPhase::Coding => "CODING",
            ProjectPhase::Blocked => "BLOCKED",
            ProjectPhase::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopMode {
    Immediate,
    AfterCurrent,
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopMode::Immediate => f.write_str("immediate"),
            StopMode::AfterCurrent => f.write_str("after-current"),
        }
    }
}

impl FromStr for StopMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(StopMode::Immediate),
            "after-current" | "after_current" => Ok(StopMode::AfterCurrent),
            other => Err(format!("unknown stop mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sandbox: SandboxMode,
    #[serde(default)]
    pub settings: ProjectSettings,
    #[serde(default)]
    pub phase: ProjectPhase,
    /// Pending stop request, consulted by the coding loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_requested: Option<StopMode>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<LogEntry>,
}

impl Project {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            sandbox: SandboxMode::default(),
            settings: ProjectSettings::default(),
            phase: ProjectPhase::Uninitialized,
            stop_requested: None,
            created_at: Utc::now(),
            log: vec![],
        }
    }

    pub fn push_log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            actor: None,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: u32,
    /// Session that created this row (None = operator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_in_session: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub epic_id: String,
    pub description: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_in_session: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    pub description: String,
    /// None = not yet run
    #[serde(default)]
    pub passes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_in_session: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Initializer,
    Coding,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Initializer => f.write_str("initializer"),
            SessionType::Coding => f.write_str("coding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Interrupted,
}

impl SessionStatus {
    /// Pending and running sessions count against the one-per-project limit
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionMetrics {
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub tool_errors: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    /// Tasks that flipped to done during the session
    #[serde(default)]
    pub tasks_completed: u32,
    /// Tests that flipped to passing during the session
    #[serde(default)]
    pub tests_passing: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    /// 0 = initializer, 1..N = coding
    pub session_number: u32,
    pub session_type: SessionType,
    pub model: String,
    #[serde(default)]
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Last persisted heartbeat (any agent event)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Kernel start time of `pid`, so a recycled pid is never mistaken for ours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption_reason: Option<String>,
    #[serde(default)]
    pub metrics: SessionMetrics,
}

impl Session {
    pub fn new(project_id: &str, session_number: u32, session_type: SessionType, model: &str) -> Self {
        Self {
            id: new_id("sess"),
            project_id: project_id.to_string(),
            session_number,
            session_type,
            model: model.to_string(),
            status: SessionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_event_at: None,
            pid: None,
            pid_start_time: None,
            error_message: None,
            interruption_reason: None,
            metrics: SessionMetrics::default(),
        }
    }

    /// Most recent sign of life: heartbeat, else start, else creation
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_event_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PauseType {
    RetryLimit,
    CriticalError,
    Timeout,
    Manual,
}

impl fmt::Display for PauseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PauseType::RetryLimit => "retry_limit",
            PauseType::CriticalError => "critical_error",
            PauseType::Timeout => "timeout",
            PauseType::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A durable pause record awaiting human resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: String,
    pub session_id: String,
    pub project_id: String,
    pub pause_reason: String,
    pub pause_type: PauseType,
    pub paused_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    #[serde(default)]
    pub blocker_info: Document,
    #[serde(default)]
    pub retry_stats: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub can_auto_resume: bool,
}

/// Record kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Project,
    Epic,
    Task,
    Test,
    Session,
    Intervention,
}

/// One persisted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Project(Project),
    Epic(Epic),
    Task(Task),
    Test(Test),
    Session(Session),
    Intervention(Intervention),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Project(p) => &p.id,
            Record::Epic(e) => &e.id,
            Record::Task(t) => &t.id,
            Record::Test(t) => &t.id,
            Record::Session(s) => &s.id,
            Record::Intervention(i) => &i.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Project(_) => RecordKind::Project,
            Record::Epic(_) => RecordKind::Epic,
            Record::Task(_) => RecordKind::Task,
            Record::Test(_) => RecordKind::Test,
            Record::Session(_) => RecordKind::Session,
            Record::Intervention(_) => RecordKind::Intervention,
        }
    }
}

/// Roadmap completion counts for one project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct Progress {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub total_tests: usize,
    pub passing_tests: usize,
    pub failing_tests: usize,
}

impl Progress {
    /// `completed_tasks == total_tasks` over a non-empty roadmap
    pub fn is_complete(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks == self.total_tasks
    }
}

/// The full contents of the task store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    projects: BTreeMap<String, Project>,
    epics: BTreeMap<String, Epic>,
    tasks: BTreeMap<String, Task>,
    tests: BTreeMap<String, Test>,
    sessions: BTreeMap<String, Session>,
    interventions: BTreeMap<String, Intervention>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record by id
    pub fn insert(&mut self, record: Record) {
        match record {
            Record::Project(p) => {
                self.projects.insert(p.id.clone(), p);
            }
            Record::Epic(e) => {
                self.epics.insert(e.id.clone(), e);
            }
            Record::Task(t) => {
                self.tasks.insert(t.id.clone(), t);
            }
            Record::Test(t) => {
                self.tests.insert(t.id.clone(), t);
            }
            Record::Session(s) => {
                self.sessions.insert(s.id.clone(), s);
            }
            Record::Intervention(i) => {
                self.interventions.insert(i.id.clone(), i);
            }
        }
    }

    pub fn contains(&self, kind: RecordKind, id: &str) -> bool {
        match kind {
            RecordKind::Project => self.projects.contains_key(id),
            RecordKind::Epic => self.epics.contains_key(id),
            RecordKind::Task => self.tasks.contains_key(id),
            RecordKind::Test => self.tests.contains_key(id),
            RecordKind::Session => self.sessions.contains_key(id),
            RecordKind::Intervention => self.interventions.contains_key(id),
        }
    }

    /// All rows in a stable order (projects first, interventions last)
    pub fn records(&self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.projects.values().cloned().map(Record::Project));
        out.extend(self.epics.values().cloned().map(Record::Epic));
        out.extend(self.tasks.values().cloned().map(Record::Task));
        out.extend(self.tests.values().cloned().map(Record::Test));
        out.extend(self.sessions.values().cloned().map(Record::Session));
        out.extend(self.interventions.values().cloned().map(Record::Intervention));
        out
    }

    pub fn len(&self) -> usize {
        self.projects.len()
            + self.epics.len()
            + self.tasks.len()
            + self.tests.len()
            + self.sessions.len()
            + self.interventions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- projects --

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn project_or_err(&self, id: &str) -> Result<&Project> {
        self.projects
            .get(id)
            .ok_or_else(|| Error::not_found("project", id))
    }

    pub fn project_mut_or_err(&mut self, id: &str) -> Result<&mut Project> {
        self.projects
            .get_mut(id)
            .ok_or_else(|| Error::not_found("project", id))
    }

    // -- roadmap --

    pub fn epic(&self, id: &str) -> Option<&Epic> {
        self.epics.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn test(&self, id: &str) -> Option<&Test> {
        self.tests.get(id)
    }

    pub fn test_mut(&mut self, id: &str) -> Option<&mut Test> {
        self.tests.get_mut(id)
    }

    pub fn epics_for<'a>(&'a self, project_id: &str) -> impl Iterator<Item = &'a Epic> {
        self.epics.values().filter(move |e| e.project_id == project_id)
    }

    pub fn tasks_for<'a>(&'a self, project_id: &str) -> impl Iterator<Item = &'a Task> {
        self.tasks.values().filter(move |t| t.project_id == project_id)
    }

    pub fn tests_for<'a>(&'a self, project_id: &str) -> impl Iterator<Item = &'a Test> {
        self.tests.values().filter(move |t| t.project_id == project_id)
    }

    pub fn tests_for_task<'a>(&'a self, task_id: &str) -> impl Iterator<Item = &'a Test> {
        self.tests.values().filter(move |t| t.task_id == task_id)
    }

    pub fn tasks_for_mut<'a>(
        &'a mut self,
        project_id: &'a str,
    ) -> impl Iterator<Item = &'a mut Task> + 'a {
        self.tasks
            .values_mut()
            .filter(move |t| t.project_id == project_id)
    }

    pub fn tests_for_mut<'a>(
        &'a mut self,
        project_id: &'a str,
    ) -> impl Iterator<Item = &'a mut Test> + 'a {
        self.tests
            .values_mut()
            .filter(move |t| t.project_id == project_id)
    }

    /// Remove roadmap rows matching a predicate, returning how many went
    pub fn retain_roadmap<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, Option<&str>) -> bool,
    {
        let before = self.epics.len() + self.tasks.len() + self.tests.len();
        self.epics
            .retain(|_, e| keep(&e.project_id, e.created_in_session.as_deref()));
        self.tasks
            .retain(|_, t| keep(&t.project_id, t.created_in_session.as_deref()));
        self.tests
            .retain(|_, t| keep(&t.project_id, t.created_in_session.as_deref()));
        before - (self.epics.len() + self.tasks.len() + self.tests.len())
    }

    /// A project is initialized once its roadmap has any epic or task
    pub fn is_initialized(&self, project_id: &str) -> bool {
        self.epics_for(project_id).next().is_some() || self.tasks_for(project_id).next().is_some()
    }

    pub fn progress(&self, project_id: &str) -> Progress {
        let mut progress = Progress::default();
        for task in self.tasks_for(project_id) {
            progress.total_tasks += 1;
            if task.done {
                progress.completed_tasks += 1;
            }
        }
        for test in self.tests_for(project_id) {
            progress.total_tests += 1;
            match test.passes {
                Some(true) => progress.passing_tests += 1,
                Some(false) => progress.failing_tests += 1,
                None => {}
            }
        }
        progress
    }

    // -- sessions --

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_or_err(&self, id: &str) -> Result<&Session> {
        self.sessions
            .get(id)
            .ok_or_else(|| Error::not_found("session", id))
    }

    pub fn session_mut_or_err(&mut self, id: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found("session", id))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Sessions of a project, oldest first
    pub fn sessions_for(&self, project_id: &str) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.project_id == project_id)
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.session_number.cmp(&b.session_number))
        });
        sessions
    }

    /// The pending/running session of a project, if any
    pub fn active_session(&self, project_id: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.project_id == project_id && s.status.is_active())
    }

    /// Active sessions whose last sign of life is before `older_than`
    pub fn stale_active_sessions(&self, older_than: DateTime<Utc>) -> Vec<&Session> {
        self.sessions
            .values()
            .filter(|s| s.status.is_active() && s.last_activity() < older_than)
            .collect()
    }

    pub fn latest_session(&self, project_id: &str) -> Option<&Session> {
        self.sessions_for(project_id).into_iter().last()
    }

    /// Next coding session number (coding sessions start at 1)
    pub fn next_session_number(&self, project_id: &str) -> u32 {
        self.sessions
            .values()
            .filter(|s| s.project_id == project_id && s.session_type == SessionType::Coding)
            .map(|s| s.session_number)
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    // -- interventions --

    pub fn intervention(&self, id: &str) -> Option<&Intervention> {
        self.interventions.get(id)
    }

    pub fn intervention_mut(&mut self, id: &str) -> Option<&mut Intervention> {
        self.interventions.get_mut(id)
    }

    pub fn interventions(&self) -> impl Iterator<Item = &Intervention> {
        self.interventions.values()
    }

    pub fn unresolved_for_session(&self, session_id: &str) -> Option<&Intervention> {
        self.interventions
            .values()
            .find(|i| i.session_id == session_id && !i.resolved)
    }

    pub fn unresolved_for_project(&self, project_id: &str) -> Vec<&Intervention> {
        self.interventions
            .values()
            .filter(|i| i.project_id == project_id && !i.resolved)
            .collect()
    }

    // -- checked mutations, meant to run inside one store transaction --

    /// Insert a session, enforcing at most one active session per project
    pub fn insert_session_exclusive(&mut self, session: Session) -> Result<()> {
        if let Some(active) = self.active_session(&session.project_id) {
            return Err(Error::AlreadyRunning {
                project_id: session.project_id.clone(),
                session_id: active.id.clone(),
            });
        }
        self.insert(Record::Session(session));
        Ok(())
    }

    /// Terminate a session. Already-terminal sessions are left untouched
    /// and `false` is returned.
    pub fn finish_session(
        &mut self,
        id: &str,
        status: SessionStatus,
        detail: Option<String>,
    ) -> Result<bool> {
        let session = self.session_mut_or_err(id)?;
        if session.status.is_terminal() {
            return Ok(false);
        }
        session.status = status;
        session.ended_at = Some(Utc::now());
        match status {
            SessionStatus::Error => session.error_message = detail,
            SessionStatus::Interrupted => session.interruption_reason = detail,
            _ => {}
        }
        Ok(true)
    }

    /// Insert an intervention unless the session already has an unresolved
    /// one, which is returned instead.
    pub fn insert_intervention_unique(&mut self, intervention: Intervention) -> (Intervention, bool) {
        if let Some(existing) = self.unresolved_for_session(&intervention.session_id) {
            return (existing.clone(), false);
        }
        self.insert(Record::Intervention(intervention.clone()));
        (intervention, true)
    }

    pub fn resolve_intervention(
        &mut self,
        id: &str,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<Intervention> {
        let intervention = self
            .interventions
            .get_mut(id)
            .ok_or_else(|| Error::not_found("intervention", id))?;
        if intervention.resolved {
            return Err(Error::AlreadyResolved(id.to_string()));
        }
        intervention.resolved = true;
        intervention.resolved_at = Some(Utc::now());
        intervention.resolved_by = Some(resolved_by.to_string());
        intervention.resolution_notes = notes;
        Ok(intervention.clone())
    }
}
