pub mod config;
pub mod error;
pub mod intervention;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod roadmap;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod tracker;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use config::{Config, LogConfig, LogFormat};
pub use error::{Error, Result};
pub use intervention::{InterventionManager, PauseOutcome, PauseRequest, can_auto_resume};
pub use model::{
    Epic, Intervention, Ledger, PauseType, Progress, Project, ProjectPhase, SandboxMode, Session,
    SessionStatus, SessionType, StopMode, Task, Test,
};
pub use orchestrator::{
    LoopExit, LoopSummary, NewProject, Orchestrator, ProjectStatus, SessionEnd, SessionReport,
    StopOutcome,
};
pub use service::{
    CommandRunner, LaunchRequest, ProcessHandle, ProcessRegistry, SessionEvent, SessionRunner,
};
pub use store::{FileStore, MemoryStore, StoreError, StoreExt, TaskStore};
pub use sweeper::{SweepReport, Sweeper};
pub use tracker::{Escalation, Tracker, Verdict};
