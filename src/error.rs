use std::process::ExitCode;

use crate::store::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the orchestration core.
///
/// The variants double as the response codes of the control surface, so
/// each has a stable [`Error::kind`] name and exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("project '{project_id}' already has an active session ({session_id})")]
    AlreadyRunning {
        project_id: String,
        session_id: String,
    },

    #[error("project '{0}' already has a roadmap; pass --force to re-initialize")]
    AlreadyInitialized(String),

    #[error("project '{0}' has no roadmap yet; run initialization first")]
    NotInitialized(String),

    #[error("session '{session_id}' is paused by intervention '{intervention_id}'")]
    AlreadyPaused {
        session_id: String,
        intervention_id: String,
    },

    #[error("intervention '{0}' is already resolved")]
    AlreadyResolved(String),

    #[error("cannot {operation} project '{project_id}' while it is {phase}")]
    InvalidPhase {
        project_id: String,
        phase: String,
        operation: &'static str,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("failed to launch agent: {0}")]
    Launch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable name used in JSON responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyRunning { .. } => "AlreadyRunning",
            Error::AlreadyInitialized(_) => "AlreadyInitialized",
            Error::NotInitialized(_) => "NotInitialized",
            Error::AlreadyPaused { .. } => "AlreadyPaused",
            Error::AlreadyResolved(_) => "AlreadyResolved",
            Error::InvalidPhase { .. } => "InvalidPhase",
            Error::InvalidState(_) => "InvalidState",
            Error::Launch(_) => "Launch",
            Error::Config(_) => "Config",
            Error::Store(_) => "Store",
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::NotFound { .. } => ExitCode::from(3),
            Error::AlreadyRunning { .. } => ExitCode::from(4),
            Error::AlreadyInitialized(_) => ExitCode::from(5),
            Error::NotInitialized(_) => ExitCode::from(6),
            Error::AlreadyPaused { .. } => ExitCode::from(7),
            Error::AlreadyResolved(_) => ExitCode::from(8),
            Error::InvalidPhase { .. } | Error::InvalidState(_) => ExitCode::from(9),
            Error::Launch(_) => ExitCode::from(10),
            Error::Config(_) => ExitCode::from(2),
            Error::Store(_) => ExitCode::from(1),
        }
    }
}
