//! Caller-facing errors of lifecycle operations.

use crate::{
    pool::PoolError,
    runner::SupervisorError,
    state::StateError,
    workspace::WorkspaceError,
};

/// Coarse classification of a [`HarnessError`], stable for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input.
    InvalidRequest,
    /// Name collision on create or workspace rename.
    AlreadyExists,
    /// Unknown project, run or file.
    NotFound,
    /// Start requested for a run that is already running.
    AlreadyRunning,
    /// The pool cannot satisfy a device request.
    InsufficientResources,
    /// The process could not be spawned.
    LaunchFailed,
    /// Hard failure killing a process (distinct from it being already gone).
    TerminationFailed,
    /// Edit target name is taken.
    Conflict,
    /// Non-local failure (disk, permissions, corrupt manifest), surfaced unchanged.
    Io,
}

/// Errors returned by [`RunController`](crate::lifecycle::RunController).
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("run {0} is already running")]
    AlreadyRunning(String),
    #[error("requested {requested} device(s), but only {available} available")]
    InsufficientResources { requested: u32, available: usize },
    #[error("failed to launch run {run}: {source}")]
    LaunchFailed {
        run: String,
        #[source]
        source: SupervisorError,
    },
    #[error("failed to terminate run {run}: {source}")]
    TerminationFailed {
        run: String,
        #[source]
        source: SupervisorError,
    },
    #[error("run name {0} is already taken")]
    Conflict(String),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to scan {0}: {1}")]
    Scan(std::path::PathBuf, std::io::Error),
}

impl HarnessError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            Self::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            Self::TerminationFailed { .. } => ErrorKind::TerminationFailed,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Workspace(e) => match e {
                WorkspaceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                WorkspaceError::NotFound(_) => ErrorKind::NotFound,
                WorkspaceError::NotAllowed(_) => ErrorKind::InvalidRequest,
                WorkspaceError::Config(..) | WorkspaceError::Io(..) => ErrorKind::Io,
            },
            Self::State(_) | Self::Scan(..) => ErrorKind::Io,
        }
    }
}

impl From<PoolError> for HarnessError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::ZeroRequest => Self::InvalidRequest(e.to_string()),
            PoolError::Insufficient {
                requested,
                available,
            } => Self::InsufficientResources {
                requested,
                available,
            },
        }
    }
}
