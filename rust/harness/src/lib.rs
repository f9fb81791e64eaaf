#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

//! Edge Training Harness
//!
//! Creates isolated run workspaces, hands out accelerator devices, launches
//! and kills training processes, and keeps each project's run manifest
//! consistent with what is actually running.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod runner;
pub mod state;
pub mod workspace;

pub use config::{HarnessConfig, HarnessSettings};
pub use error::{ErrorKind, HarnessError};
pub use lifecycle::{CreateRun, EditRun, ProjectKey, RunController, StartedRun, StopOutcome};
pub use pool::AcceleratorPool;
pub use runner::Supervisor;
pub use state::{ManifestStore, RunRecord, RunStatus};
pub use workspace::WorkspaceBuilder;
