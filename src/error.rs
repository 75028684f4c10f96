//! Error types for the sandbox harness.
//!
//! One enum per subsystem:
//! - Workspace provisioning (clone/checkout)
//! - Container runtime operations
//! - Evaluation run state machine
//! - Dataset loading
//! - Sandbox provisioning

use thiserror::Error;

use crate::record::SandboxStatus;

/// Errors raised while materializing a repository checkout for a run.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid repository locator '{locator}': {reason}")]
    InvalidRepo { locator: String, reason: String },

    #[error("invalid git ref '{git_ref}': {reason}")]
    InvalidRef { git_ref: String, reason: String },

    #[error("failed to clone '{repo}' for commit {commit}: {detail}")]
    Clone {
        repo: String,
        commit: String,
        detail: String,
    },

    #[error("failed to check out {commit} in clone of '{repo}': {detail}")]
    Checkout {
        repo: String,
        commit: String,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the container runtime collaborator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("resource already exists: {0}")]
    Conflict(String),

    #[error("failed to {op} container '{id}': {message}")]
    Container {
        op: &'static str,
        id: String,
        message: String,
    },

    #[error("network operation failed for '{name}': {message}")]
    Network { name: String, message: String },

    #[error("exec in container '{id}' failed: {message}")]
    Exec { id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Violations of the evaluation run state machine.
///
/// A run only moves forward along
/// `started -> sandbox_created -> patch_generated -> eval_started -> result_scored`,
/// one status at a time, or diverts once to `cancelled`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("status cannot move backwards from '{from}' to '{to}'")]
    Regression { from: SandboxStatus, to: SandboxStatus },

    #[error("transition from '{from}' to '{to}' skips '{expected}'")]
    Skipped {
        from: SandboxStatus,
        to: SandboxStatus,
        expected: SandboxStatus,
    },

    #[error("run is already terminal at '{status}'")]
    Terminal { status: SandboxStatus },

    #[error("'{to}' is not reachable by a forward transition")]
    NotForward { to: SandboxStatus },
}

/// Errors raised while loading benchmark problems.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to parse problem record at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("instance '{0}' not found in dataset")]
    InstanceNotFound(String),

    #[error("dataset contains no problems")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while establishing the isolated execution context.
///
/// All of these are fatal to the run: without an isolated environment the
/// agent must not execute. The run stays at `started` with its `error`
/// field recorded.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("required image '{0}' is missing")]
    ImageMissing(String),

    #[error("failed to prepare sandbox network: {0}")]
    Network(String),

    #[error("failed to stage sandbox directory: {0}")]
    Stage(String),

    #[error("failed to create sandbox container: {0}")]
    Create(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
