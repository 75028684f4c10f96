//! Container runtime collaborator.
//!
//! The executor and scorer talk to the container engine through the
//! [`ContainerRuntime`] trait so their lifecycle logic can be exercised
//! against a scripted runtime in tests. [`DockerRuntime`] is the
//! production implementation on top of bollard.

pub mod docker;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;

pub use docker::DockerRuntime;

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Unique name for the container.
    pub name: String,
    /// Image to create the container from.
    pub image: String,
    /// Command to run; empty means the image default.
    pub cmd: Vec<String>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts in `host:container` form.
    pub binds: Vec<String>,
    /// Network mode or network name to attach to.
    pub network_mode: Option<String>,
    /// Memory ceiling in bytes; `None` leaves the engine default.
    pub memory_bytes: Option<i64>,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the command to run.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, var: impl Into<String>) -> Self {
        self.env.push(var.into());
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a bind mount.
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Sets the network mode or network name.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Sets the memory ceiling in bytes.
    pub fn with_memory_bytes(mut self, bytes: i64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }
}

/// Output of a command executed inside a running container.
///
/// A command that cannot finish (timeout) is reported with exit code `-1`
/// and a diagnostic on stderr, not as an `Err`: to the caller it is a
/// command that did not pass.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Terminal state of a waited-on container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerExit {
    /// Process exit code reported by the engine.
    pub status_code: i64,
    /// Whether the kernel killed the container for exceeding its memory
    /// ceiling.
    pub oom_killed: bool,
}

impl ContainerExit {
    pub fn success(&self) -> bool {
        self.status_code == 0 && !self.oom_killed
    }
}

/// Interface to the container engine.
///
/// All methods are fallible; implementations translate engine-specific
/// failures into [`RuntimeError`] variants so callers can distinguish an
/// unreachable daemon from a missing container from a name conflict.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verifies the engine is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Whether an image exists locally. Never pulls.
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Creates the named network if it does not already exist.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its id.
    ///
    /// A name collision maps to [`RuntimeError::Conflict`].
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Blocks until the container stops and reports how it exited.
    async fn wait_container(&self, id: &str) -> Result<ContainerExit, RuntimeError>;

    /// Runs a command inside a running container, bounded by `timeout`.
    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Combined stdout/stderr logs of a container.
    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Force-kills a running container.
    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Removes a container, force-killing it if still running.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
