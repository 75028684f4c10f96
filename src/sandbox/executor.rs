//! The executor: drives one evaluation run inside an isolated container.
//!
//! A [`Sandbox`] owns exactly one [`EvaluationRun`] end to end. It is the
//! only component that advances the run forward, and it treats the agent
//! as hostile: the execution boundary converts every failure mode —
//! timeout, memory kill, crash, malformed output — into a value-typed
//! [`AgentResult`] rather than letting an error escape into orchestration
//! code that manages a stateful record.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataset::SwebenchProblem;
use crate::error::{ProvisionError, RuntimeError};
use crate::policy::{self, ResourcePolicy};
use crate::record::{EvaluationRun, SandboxStatus};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::sandbox::exchange::{AgentOutput, AgentResult, SandboxInput};

/// Captured logs are capped at this many characters.
const MAX_LOG_CHARS: usize = 10_000;

/// How an attempted agent execution went wrong, internally.
enum AgentFailure {
    /// Cancellation was observed at a checkpoint; the run is `cancelled`.
    Cancelled,
    /// Any other failure; the run is driven to a terminal error state.
    Failed(String),
}

/// Isolated execution context for one evaluation run.
pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    policy: ResourcePolicy,
    /// Host directory bind-mounted at the fixed in-container root.
    sandbox_dir: PathBuf,
    /// Host path of the agent artifact.
    agent_path: PathBuf,
    problem: SwebenchProblem,
    /// The run this sandbox drives. Public so the scorer can finish it.
    pub run: EvaluationRun,
    cancel: CancellationToken,
    container_id: Option<String>,
}

impl Sandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: ResourcePolicy,
        sandbox_dir: impl Into<PathBuf>,
        agent_path: impl Into<PathBuf>,
        problem: SwebenchProblem,
        run: EvaluationRun,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            policy,
            sandbox_dir: sandbox_dir.into(),
            agent_path: agent_path.into(),
            problem,
            run,
            cancel,
            container_id: None,
        }
    }

    pub fn problem(&self) -> &SwebenchProblem {
        &self.problem
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Establishes the isolated execution context.
    ///
    /// On success the run advances to `sandbox_created`. On failure the run
    /// stays at `started` with its `error` recorded: without isolation the
    /// agent must not execute, so every failure here is fatal to the run.
    pub async fn provision(&mut self) -> Result<(), ProvisionError> {
        if let Err(e) = self.runtime.ping().await {
            self.run.record_error(format!("container runtime unreachable: {e}"));
            return Err(ProvisionError::RuntimeUnreachable(e.to_string()));
        }

        for image in [
            self.policy.sandbox_image.clone(),
            self.policy.proxy_image.clone(),
        ] {
            match self.runtime.image_present(&image).await {
                Ok(true) => {}
                Ok(false) => {
                    self.run
                        .record_error(format!("required image '{image}' is missing"));
                    return Err(ProvisionError::ImageMissing(image));
                }
                Err(e) => {
                    self.run.record_error(format!(
                        "could not inspect image '{image}': {e}"
                    ));
                    return Err(ProvisionError::RuntimeUnreachable(e.to_string()));
                }
            }
        }

        if let Err(e) = self.ensure_proxy().await {
            self.run.record_error(e.to_string());
            return Err(e);
        }

        if let Err(e) = self.stage_sandbox_dir() {
            self.run.record_error(e.to_string());
            return Err(e);
        }

        let name = format!("sandbox-{}", self.run.run_id);
        let spec = ContainerSpec::new(&name, &self.policy.sandbox_image)
            .with_cmd(self.policy.agent_command.clone())
            .with_working_dir(policy::SANDBOX_DIR)
            .with_bind(format!(
                "{}:{}",
                self.sandbox_dir.display(),
                policy::SANDBOX_DIR
            ))
            .with_network_mode(&self.policy.network_name)
            .with_memory_bytes(self.policy.memory_bytes);

        let id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.run
                    .record_error(format!("failed to create sandbox container: {e}"));
                return Err(ProvisionError::Create(e.to_string()));
            }
        };
        self.container_id = Some(id);

        self.run.advance(SandboxStatus::SandboxCreated)?;
        info!(
            run_id = %self.run.run_id,
            instance_id = %self.problem.instance_id,
            container = %name,
            "Sandbox provisioned"
        );
        Ok(())
    }

    /// Executes the agent and collects its patch.
    ///
    /// Never returns an `Err` and never panics past this boundary: every
    /// exit path yields a well-formed [`AgentResult`]. On success the run
    /// holds the patch verbatim in `response` and sits at
    /// `patch_generated`; on failure the run is already terminal
    /// (`result_scored` with `solved = false`, or `cancelled`).
    pub async fn run_agent(&mut self) -> AgentResult {
        match self.try_run_agent().await {
            Ok(patch) => {
                self.run.response = Some(patch.clone());
                if let Err(e) = self.run.advance(SandboxStatus::PatchGenerated) {
                    let message = format!("run left in unexpected state: {e}");
                    self.run.finalize_error(message.as_str());
                    return AgentResult::error(message);
                }
                info!(
                    run_id = %self.run.run_id,
                    patch_bytes = patch.len(),
                    "Agent produced a patch"
                );
                AgentResult::ok(patch)
            }
            Err(AgentFailure::Cancelled) => {
                info!(run_id = %self.run.run_id, "Run cancelled during agent execution");
                AgentResult::error("evaluation run cancelled")
            }
            Err(AgentFailure::Failed(message)) => {
                warn!(run_id = %self.run.run_id, error = %message, "Agent execution failed");
                self.run.finalize_error(message.as_str());
                AgentResult::error(message)
            }
        }
    }

    /// Removes the agent container. Call once the run is finished.
    pub async fn teardown(&mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.runtime.remove_container(&id).await {
                warn!(container = %id, error = %e, "Failed to remove sandbox container");
            } else {
                debug!(container = %id, "Sandbox container removed");
            }
        }
    }

    async fn try_run_agent(&mut self) -> Result<String, AgentFailure> {
        let id = self
            .container_id
            .clone()
            .ok_or_else(|| AgentFailure::Failed("sandbox was not provisioned".to_string()))?;

        if self.cancel.is_cancelled() {
            self.abort_cancelled(&id).await;
            return Err(AgentFailure::Cancelled);
        }

        self.runtime
            .start_container(&id)
            .await
            .map_err(|e| AgentFailure::Failed(format!("failed to start agent container: {e}")))?;

        // The wait future holds no borrow of `self`, so the cancellation
        // branch below can clean up through `&mut self` afterwards.
        let cancel = self.cancel.clone();
        let runtime = self.runtime.clone();
        let timeout = self.policy.timeout();
        let waited = {
            let wait = tokio::time::timeout(timeout, runtime.wait_container(&id));
            tokio::select! {
                _ = cancel.cancelled() => None,
                waited = wait => Some(waited),
            }
        };

        let Some(waited) = waited else {
            self.abort_cancelled(&id).await;
            return Err(AgentFailure::Cancelled);
        };

        let exit = match waited {
            Err(_) => {
                self.kill_quietly(&id).await;
                self.capture_logs(&id).await;
                return Err(AgentFailure::Failed(format!(
                    "agent timed out after {}s",
                    self.policy.runtime_secs
                )));
            }
            Ok(Err(e)) => {
                self.capture_logs(&id).await;
                return Err(AgentFailure::Failed(format!(
                    "failed while waiting for agent container: {e}"
                )));
            }
            Ok(Ok(exit)) => exit,
        };

        self.capture_logs(&id).await;

        if exit.oom_killed || exit.status_code == 137 {
            return Err(AgentFailure::Failed(format!(
                "agent exceeded the memory ceiling ({} bytes) and was killed",
                self.policy.memory_bytes
            )));
        }
        if exit.status_code != 0 {
            return Err(AgentFailure::Failed(format!(
                "agent exited with code {}",
                exit.status_code
            )));
        }

        self.read_patch()
    }

    /// Reads the output exchange file left by the agent.
    ///
    /// Only a fully-written file is trusted: a missing file and unparsable
    /// JSON are distinct failures, both attributable to the agent.
    fn read_patch(&self) -> Result<String, AgentFailure> {
        let path = self.sandbox_dir.join(policy::OUTPUT_FILE);
        let raw = std::fs::read(&path).map_err(|_| {
            AgentFailure::Failed(format!(
                "agent produced no output file at {}",
                policy::SANDBOX_OUTPUT_FILE
            ))
        })?;
        let output: AgentOutput = serde_json::from_slice(&raw)
            .map_err(|e| AgentFailure::Failed(format!("malformed agent output: {e}")))?;
        Ok(output.patch)
    }

    /// Ensures the shared proxy sidecar and its network exist.
    ///
    /// The sidecar is shared by all concurrent runs, so a name conflict
    /// means another run already created it.
    async fn ensure_proxy(&self) -> Result<(), ProvisionError> {
        self.runtime
            .ensure_network(&self.policy.network_name)
            .await
            .map_err(|e| ProvisionError::Network(e.to_string()))?;

        let spec = ContainerSpec::new(&self.policy.proxy_container, &self.policy.proxy_image)
            .with_network_mode(&self.policy.network_name);
        match self.runtime.create_container(&spec).await {
            Ok(id) => {
                self.runtime
                    .start_container(&id)
                    .await
                    .map_err(|e| ProvisionError::Create(format!("proxy sidecar: {e}")))?;
                debug!(container = %self.policy.proxy_container, "Proxy sidecar started");
                Ok(())
            }
            Err(RuntimeError::Conflict(_)) => Ok(()),
            Err(e) => Err(ProvisionError::Create(format!("proxy sidecar: {e}"))),
        }
    }

    /// Stages the host side of the exchange layout: agent entry point,
    /// input file, repo checkout.
    fn stage_sandbox_dir(&self) -> Result<(), ProvisionError> {
        let repo_dir = self.sandbox_dir.join(policy::REPO_DIR);
        if !repo_dir.is_dir() {
            return Err(ProvisionError::Stage(format!(
                "workspace has no repository checkout at {}",
                repo_dir.display()
            )));
        }

        std::fs::copy(&self.agent_path, self.sandbox_dir.join(policy::MAIN_FILE)).map_err(
            |e| {
                ProvisionError::Stage(format!(
                    "could not copy agent artifact {}: {e}",
                    self.agent_path.display()
                ))
            },
        )?;

        let input = SandboxInput::for_run(&self.problem, self.run.run_id);
        let json = serde_json::to_vec_pretty(&input)
            .map_err(|e| ProvisionError::Stage(format!("could not encode input record: {e}")))?;

        // Written via temp file + rename so the agent can never observe a
        // half-written input record.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.sandbox_dir)?;
        tmp.write_all(&json)?;
        tmp.persist(self.sandbox_dir.join(policy::INPUT_FILE))
            .map_err(|e| ProvisionError::Stage(format!("could not place input record: {e}")))?;

        Ok(())
    }

    async fn abort_cancelled(&mut self, id: &str) {
        self.kill_quietly(id).await;
        self.capture_logs(id).await;
        let _ = self.run.cancel();
    }

    async fn kill_quietly(&self, id: &str) {
        match self.runtime.kill_container(id).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound { .. }) => {}
            Err(e) => warn!(container = %id, error = %e, "Failed to kill agent container"),
        }
    }

    async fn capture_logs(&mut self, id: &str) {
        match self.runtime.logs(id).await {
            Ok(logs) if !logs.is_empty() => {
                let truncated = truncate(&logs, MAX_LOG_CHARS);
                match &mut self.run.logs {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&truncated);
                    }
                    None => self.run.logs = Some(truncated),
                }
            }
            Ok(_) => {}
            Err(e) => debug!(container = %id, error = %e, "Could not capture container logs"),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.container_id.is_some() {
            warn!(run_id = %self.run.run_id, "Sandbox dropped without teardown");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long() {
        let out = truncate("0123456789abcdef", 10);
        assert!(out.starts_with("0123456789"));
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let out = truncate("日本語テキスト", 4);
        assert!(out.ends_with("[truncated]"));
    }
}
