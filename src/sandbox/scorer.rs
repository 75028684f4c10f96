//! Scoring: apply patches and classify test transitions.
//!
//! The scorer builds a fresh evaluation container from the pinned
//! workspace, applies the problem's test patch and the candidate patch,
//! and runs the four test-transition categories.
//!
//! Verdict rule: `solved` is true if and only if the fail-to-pass and
//! pass-to-pass categories both succeed. The pass-to-fail and
//! fail-to-fail categories are recorded but diagnostic only.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dataset::SwebenchProblem;
use crate::policy::{self, ResourcePolicy};
use crate::record::{EvaluationRun, SandboxStatus};
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Per-category results and the derived verdict for one scoring pass.
#[derive(Debug, Clone, Default)]
pub struct ScoredOutcome {
    pub fail_to_pass: Option<bool>,
    pub pass_to_pass: Option<bool>,
    pub pass_to_fail: Option<bool>,
    pub fail_to_fail: Option<bool>,
    pub solved: bool,
    pub error: Option<String>,
}

impl ScoredOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// What a test category expects of its commands after patching.
#[derive(Debug, Clone, Copy)]
enum Expect {
    /// Every command must exit zero.
    Pass,
    /// Every command must exit non-zero.
    Fail,
}

enum ScoreFailure {
    Cancelled,
    Failed(String),
}

/// Applies patches and evaluates the four test-transition categories.
pub struct Scorer {
    runtime: Arc<dyn ContainerRuntime>,
    policy: ResourcePolicy,
    cancel: CancellationToken,
}

impl Scorer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: ResourcePolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            policy,
            cancel,
        }
    }

    /// Scores `patch` against `problem` and finishes the run.
    ///
    /// Scoring failure — a patch that does not apply, a harness that
    /// cannot run — is a normal outcome: the run still reaches
    /// `result_scored`, with `solved = false` and `error` describing the
    /// cause. Only cancellation diverts the run elsewhere. Re-scoring the
    /// same (problem, patch, base commit) yields identical booleans: the
    /// evaluation container is rebuilt from the pinned checkout each time.
    pub async fn score(
        &self,
        run: &mut EvaluationRun,
        problem: &SwebenchProblem,
        sandbox_dir: &Path,
        patch: &str,
    ) -> ScoredOutcome {
        if self.cancel.is_cancelled() {
            let _ = run.cancel();
            return ScoredOutcome::failure("evaluation run cancelled");
        }

        if let Err(e) = run.advance(SandboxStatus::EvalStarted) {
            let message = format!("scoring attempted out of order: {e}");
            run.record_error(message.as_str());
            return ScoredOutcome::failure(message);
        }

        match self.run_categories(problem, sandbox_dir, patch).await {
            Ok(outcome) => {
                run.fail_to_pass_success = outcome.fail_to_pass;
                run.pass_to_pass_success = outcome.pass_to_pass;
                run.pass_to_fail_success = outcome.pass_to_fail;
                run.fail_to_fail_success = outcome.fail_to_fail;
                run.solved = Some(outcome.solved);
                if let Err(e) = run.advance(SandboxStatus::ResultScored) {
                    run.record_error(format!("could not finish run: {e}"));
                }
                info!(
                    run_id = %run.run_id,
                    solved = outcome.solved,
                    "Run scored"
                );
                outcome
            }
            Err(ScoreFailure::Cancelled) => {
                let _ = run.cancel();
                info!(run_id = %run.run_id, "Run cancelled during scoring");
                ScoredOutcome::failure("evaluation run cancelled")
            }
            Err(ScoreFailure::Failed(message)) => {
                warn!(run_id = %run.run_id, error = %message, "Scoring failed");
                run.record_error(message.as_str());
                run.solved = Some(false);
                let _ = run.advance(SandboxStatus::ResultScored);
                ScoredOutcome::failure(message)
            }
        }
    }

    /// Stages the patches, boots an evaluation container, and runs every
    /// category. The container is removed on all paths.
    async fn run_categories(
        &self,
        problem: &SwebenchProblem,
        sandbox_dir: &Path,
        patch: &str,
    ) -> Result<ScoredOutcome, ScoreFailure> {
        std::fs::write(sandbox_dir.join(policy::TEST_PATCH_FILE), &problem.test_patch)
            .map_err(|e| ScoreFailure::Failed(format!("could not stage test patch: {e}")))?;
        std::fs::write(sandbox_dir.join(policy::CANDIDATE_PATCH_FILE), patch)
            .map_err(|e| ScoreFailure::Failed(format!("could not stage candidate patch: {e}")))?;

        let name = format!("sandbox-eval-{}", Uuid::new_v4());
        let spec = ContainerSpec::new(&name, &self.policy.sandbox_image)
            .with_cmd(vec!["sleep".to_string(), "infinity".to_string()])
            .with_working_dir(policy::SANDBOX_REPO_DIR)
            .with_bind(format!("{}:{}", sandbox_dir.display(), policy::SANDBOX_DIR))
            .with_network_mode("none")
            .with_memory_bytes(self.policy.memory_bytes);

        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| ScoreFailure::Failed(format!("could not create eval container: {e}")))?;
        if let Err(e) = self.runtime.start_container(&id).await {
            let _ = self.runtime.remove_container(&id).await;
            return Err(ScoreFailure::Failed(format!(
                "could not start eval container: {e}"
            )));
        }
        debug!(container = %name, "Evaluation container ready");

        let result = self.apply_and_test(&id, problem, patch).await;

        if let Err(e) = self.runtime.remove_container(&id).await {
            warn!(container = %id, error = %e, "Failed to remove eval container");
        }

        result
    }

    async fn apply_and_test(
        &self,
        id: &str,
        problem: &SwebenchProblem,
        patch: &str,
    ) -> Result<ScoredOutcome, ScoreFailure> {
        // The agent had write access to the checkout, so re-pin it before
        // applying anything.
        let reset = self
            .sh(
                id,
                &format!(
                    "git checkout --force {} && git clean -fd",
                    problem.base_commit
                ),
            )
            .await?;
        if !reset.success() {
            return Err(ScoreFailure::Failed(format!(
                "could not reset checkout to {}: {}",
                problem.base_commit,
                reset.stderr.trim()
            )));
        }

        if !problem.test_patch.is_empty() {
            let applied = self
                .sh(
                    id,
                    &format!(
                        "git apply --whitespace=nowarn {}",
                        policy::SANDBOX_TEST_PATCH_FILE
                    ),
                )
                .await?;
            if !applied.success() {
                return Err(ScoreFailure::Failed(format!(
                    "test patch failed to apply: {}",
                    applied.stderr.trim()
                )));
            }
        }

        // An empty candidate patch means the agent produced no change;
        // there is nothing to apply, and the categories run against the
        // unmodified checkout.
        if !patch.is_empty() {
            let applied = self
                .sh(
                    id,
                    &format!(
                        "git apply --whitespace=nowarn {}",
                        policy::SANDBOX_CANDIDATE_PATCH_FILE
                    ),
                )
                .await?;
            if !applied.success() {
                return Err(ScoreFailure::Failed(format!(
                    "candidate patch failed to apply: {}",
                    applied.stderr.trim()
                )));
            }
        }

        let fail_to_pass = self.category(id, &problem.fail_to_pass, Expect::Pass).await?;
        let pass_to_pass = self.category(id, &problem.pass_to_pass, Expect::Pass).await?;
        let pass_to_fail = self.category(id, &problem.pass_to_fail, Expect::Fail).await?;
        let fail_to_fail = self.category(id, &problem.fail_to_fail, Expect::Fail).await?;

        Ok(ScoredOutcome {
            fail_to_pass: Some(fail_to_pass),
            pass_to_pass: Some(pass_to_pass),
            pass_to_fail: Some(pass_to_fail),
            fail_to_fail: Some(fail_to_fail),
            solved: fail_to_pass && pass_to_pass,
            error: None,
        })
    }

    /// Runs one category: true iff every command matched the expected
    /// transition. An empty category is vacuously successful.
    async fn category(
        &self,
        id: &str,
        commands: &[String],
        expect: Expect,
    ) -> Result<bool, ScoreFailure> {
        let mut all_matched = true;
        for command in commands {
            if self.cancel.is_cancelled() {
                return Err(ScoreFailure::Cancelled);
            }
            let output = self.sh(id, command).await?;
            let matched = match expect {
                Expect::Pass => output.success(),
                Expect::Fail => !output.success(),
            };
            debug!(command = %command, exit_code = output.exit_code, matched, "Test command finished");
            if !matched {
                all_matched = false;
            }
        }
        Ok(all_matched)
    }

    async fn sh(&self, id: &str, command: &str) -> Result<crate::runtime::ExecOutput, ScoreFailure> {
        let cmd = vec![
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.runtime
            .exec(id, &cmd, self.policy.timeout())
            .await
            .map_err(|e| ScoreFailure::Failed(format!("test command could not run: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scored_outcome_failure_defaults() {
        let outcome = ScoredOutcome::failure("patch failed to apply");
        assert!(!outcome.solved);
        assert!(outcome.fail_to_pass.is_none());
        assert!(outcome.error.unwrap().contains("patch"));
    }
}
