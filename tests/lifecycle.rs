//! End-to-end lifecycle tests against a scripted container runtime.
//!
//! These drive the executor and scorer through every distinct exit path —
//! success, unreachable runtime, timeout, memory kill, crash, missing and
//! malformed output, cancellation, patch-apply failure — and assert the
//! evaluation record's state machine obligations hold on each of them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swebox::dataset::SwebenchProblem;
use swebox::error::{ProvisionError, RuntimeError};
use swebox::policy::ResourcePolicy;
use swebox::record::{EvaluationRun, SandboxStatus};
use swebox::runtime::{ContainerExit, ContainerRuntime, ContainerSpec, ExecOutput};
use swebox::sandbox::{Sandbox, Scorer};

/// Scripted runtime: containers are names in a set, the agent "exits" with
/// a configured code after a configured delay, and exec results come from
/// substring rules.
struct MockRuntime {
    ping_ok: bool,
    images: Vec<String>,
    wait_delay: Duration,
    exit_code: i64,
    oom_killed: bool,
    logs: String,
    /// `(substring, exit_code)`; first match wins, default exit 0.
    exec_rules: Vec<(String, i64)>,
    containers: Mutex<HashSet<String>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            ping_ok: true,
            images: vec!["sandbox-image".to_string(), "sandbox-proxy-image".to_string()],
            wait_delay: Duration::ZERO,
            exit_code: 0,
            oom_killed: false,
            logs: "agent log line\n".to_string(),
            exec_rules: Vec::new(),
            containers: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.ping_ok {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("connection refused".to_string()))
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.images.iter().any(|i| i == image))
    }

    async fn ensure_network(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if !containers.insert(spec.name.clone()) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        Ok(spec.name.clone())
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.containers.lock().unwrap().contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::ContainerNotFound { id: id.to_string() })
        }
    }

    async fn wait_container(&self, _id: &str) -> Result<ContainerExit, RuntimeError> {
        tokio::time::sleep(self.wait_delay).await;
        Ok(ContainerExit {
            status_code: self.exit_code,
            oom_killed: self.oom_killed,
        })
    }

    async fn exec(
        &self,
        _id: &str,
        cmd: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        let line = cmd.join(" ");
        let exit_code = self
            .exec_rules
            .iter()
            .find(|(needle, _)| line.contains(needle))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("command failed: {line}")
            },
        })
    }

    async fn logs(&self, _id: &str) -> Result<String, RuntimeError> {
        Ok(self.logs.clone())
    }

    async fn kill_container(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }
}

fn problem() -> SwebenchProblem {
    SwebenchProblem {
        instance_id: "org__lib-1".to_string(),
        problem_statement: "the parser drops trailing newlines".to_string(),
        repo: "org/lib".to_string(),
        base_commit: "abc123".to_string(),
        test_patch: "diff --git a/tests/test_bug.py b/tests/test_bug.py".to_string(),
        fail_to_pass: vec!["pytest tests/test_bug.py".to_string()],
        pass_to_pass: vec!["pytest tests/test_existing.py".to_string()],
        pass_to_fail: vec![],
        fail_to_fail: vec![],
    }
}

fn policy() -> ResourcePolicy {
    ResourcePolicy::default().with_timeout_secs(1)
}

/// Stages a workspace the way the provisioner would leave it, plus an
/// agent artifact.
fn staged_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("repo")).unwrap();
    std::fs::write(dir.path().join("agent.py"), "print('agent')\n").unwrap();
    dir
}

fn write_agent_output(dir: &Path, patch: &str) {
    let body = serde_json::json!({ "patch": patch });
    std::fs::write(dir.join("output.json"), body.to_string()).unwrap();
}

fn sandbox_with(runtime: Arc<MockRuntime>, dir: &TempDir, cancel: CancellationToken) -> Sandbox {
    let run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
    Sandbox::new(
        runtime,
        policy(),
        dir.path(),
        dir.path().join("agent.py"),
        problem(),
        run,
        cancel,
    )
}

#[tokio::test]
async fn runtime_unreachable_leaves_run_at_started() {
    let runtime = Arc::new(MockRuntime {
        ping_ok: false,
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());

    let err = sandbox.provision().await.unwrap_err();
    assert!(matches!(err, ProvisionError::RuntimeUnreachable(_)));
    assert_eq!(sandbox.run.status, SandboxStatus::Started);
    assert!(sandbox.run.error.as_deref().unwrap().contains("unreachable"));
    assert!(sandbox.run.sandbox_created_at.is_none());
    assert!(sandbox.run.result_scored_at.is_none());
}

#[tokio::test]
async fn missing_image_is_fatal_before_sandbox_created() {
    let runtime = Arc::new(MockRuntime {
        images: vec!["sandbox-proxy-image".to_string()],
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());

    let err = sandbox.provision().await.unwrap_err();
    assert!(matches!(err, ProvisionError::ImageMissing(_)));
    assert_eq!(sandbox.run.status, SandboxStatus::Started);
}

#[tokio::test]
async fn successful_agent_reaches_patch_generated_with_verbatim_response() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let patch = "diff --git a/lib.py b/lib.py\n+fixed = True\n";
    write_agent_output(dir.path(), patch);

    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();
    assert_eq!(sandbox.run.status, SandboxStatus::SandboxCreated);

    let result = sandbox.run_agent().await;
    assert!(result.is_ok());
    assert_eq!(result.patch.as_deref(), Some(patch));
    assert_eq!(sandbox.run.status, SandboxStatus::PatchGenerated);
    assert_eq!(sandbox.run.response.as_deref(), Some(patch));
    assert!(sandbox.run.logs.is_some());
    sandbox.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn agent_timeout_yields_error_result_and_terminal_run() {
    let runtime = Arc::new(MockRuntime {
        wait_delay: Duration::from_secs(600),
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();

    let result = sandbox.run_agent().await;
    assert!(!result.is_ok());
    assert!(!result.solved);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    assert_eq!(sandbox.run.solved, Some(false));
    sandbox.teardown().await;
}

#[tokio::test]
async fn memory_kill_is_reported_distinctly() {
    let runtime = Arc::new(MockRuntime {
        exit_code: 137,
        oom_killed: true,
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();

    let result = sandbox.run_agent().await;
    assert!(result.error.as_deref().unwrap().contains("memory ceiling"));
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    sandbox.teardown().await;
}

#[tokio::test]
async fn agent_crash_is_reported_with_exit_code() {
    let runtime = Arc::new(MockRuntime {
        exit_code: 3,
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();

    let result = sandbox.run_agent().await;
    assert!(result.error.as_deref().unwrap().contains("exited with code 3"));
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    assert_eq!(sandbox.run.solved, Some(false));
    sandbox.teardown().await;
}

#[tokio::test]
async fn missing_output_file_is_an_execution_error() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();

    let result = sandbox.run_agent().await;
    assert!(result.error.as_deref().unwrap().contains("no output file"));
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    sandbox.teardown().await;
}

#[tokio::test]
async fn malformed_output_is_an_execution_error() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    std::fs::write(dir.path().join("output.json"), "{not json").unwrap();
    let mut sandbox = sandbox_with(runtime, &dir, CancellationToken::new());
    sandbox.provision().await.unwrap();

    let result = sandbox.run_agent().await;
    assert!(result.error.as_deref().unwrap().contains("malformed"));
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    sandbox.teardown().await;
}

#[tokio::test]
async fn cancellation_at_sandbox_created_ends_cancelled() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let cancel = CancellationToken::new();
    let mut sandbox = sandbox_with(runtime, &dir, cancel.clone());
    sandbox.provision().await.unwrap();

    cancel.cancel();
    let result = sandbox.run_agent().await;
    assert!(!result.is_ok());
    assert_eq!(sandbox.run.status, SandboxStatus::Cancelled);
    assert!(sandbox.run.cancelled_at.is_some());
    assert!(sandbox.run.patch_generated_at.is_none());
    assert!(sandbox.run.eval_started_at.is_none());
    assert!(sandbox.run.result_scored_at.is_none());
    sandbox.teardown().await;
}

#[tokio::test]
async fn full_lifecycle_solves_when_gating_categories_pass() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let patch = "diff --git a/lib.py b/lib.py\n+fixed\n";
    write_agent_output(dir.path(), patch);

    let cancel = CancellationToken::new();
    let mut sandbox = sandbox_with(runtime.clone(), &dir, cancel.clone());
    sandbox.provision().await.unwrap();
    let result = sandbox.run_agent().await;
    assert!(result.is_ok());

    let scorer = Scorer::new(runtime, policy(), cancel);
    let outcome = scorer
        .score(&mut sandbox.run, &problem(), dir.path(), patch)
        .await;

    assert_eq!(outcome.fail_to_pass, Some(true));
    assert_eq!(outcome.pass_to_pass, Some(true));
    assert!(outcome.solved);
    assert_eq!(sandbox.run.status, SandboxStatus::ResultScored);
    assert_eq!(sandbox.run.solved, Some(true));
    assert_eq!(sandbox.run.fail_to_pass_success, Some(true));

    // Every forward timestamp was stamped, in order.
    let stamps = [
        sandbox.run.started_at,
        sandbox.run.sandbox_created_at.unwrap(),
        sandbox.run.patch_generated_at.unwrap(),
        sandbox.run.eval_started_at.unwrap(),
        sandbox.run.result_scored_at.unwrap(),
    ];
    for pair in stamps.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert!(sandbox.run.cancelled_at.is_none());
    sandbox.teardown().await;
}

#[tokio::test]
async fn empty_patch_fails_fail_to_pass_and_is_not_solved() {
    // Base state: the bug's test still fails, existing tests pass.
    let runtime = Arc::new(MockRuntime {
        exec_rules: vec![("tests/test_bug.py".to_string(), 1)],
        ..Default::default()
    });
    let dir = staged_workspace();
    let cancel = CancellationToken::new();
    let mut run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
    run.advance(SandboxStatus::SandboxCreated).unwrap();
    run.advance(SandboxStatus::PatchGenerated).unwrap();

    let scorer = Scorer::new(runtime, policy(), cancel);
    let outcome = scorer.score(&mut run, &problem(), dir.path(), "").await;

    assert_eq!(outcome.fail_to_pass, Some(false));
    assert_eq!(outcome.pass_to_pass, Some(true));
    assert!(!outcome.solved);
    assert_eq!(run.solved, Some(false));
    assert_eq!(run.status, SandboxStatus::ResultScored);
}

#[tokio::test]
async fn regression_categories_do_not_gate_the_verdict() {
    // Both diagnostic categories miss their expected transition.
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let mut prob = problem();
    prob.pass_to_fail = vec!["pytest tests/test_now_failing.py".to_string()];
    prob.fail_to_fail = vec!["pytest tests/test_still_failing.py".to_string()];

    let mut run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
    run.advance(SandboxStatus::SandboxCreated).unwrap();
    run.advance(SandboxStatus::PatchGenerated).unwrap();

    let scorer = Scorer::new(runtime, policy(), CancellationToken::new());
    let outcome = scorer.score(&mut run, &prob, dir.path(), "diff").await;

    // Expected-to-fail commands exit 0 here, so both diagnostics are false.
    assert_eq!(outcome.pass_to_fail, Some(false));
    assert_eq!(outcome.fail_to_fail, Some(false));
    assert!(outcome.solved);
    assert_eq!(run.solved, Some(true));
}

#[tokio::test]
async fn patch_apply_failure_scores_unsolved_with_error() {
    let runtime = Arc::new(MockRuntime {
        exec_rules: vec![("git apply".to_string(), 1)],
        ..Default::default()
    });
    let dir = staged_workspace();
    let mut run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
    run.advance(SandboxStatus::SandboxCreated).unwrap();
    run.advance(SandboxStatus::PatchGenerated).unwrap();

    let scorer = Scorer::new(runtime, policy(), CancellationToken::new());
    let outcome = scorer.score(&mut run, &problem(), dir.path(), "diff").await;

    assert!(!outcome.solved);
    assert!(outcome.error.as_deref().unwrap().contains("failed to apply"));
    assert_eq!(run.status, SandboxStatus::ResultScored);
    assert_eq!(run.solved, Some(false));
    assert!(run.fail_to_pass_success.is_none());
}

#[tokio::test]
async fn scoring_is_idempotent_for_identical_inputs() {
    let runtime = Arc::new(MockRuntime {
        exec_rules: vec![("tests/test_bug.py".to_string(), 1)],
        ..Default::default()
    });
    let dir = staged_workspace();
    let scorer = Scorer::new(runtime, policy(), CancellationToken::new());

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let mut run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
        run.advance(SandboxStatus::SandboxCreated).unwrap();
        run.advance(SandboxStatus::PatchGenerated).unwrap();
        outcomes.push(scorer.score(&mut run, &problem(), dir.path(), "").await);
    }

    assert_eq!(outcomes[0].fail_to_pass, outcomes[1].fail_to_pass);
    assert_eq!(outcomes[0].pass_to_pass, outcomes[1].pass_to_pass);
    assert_eq!(outcomes[0].pass_to_fail, outcomes[1].pass_to_fail);
    assert_eq!(outcomes[0].fail_to_fail, outcomes[1].fail_to_fail);
    assert_eq!(outcomes[0].solved, outcomes[1].solved);
}

#[tokio::test]
async fn cancellation_during_scoring_ends_cancelled() {
    let runtime = Arc::new(MockRuntime::default());
    let dir = staged_workspace();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut run = EvaluationRun::new(Uuid::new_v4(), "org__lib-1");
    run.advance(SandboxStatus::SandboxCreated).unwrap();
    run.advance(SandboxStatus::PatchGenerated).unwrap();

    let scorer = Scorer::new(runtime, policy(), cancel);
    let outcome = scorer.score(&mut run, &problem(), dir.path(), "diff").await;

    assert!(!outcome.solved);
    assert_eq!(run.status, SandboxStatus::Cancelled);
    assert!(run.cancelled_at.is_some());
    assert!(run.eval_started_at.is_none());
    assert!(run.result_scored_at.is_none());
}
