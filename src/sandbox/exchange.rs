//! Input/output exchange records between the executor and the agent.
//!
//! The executor writes a [`SandboxInput`] to the fixed input path before
//! the agent starts; the agent must leave an [`AgentOutput`] at the fixed
//! output path before it exits. [`AgentResult`] is the value-typed outcome
//! of one agent execution: `run_agent` converts every failure mode into
//! one instead of letting anything propagate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::SwebenchProblem;

/// Problem description handed to the agent via the input exchange file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInput {
    pub instance_id: String,
    pub problem_statement: String,
    pub repo: String,
    pub base_commit: String,
    pub test_patch: String,
    pub run_id: Uuid,
}

impl SandboxInput {
    /// Builds the exchange record for one run of one problem.
    pub fn for_run(problem: &SwebenchProblem, run_id: Uuid) -> Self {
        Self {
            instance_id: problem.instance_id.clone(),
            problem_statement: problem.problem_statement.clone(),
            repo: problem.repo.clone(),
            base_commit: problem.base_commit.clone(),
            test_patch: problem.test_patch.clone(),
            run_id,
        }
    }
}

/// What the agent writes to the output exchange file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    /// The emitted patch; empty means the agent produced no change.
    pub patch: String,
    /// Free-form metadata the agent chooses to report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Tag on an [`AgentResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    Error,
}

/// Structured outcome of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    /// Present on success: the patch text, verbatim.
    pub patch: Option<String>,
    /// Present on error: what went wrong.
    pub error: Option<String>,
    /// Always `false` here; the verdict belongs to the scorer.
    pub solved: bool,
}

impl AgentResult {
    /// A successful execution that produced `patch`.
    pub fn ok(patch: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Ok,
            patch: Some(patch.into()),
            error: None,
            solved: false,
        }
    }

    /// A failed execution with a diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Error,
            patch: None,
            error: Some(message.into()),
            solved: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AgentStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem() -> SwebenchProblem {
        SwebenchProblem {
            instance_id: "org__lib-1".to_string(),
            problem_statement: "the widget leaks".to_string(),
            repo: "org/lib".to_string(),
            base_commit: "abc123".to_string(),
            test_patch: "diff --git a/t b/t".to_string(),
            fail_to_pass: vec![],
            pass_to_pass: vec![],
            pass_to_fail: vec![],
            fail_to_fail: vec![],
        }
    }

    #[test]
    fn test_sandbox_input_mirrors_problem() {
        let run_id = Uuid::new_v4();
        let input = SandboxInput::for_run(&problem(), run_id);
        assert_eq!(input.instance_id, "org__lib-1");
        assert_eq!(input.repo, "org/lib");
        assert_eq!(input.base_commit, "abc123");
        assert_eq!(input.run_id, run_id);
    }

    #[test]
    fn test_agent_output_metadata_optional() {
        let output: AgentOutput = serde_json::from_str(r#"{"patch":"diff"}"#).unwrap();
        assert_eq!(output.patch, "diff");
        assert!(output.metadata.is_none());

        let output: AgentOutput =
            serde_json::from_str(r#"{"patch":"","metadata":{"steps":3}}"#).unwrap();
        assert!(output.patch.is_empty());
        assert!(output.metadata.is_some());
    }

    #[test]
    fn test_agent_result_constructors() {
        let ok = AgentResult::ok("diff --git a/x b/x");
        assert!(ok.is_ok());
        assert_eq!(ok.patch.as_deref(), Some("diff --git a/x b/x"));
        assert!(!ok.solved);

        let err = AgentResult::error("agent timed out after 300s");
        assert!(!err.is_ok());
        assert!(err.patch.is_none());
        assert!(!err.solved);
        assert!(err.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_agent_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
