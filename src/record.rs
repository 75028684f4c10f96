//! Evaluation run records and their status state machine.
//!
//! An [`EvaluationRun`] tracks one agent evaluation from submission to
//! verdict. Its status only ever moves forward, one step at a time, along
//! `started -> sandbox_created -> patch_generated -> eval_started ->
//! result_scored`, or diverts once to `cancelled`. Every status entered
//! stamps its own timestamp exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Status of a sandbox evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Started,
    SandboxCreated,
    PatchGenerated,
    EvalStarted,
    ResultScored,
    Cancelled,
}

impl SandboxStatus {
    /// Position on the forward chain. `Cancelled` sits outside it.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Started => Some(0),
            Self::SandboxCreated => Some(1),
            Self::PatchGenerated => Some(2),
            Self::EvalStarted => Some(3),
            Self::ResultScored => Some(4),
            Self::Cancelled => None,
        }
    }

    /// The next status on the forward chain, if any.
    pub fn next(self) -> Option<SandboxStatus> {
        match self {
            Self::Started => Some(Self::SandboxCreated),
            Self::SandboxCreated => Some(Self::PatchGenerated),
            Self::PatchGenerated => Some(Self::EvalStarted),
            Self::EvalStarted => Some(Self::ResultScored),
            Self::ResultScored | Self::Cancelled => None,
        }
    }

    /// Whether no further transition is permitted from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ResultScored | Self::Cancelled)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::SandboxCreated => "sandbox_created",
            Self::PatchGenerated => "patch_generated",
            Self::EvalStarted => "eval_started",
            Self::ResultScored => "result_scored",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// One agent evaluation, from submission to verdict.
///
/// Mutated only by the executor and scorer as the run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRun {
    /// Caller-generated identity of this run.
    pub run_id: Uuid,
    /// Optional grouping of runs into one evaluation.
    pub evaluation_id: Option<Uuid>,
    /// Problem this run evaluates.
    pub swebench_instance_id: String,
    pub status: SandboxStatus,
    /// The agent's emitted patch, verbatim.
    pub response: Option<String>,
    /// Human-readable failure detail, if anything went wrong.
    pub error: Option<String>,
    pub pass_to_fail_success: Option<bool>,
    pub fail_to_pass_success: Option<bool>,
    pub pass_to_pass_success: Option<bool>,
    pub fail_to_fail_success: Option<bool>,
    /// Final verdict once scored.
    pub solved: Option<bool>,
    /// Captured execution output, truncated.
    pub logs: Option<String>,
    pub started_at: DateTime<Utc>,
    pub sandbox_created_at: Option<DateTime<Utc>>,
    pub patch_generated_at: Option<DateTime<Utc>>,
    pub eval_started_at: Option<DateTime<Utc>>,
    pub result_scored_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl EvaluationRun {
    /// Creates a run at `started` with `started_at` stamped now.
    pub fn new(run_id: Uuid, instance_id: impl Into<String>) -> Self {
        Self {
            run_id,
            evaluation_id: None,
            swebench_instance_id: instance_id.into(),
            status: SandboxStatus::Started,
            response: None,
            error: None,
            pass_to_fail_success: None,
            fail_to_pass_success: None,
            pass_to_pass_success: None,
            fail_to_fail_success: None,
            solved: None,
            logs: None,
            started_at: Utc::now(),
            sandbox_created_at: None,
            patch_generated_at: None,
            eval_started_at: None,
            result_scored_at: None,
            cancelled_at: None,
        }
    }

    /// Advances to the immediate successor status and stamps its timestamp.
    ///
    /// Rejects terminal runs, backwards moves, skipped statuses, and
    /// `cancelled` (which only [`cancel`](Self::cancel) may enter).
    pub fn advance(&mut self, next: SandboxStatus) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal { status: self.status });
        }
        let Some(next_rank) = next.rank() else {
            return Err(StateError::NotForward { to: next });
        };
        let current_rank = self.status.rank().unwrap_or(0);
        let expected = self
            .status
            .next()
            .ok_or(StateError::Terminal { status: self.status })?;
        if next != expected {
            if next_rank <= current_rank {
                return Err(StateError::Regression {
                    from: self.status,
                    to: next,
                });
            }
            return Err(StateError::Skipped {
                from: self.status,
                to: next,
                expected,
            });
        }
        self.status = next;
        self.stamp(next);
        Ok(())
    }

    /// Diverts the run to `cancelled` from any non-terminal status.
    pub fn cancel(&mut self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal { status: self.status });
        }
        self.status = SandboxStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
        Ok(())
    }

    /// Records diagnostic text without touching status.
    ///
    /// Used where the run must stay put, e.g. an unreachable runtime leaves
    /// the run at `started` with a non-empty `error`.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        match &mut self.error {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(&message);
            }
            None => self.error = Some(message),
        }
    }

    /// Drives a failed run to `result_scored` with `solved = false`.
    ///
    /// Walks the remaining forward chain one status at a time so no
    /// transition is skipped and every timestamp lands in order. Used for
    /// execution failures after the sandbox exists (timeout, OOM kill,
    /// crash, malformed output), never for pre-sandbox failures.
    pub fn finalize_error(&mut self, message: impl Into<String>) {
        self.record_error(message);
        self.solved = Some(false);
        while let Some(next) = self.status.next() {
            if self.advance(next).is_err() {
                break;
            }
        }
    }

    /// Timestamp recorded for a given status, if that status was entered.
    pub fn timestamp_for(&self, status: SandboxStatus) -> Option<DateTime<Utc>> {
        match status {
            SandboxStatus::Started => Some(self.started_at),
            SandboxStatus::SandboxCreated => self.sandbox_created_at,
            SandboxStatus::PatchGenerated => self.patch_generated_at,
            SandboxStatus::EvalStarted => self.eval_started_at,
            SandboxStatus::ResultScored => self.result_scored_at,
            SandboxStatus::Cancelled => self.cancelled_at,
        }
    }

    fn stamp(&mut self, status: SandboxStatus) {
        let now = Utc::now();
        let slot = match status {
            SandboxStatus::Started => return,
            SandboxStatus::SandboxCreated => &mut self.sandbox_created_at,
            SandboxStatus::PatchGenerated => &mut self.patch_generated_at,
            SandboxStatus::EvalStarted => &mut self.eval_started_at,
            SandboxStatus::ResultScored => &mut self.result_scored_at,
            SandboxStatus::Cancelled => &mut self.cancelled_at,
        };
        // Each status is entered at most once, so the slot is always empty.
        if slot.is_none() {
            *slot = Some(now);
        }
    }
}
