//! Benchmark problem records and dataset loading.
//!
//! Problems arrive as opaque records from the benchmark dataset; this
//! module only parses them from a local JSON array or JSONL file and looks
//! instances up by id. Records are immutable once loaded.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DatasetError;

/// One problem from the SWE-bench dataset.
///
/// The four test command lists drive the scorer: `fail_to_pass` and
/// `pass_to_pass` gate the verdict, `pass_to_fail` and `fail_to_fail` are
/// diagnostic. Datasets that omit a category leave the list empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwebenchProblem {
    /// Unique instance identity, e.g. `django__django-11099`.
    pub instance_id: String,
    /// Natural-language description of the defect to fix.
    pub problem_statement: String,
    /// Source repository, `owner/name` or a full remote URL.
    pub repo: String,
    /// Commit the workspace is pinned to before the agent runs.
    pub base_commit: String,
    /// Diff establishing the scoring test suite.
    pub test_patch: String,
    /// Commands expected to go from failing to passing.
    #[serde(default)]
    pub fail_to_pass: Vec<String>,
    /// Commands expected to keep passing.
    #[serde(default)]
    pub pass_to_pass: Vec<String>,
    /// Commands expected to newly fail.
    #[serde(default)]
    pub pass_to_fail: Vec<String>,
    /// Commands expected to keep failing.
    #[serde(default)]
    pub fail_to_fail: Vec<String>,
}

/// Loads problems from a JSON array file or a JSONL file.
///
/// The format is detected from the first non-whitespace byte: `[` means a
/// single JSON array, anything else is treated as one record per line.
pub fn load_problems(path: &Path) -> Result<Vec<SwebenchProblem>, DatasetError> {
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim_start();

    let problems = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<SwebenchProblem>>(trimmed)?
    } else {
        let mut problems = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let problem: SwebenchProblem =
                serde_json::from_str(line).map_err(|e| DatasetError::Parse {
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            problems.push(problem);
        }
        problems
    };

    if problems.is_empty() {
        return Err(DatasetError::Empty);
    }

    debug!(path = %path.display(), count = problems.len(), "Loaded problem dataset");
    Ok(problems)
}

/// Finds a problem by instance id.
pub fn find_problem<'a>(
    problems: &'a [SwebenchProblem],
    instance_id: &str,
) -> Result<&'a SwebenchProblem, DatasetError> {
    problems
        .iter()
        .find(|p| p.instance_id == instance_id)
        .ok_or_else(|| DatasetError::InstanceNotFound(instance_id.to_string()))
}
