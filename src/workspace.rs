//! Workspace provisioning: a pinned repository checkout for one run.
//!
//! Each run gets a fresh directory holding the target repository at its
//! base commit, plus the exchange files the executor stages later. The
//! actual fetch is delegated to the `git` binary; its diagnostics are
//! captured into [`WorkspaceError`] so a failed run can be explained
//! without re-running anything.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::WorkspaceError;
use crate::policy::REPO_DIR;

/// Expands a short `owner/name` locator into a canonical remote URL.
/// Full URLs and scp-style locators pass through untouched.
pub fn remote_url(repo: &str) -> String {
    if repo.starts_with("http://")
        || repo.starts_with("https://")
        || repo.starts_with("git@")
        || repo.starts_with("file://")
    {
        repo.to_string()
    } else {
        format!("https://github.com/{repo}.git")
    }
}

/// Rejects repository locators that could smuggle flags or shell syntax
/// into the git subprocess.
pub fn validate_repo(locator: &str) -> Result<(), WorkspaceError> {
    let reject = |reason: &str| {
        Err(WorkspaceError::InvalidRepo {
            locator: locator.to_string(),
            reason: reason.to_string(),
        })
    };
    if locator.is_empty() {
        return reject("locator is empty");
    }
    if locator.len() > 512 {
        return reject("locator too long");
    }
    if locator.starts_with('-') {
        return reject("must not start with '-'");
    }
    if locator
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return reject("must not contain whitespace or control characters");
    }
    for ch in ['\'', '"', '`', '$', '&', '|', ';', '<', '>', '\\'] {
        if locator.contains(ch) {
            return reject("must not contain shell metacharacters");
        }
    }
    Ok(())
}

/// Rejects git refs with flag-injection or traversal potential.
///
/// Accepts hex SHAs and standard ref names: alphanumeric plus `/ . - _ ~ ^`.
pub fn validate_git_ref(git_ref: &str) -> Result<(), WorkspaceError> {
    let reject = |reason: &str| {
        Err(WorkspaceError::InvalidRef {
            git_ref: git_ref.to_string(),
            reason: reason.to_string(),
        })
    };
    if git_ref.is_empty() {
        return reject("ref is empty");
    }
    if git_ref.len() > 256 {
        return reject("ref too long");
    }
    if git_ref.starts_with('-') {
        return reject("must not start with '-'");
    }
    if git_ref.contains("..") {
        return reject("must not contain '..'");
    }
    for ch in git_ref.chars() {
        if !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^') {
            return reject("contains a character outside [a-zA-Z0-9/.-_~^]");
        }
    }
    Ok(())
}

/// Materializes `repo` at `base_commit` under `target_dir/repo`.
///
/// The clone is shallow but multi-branch; if the requested commit is not in
/// the shallow history a targeted fetch backfills it. That fetch is
/// best-effort: the commit may already be reachable, so only the clone and
/// the final checkout are allowed to fail the run.
pub async fn prepare(
    target_dir: &Path,
    repo: &str,
    base_commit: &str,
) -> Result<(), WorkspaceError> {
    validate_repo(repo)?;
    validate_git_ref(base_commit)?;

    std::fs::create_dir_all(target_dir)?;
    let repo_dir = target_dir.join(REPO_DIR);
    let url = remote_url(repo);

    debug!(repo = %repo, commit = %base_commit, dir = %target_dir.display(), "Preparing workspace");

    let clone = git(
        &[
            "clone",
            "--depth",
            "1",
            "--no-single-branch",
            &url,
            &repo_dir.to_string_lossy(),
        ],
        None,
    )
    .await?;
    if !clone.status.success() {
        return Err(WorkspaceError::Clone {
            repo: repo.to_string(),
            commit: base_commit.to_string(),
            detail: String::from_utf8_lossy(&clone.stderr).trim().to_string(),
        });
    }

    // Backfill the commit in case the shallow clone missed it. Allowed to
    // fail: the commit is often already reachable from a branch tip.
    let fetch = git(&["fetch", "origin", base_commit], Some(&repo_dir)).await?;
    if !fetch.status.success() {
        debug!(
            repo = %repo,
            commit = %base_commit,
            stderr = %String::from_utf8_lossy(&fetch.stderr).trim(),
            "Targeted fetch failed, commit may already be reachable"
        );
    }

    let checkout = git(&["checkout", base_commit], Some(&repo_dir)).await?;
    if !checkout.status.success() {
        return Err(WorkspaceError::Checkout {
            repo: repo.to_string(),
            commit: base_commit.to_string(),
            detail: String::from_utf8_lossy(&checkout.stderr).trim().to_string(),
        });
    }

    info!(repo = %repo, commit = %base_commit, "Workspace ready");
    Ok(())
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<std::process::Output, std::io::Error> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.output().await
}
