//! Resource policy for sandboxed agent execution.
//!
//! Every run obeys the same limits and sees the same fixed path layout
//! inside its container. The policy is plain read-only data passed
//! explicitly into the executor and scorer, so tests can run with tiny
//! limits instead of the production ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Docker image the agent executes in.
pub const SANDBOX_IMAGE: &str = "sandbox-image";
/// Docker image for the outbound network proxy sidecar.
pub const PROXY_IMAGE: &str = "sandbox-proxy-image";

/// Name of the network sandboxes and the proxy attach to.
pub const SANDBOX_NETWORK: &str = "sandbox-network";
/// Container name of the shared proxy sidecar.
pub const PROXY_CONTAINER: &str = "sandbox_proxy";

/// Memory ceiling per agent container (1 GiB).
pub const MAX_MEMORY_BYTES: i64 = 1024 * 1024 * 1024;
/// Wall-clock limit per agent execution (5 minutes).
pub const MAX_RUNTIME_SECS: u64 = 300;

// Fixed layout inside the container. The host sandbox directory is
// bind-mounted at `SANDBOX_DIR`, so each in-container path below has a
// host-side counterpart named by the corresponding `*_FILE`/`*_DIR` const.
pub const SANDBOX_DIR: &str = "/sandbox";
pub const SANDBOX_MAIN_FILE: &str = "/sandbox/main.py";
pub const SANDBOX_INPUT_FILE: &str = "/sandbox/input.json";
pub const SANDBOX_OUTPUT_FILE: &str = "/sandbox/output.json";
pub const SANDBOX_REPO_DIR: &str = "/sandbox/repo";
pub const SANDBOX_TEST_PATCH_FILE: &str = "/sandbox/test.patch";
pub const SANDBOX_CANDIDATE_PATCH_FILE: &str = "/sandbox/candidate.patch";

/// Host-side file names within a run's sandbox directory.
pub const MAIN_FILE: &str = "main.py";
pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const REPO_DIR: &str = "repo";
pub const TEST_PATCH_FILE: &str = "test.patch";
pub const CANDIDATE_PATCH_FILE: &str = "candidate.patch";

/// Limits and fixed identifiers applied to every sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Image the agent container is created from.
    pub sandbox_image: String,
    /// Image the proxy sidecar is created from.
    pub proxy_image: String,
    /// Network the agent container and the proxy share.
    pub network_name: String,
    /// Container name of the proxy sidecar.
    pub proxy_container: String,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
    /// Wall-clock timeout in seconds.
    pub runtime_secs: u64,
    /// Command that starts the agent inside the container.
    pub agent_command: Vec<String>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            sandbox_image: SANDBOX_IMAGE.to_string(),
            proxy_image: PROXY_IMAGE.to_string(),
            network_name: SANDBOX_NETWORK.to_string(),
            proxy_container: PROXY_CONTAINER.to_string(),
            memory_bytes: MAX_MEMORY_BYTES,
            runtime_secs: MAX_RUNTIME_SECS,
            agent_command: vec!["python".to_string(), SANDBOX_MAIN_FILE.to_string()],
        }
    }
}

impl ResourcePolicy {
    /// Wall-clock timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    /// Sets the memory ceiling in megabytes.
    pub fn with_memory_mb(mut self, mb: i64) -> Self {
        self.memory_bytes = mb * 1024 * 1024;
        self
    }

    /// Sets the wall-clock timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.runtime_secs = secs;
        self
    }

    /// Sets the sandbox image.
    pub fn with_sandbox_image(mut self, image: impl Into<String>) -> Self {
        self.sandbox_image = image.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_constants() {
        let policy = ResourcePolicy::default();
        assert_eq!(policy.sandbox_image, SANDBOX_IMAGE);
        assert_eq!(policy.proxy_image, PROXY_IMAGE);
        assert_eq!(policy.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(policy.runtime_secs, 300);
        assert_eq!(policy.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_policy_builders() {
        let policy = ResourcePolicy::default()
            .with_memory_mb(64)
            .with_timeout_secs(2)
            .with_sandbox_image("busybox:latest");
        assert_eq!(policy.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(policy.timeout(), Duration::from_secs(2));
        assert_eq!(policy.sandbox_image, "busybox:latest");
    }

    #[test]
    fn test_agent_command_targets_fixed_entry_point() {
        let policy = ResourcePolicy::default();
        assert_eq!(policy.agent_command.last().unwrap(), SANDBOX_MAIN_FILE);
    }
}
