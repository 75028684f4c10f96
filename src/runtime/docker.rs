//! Docker implementation of the container runtime, via bollard.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;

use crate::error::RuntimeError;
use crate::runtime::{ContainerExit, ContainerRuntime, ContainerSpec, ExecOutput};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Unavailable` if the daemon is not accessible.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard handle.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    fn classify(op: &'static str, id: &str, err: bollard::errors::Error) -> RuntimeError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::ContainerNotFound { id: id.to_string() },
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => RuntimeError::Conflict(message),
            other => RuntimeError::Container {
                op,
                id: id.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.docker.inspect_image(image).await.is_ok())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => Ok(()),
            // Already created, possibly by a concurrent run.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Network {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            memory: spec.memory_bytes,
            network_mode: spec.network_mode.clone(),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::classify("create", &spec.name, e))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::classify("start", id, e))
    }

    async fn wait_container(&self, id: &str) -> Result<ContainerExit, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));
        let status_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(e)) => {
                // The wait endpoint reports non-zero exits of the waited
                // container as response errors carrying the status code.
                if let bollard::errors::Error::DockerContainerWaitError { code, .. } = e {
                    code
                } else {
                    return Err(Self::classify("wait for", id, e));
                }
            }
            None => {
                return Err(RuntimeError::Container {
                    op: "wait for",
                    id: id.to_string(),
                    message: "wait stream ended without a status".to_string(),
                })
            }
        };

        // The exit code alone cannot distinguish a SIGKILL from the OOM
        // killer; the container state can.
        let oom_killed = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        Ok(ContainerExit {
            status_code,
            oom_killed,
        })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| RuntimeError::Exec {
                id: id.to_string(),
                message: format!("failed to create exec: {e}"),
            })?;

        let start_result =
            self.docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| RuntimeError::Exec {
                    id: id.to_string(),
                    message: format!("failed to start exec: {e}"),
                })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            let drained = tokio::time::timeout(timeout, async {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(format!("error reading exec output: {e}")),
                    }
                }
                Ok(())
            })
            .await;

            match drained {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    return Err(RuntimeError::Exec {
                        id: id.to_string(),
                        message,
                    });
                }
                Err(_) => {
                    // Timed out: report as a failed command, not a runtime
                    // error, so a hung test counts as not passing.
                    return Ok(ExecOutput {
                        exit_code: -1,
                        stdout,
                        stderr: format!("command timed out after {}s", timeout.as_secs()),
                    });
                }
            }
        }

        let exec_info =
            self.docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| RuntimeError::Exec {
                    id: id.to_string(),
                    message: format!("failed to inspect exec: {e}"),
                })?;

        Ok(ExecOutput {
            exit_code: exec_info.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(Self::classify("read logs of", id, e)),
            }
        }

        Ok(output)
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| Self::classify("kill", id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Self::classify("remove", id, e))
    }
}
