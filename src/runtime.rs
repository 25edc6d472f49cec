//! Runtime Client Facade: a thin adapter over the Docker Engine API.
//!
//! Everything below talks to the daemon over its local Unix socket via `bollard`. Every public
//! method normalizes transport/API failures into [`ExecutorError`] so callers never have to match
//! on `bollard::errors::Error` directly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::ExecutorError;

pub const WORKDIR_ROOT: &str = "/tmp";
const OUTPUT_CAP_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n[...output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

/// The fixed security and resource profile every sandbox container is created with. None of
/// these fields are caller-controllable; they come entirely from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub labels: HashMap<String, String>,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub timed_out: bool,
}

/// The seam between the scheduler and a container runtime. `RuntimeClient` is the only production
/// implementation (talking to Docker over `bollard`); tests implement this against an in-memory
/// fake so the Image Resolver, Sandbox Factory, Execution Engine, Pool and Pool Registry can all be
/// exercised without a live daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, reference: &str) -> Result<bool, ExecutorError>;

    async fn pull_image(&self, reference: &str, timeout: Duration) -> Result<(), ExecutorError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ExecutorError>;

    async fn start_container(&self, id: &str) -> Result<(), ExecutorError>;

    async fn inspect_state(&self, id: &str) -> Result<ContainerState, ExecutorError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), ExecutorError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ExecutorError>;

    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutcome, ExecutorError>;

    /// Best-effort SIGTERM-then-SIGKILL of whatever is running inside the container. Used both
    /// when an exec times out and when the Execution Engine cancels an in-flight exec because the
    /// service is shutting down. Failures are logged internally and never propagated — callers
    /// always proceed to destroy the handle regardless of whether the kill itself succeeded.
    async fn kill_process_group(&self, id: &str);
}

pub struct RuntimeClient {
    docker: Docker,
}

impl RuntimeClient {
    pub async fn connect() -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::RuntimeApi(format!("failed to connect to docker: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| ExecutorError::RuntimeApi(format!("docker daemon did not respond to ping: {e}")))?;
        Ok(Self { docker })
    }

}

#[async_trait]
impl ContainerRuntime for RuntimeClient {
    async fn image_exists(&self, reference: &str) -> Result<bool, ExecutorError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(ExecutorError::RuntimeApi(format!("image inspect failed: {e}"))),
        }
    }

    /// Classifies pull failures so the Image Resolver knows whether to retry. Returns `Ok(())`
    /// on success. A `Some(true)` `fatal` marker text ("not found"/"unauthorized") means the
    /// caller must not retry.
    async fn pull_image(&self, reference: &str, timeout: Duration) -> Result<(), ExecutorError> {
        let (from_image, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(err) = info.error {
                            return Err(classify_pull_error(&err));
                        }
                    }
                    Err(e) => return Err(classify_pull_error(&e.to_string())),
                }
            }
            Ok(())
        };

        tokio::time::timeout(timeout, pull)
            .await
            .map_err(|_| ExecutorError::ImagePull(format!("pull of '{reference}' exceeded timeout")))?
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ExecutorError> {
        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                WORKDIR_ROOT.to_string(),
                "rw,nosuid,nodev".to_string(),
            )])),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            open_stdin: Some(false),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("execpool-{}", uuid::Uuid::new_v4().simple());
        let response = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await
            .map_err(|e| ExecutorError::SandboxCreation(format!("create_container failed: {e}")))?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ExecutorError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutorError::SandboxCreation(format!("start_container failed: {e}")))
    }

    async fn inspect_state(&self, id: &str) -> Result<ContainerState, ExecutorError> {
        match self.docker.inspect_container(id, None).await {
            Ok(inspect) => {
                let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
                Ok(if running { ContainerState::Running } else { ContainerState::Exited })
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(ContainerState::Missing)
            }
            Err(e) => Err(ExecutorError::RuntimeApi(format!("inspect_container failed: {e}"))),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), ExecutorError> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(ExecutorError::RuntimeApi(format!("stop_container failed: {e}"))),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ExecutorError> {
        let options = RemoveContainerOptions { force, ..Default::default() };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => {
                warn!(container_id = id, error = %e, "remove_container failed");
                Err(ExecutorError::RuntimeApi(format!("remove_container failed: {e}")))
            }
        }
    }

    /// Runs `argv` inside `id`, piping `stdin` to the process and capturing stdout/stderr
    /// independently up to 1 MiB each. Enforces `timeout`: on expiry, sends SIGTERM to the
    /// exec'd process group, waits up to 2s, then SIGKILL, and returns `timed_out = true` with
    /// whatever output was captured before the deadline.
    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutcome, ExecutorError> {
        let options = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(stdin.is_some()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| ExecutorError::RuntimeApi(format!("create_exec failed: {e}")))?;

        let start = self
            .docker
            .start_exec(&created.id, None::<bollard::exec::StartExecOptions>)
            .await
            .map_err(|e| ExecutorError::RuntimeApi(format!("start_exec failed: {e}")))?;

        let (mut output, mut input) = match start {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(ExecutorError::RuntimeApi("exec unexpectedly detached".to_string()));
            }
        };

        if let Some(bytes) = stdin {
            use tokio::io::AsyncWriteExt;
            let _ = input.write_all(&bytes).await;
            let _ = input.shutdown().await;
        }
        drop(input);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;
        let mut timed_out = false;

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = &mut sleep => {
                    timed_out = true;
                    break;
                }
                item = output.next() => {
                    match item {
                        Some(Ok(log)) => append_log(log, &mut stdout, &mut stderr, &mut stdout_truncated, &mut stderr_truncated),
                        Some(Err(e)) => {
                            return Err(ExecutorError::RuntimeApi(format!("exec stream error: {e}")));
                        }
                        None => break,
                    }
                }
            }
        }

        if timed_out {
            self.kill_process_group(id).await;
            return Ok(ExecOutcome { stdout, stderr, exit_code: -1, timed_out: true });
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| ExecutorError::RuntimeApi(format!("inspect_exec failed: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutcome { stdout, stderr, exit_code, timed_out: false })
    }

    async fn kill_process_group(&self, id: &str) {
        let script = "kill -TERM -- -1 2>/dev/null; sleep 2; kill -KILL -- -1 2>/dev/null; true";
        let options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        match self.docker.create_exec(id, options).await {
            Ok(created) => {
                if let Err(e) = self
                    .docker
                    .start_exec(&created.id, None::<bollard::exec::StartExecOptions>)
                    .await
                {
                    debug!(container_id = id, error = %e, "kill exec failed to start");
                }
            }
            Err(e) => debug!(container_id = id, error = %e, "kill exec failed to create"),
        }
    }
}

fn append_log(
    log: bollard::container::LogOutput,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    stdout_truncated: &mut bool,
    stderr_truncated: &mut bool,
) {
    let (buf, truncated, message): (&mut Vec<u8>, &mut bool, Bytes) = match log {
        bollard::container::LogOutput::StdOut { message } => (stdout, stdout_truncated, message),
        bollard::container::LogOutput::StdErr { message } => (stderr, stderr_truncated, message),
        _ => return,
    };
    if *truncated {
        return;
    }
    if buf.len() + message.len() > OUTPUT_CAP_BYTES {
        let remaining = OUTPUT_CAP_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&message[..remaining.min(message.len())]);
        buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
        *truncated = true;
    } else {
        buf.extend_from_slice(&message);
    }
}

/// Splits a canonical image reference into bollard's `(from_image, tag)` pull arguments. Bollard
/// wants the repository and the tag/digest passed separately.
fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once('@') {
        Some((repo, digest)) => return (repo.to_string(), digest.to_string()),
        None => {}
    }
    // Split on the last ':' only if it comes after the last '/', so a registry port
    // (`host:5000/image`) isn't mistaken for a tag separator.
    let last_slash = reference.rfind('/').unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(idx) => {
            let split_at = last_slash + idx;
            (reference[..split_at].to_string(), reference[split_at + 1..].to_string())
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

fn classify_pull_error(message: &str) -> ExecutorError {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("manifest unknown") {
        ExecutorError::ImageResolve(format!("image not found: {message}"))
    } else if lower.contains("unauthorized") || lower.contains("authentication required") {
        ExecutorError::ImageResolve(format!("authentication required: {message}"))
    } else {
        ExecutorError::ImagePull(message.to_string())
    }
}
