//! Execution Engine: delivers a script into a leased sandbox, runs it, and decides whether the
//! sandbox is reusable afterward.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::sandbox::SandboxHandle;

/// The body of `POST /execute`. Unknown fields are rejected rather than silently ignored, so a
/// caller typo surfaces as a 400 instead of being misread as a no-op.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRequest {
    pub script: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time: f64,
    pub error: Option<String>,
    /// Not part of the wire format; read by the scheduler to record the timeout metric without
    /// string-matching `error`.
    #[serde(skip)]
    pub timed_out: bool,
}

impl ExecutionResult {
    fn infra_error(err: &ExecutorError, execution_time: f64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            execution_time,
            error: Some(err.user_message()),
            timed_out: false,
        }
    }
}

pub struct ExecutionEngine {
    client: Arc<dyn ContainerRuntime>,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl ExecutionEngine {
    pub fn new(client: Arc<dyn ContainerRuntime>, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        Self { client, shutdown }
    }

    /// Runs `request` against `handle`, mutating the handle's bookkeeping fields (`exec_count`,
    /// `last_use`, `tainted`) in place. Callers decide pool disposition from
    /// `handle.should_recycle()` afterward.
    ///
    /// Races the script exec against the process-wide shutdown signal: if shutdown fires while
    /// the exec is in flight, the in-container process is killed, the handle is tainted, and a
    /// canceled `ExecutionResult` is returned immediately rather than waiting out the script's
    /// own timeout.
    pub async fn execute(
        &self,
        handle: &mut SandboxHandle,
        script: &str,
        stdin: &str,
        timeout: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();
        let workdir = format!("/tmp/{}", Uuid::new_v4().simple());

        if let Err(err) = self.deliver_script(&handle.container_id, &workdir, script).await {
            handle.tainted = true;
            return ExecutionResult::infra_error(&err, started.elapsed().as_secs_f64());
        }

        let script_path = format!("{workdir}/script");
        let mut shutdown = self.shutdown.clone();
        let exec_future = self.client.exec(
            &handle.container_id,
            vec!["/bin/sh".to_string(), "-c".to_string(), script_path],
            Some(stdin.as_bytes().to_vec()),
            timeout,
        );
        tokio::pin!(exec_future);

        let exec_result = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                self.client.kill_process_group(&handle.container_id).await;
                self.cleanup_workdir(&handle.container_id, &workdir, handle).await;
                handle.tainted = true;
                handle.exec_count += 1;
                handle.last_use = Utc::now();
                return ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    execution_time: started.elapsed().as_secs_f64(),
                    error: Some("execution canceled: service shutting down".to_string()),
                    timed_out: false,
                };
            }
            result = &mut exec_future => result,
        };

        self.cleanup_workdir(&handle.container_id, &workdir, handle).await;

        handle.exec_count += 1;
        handle.last_use = Utc::now();

        let outcome = match exec_result {
            Ok(outcome) => outcome,
            Err(err) => {
                handle.tainted = true;
                return ExecutionResult::infra_error(&err, started.elapsed().as_secs_f64());
            }
        };

        if outcome.timed_out {
            handle.tainted = true;
            return ExecutionResult {
                success: false,
                stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                exit_code: -1,
                execution_time: started.elapsed().as_secs_f64(),
                error: Some("execution timeout".to_string()),
                timed_out: true,
            };
        }

        if !handle.tainted {
            match self.client.inspect_state(&handle.container_id).await {
                Ok(ContainerState::Running) => {}
                _ => handle.tainted = true,
            }
        }

        ExecutionResult {
            success: outcome.exit_code == 0,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
            exit_code: outcome.exit_code,
            execution_time: started.elapsed().as_secs_f64(),
            error: None,
            timed_out: false,
        }
    }

    /// Writes `script` to `workdir/script` inside the container via a dedicated exec: creates
    /// the directory, streams the script bytes to a temp name, marks it executable, then renames
    /// atomically. The execute bit matters: `execute()` below invokes this path as a bare argv
    /// element (`sh -c '<path>'`), which `execve()`s it directly rather than sourcing it.
    async fn deliver_script(&self, container_id: &str, workdir: &str, script: &str) -> Result<(), ExecutorError> {
        let tmp_path = format!("{workdir}/.script.tmp");
        let final_path = format!("{workdir}/script");
        let cmd = format!("mkdir -p {workdir} && cat > {tmp_path} && chmod +x {tmp_path} && mv {tmp_path} {final_path}");
        let outcome = self
            .client
            .exec(
                container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
                Some(script.as_bytes().to_vec()),
                Duration::from_secs(10),
            )
            .await?;
        if outcome.timed_out || outcome.exit_code != 0 {
            return Err(ExecutorError::RuntimeApi("failed to deliver script into sandbox".to_string()));
        }
        Ok(())
    }

    /// Best-effort cleanup of the per-execution working directory. Failure taints the handle but
    /// never fails the execution's own Result.
    async fn cleanup_workdir(&self, container_id: &str, workdir: &str, handle: &mut SandboxHandle) {
        let outcome = self
            .client
            .exec(
                container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), format!("rm -rf {workdir}")],
                None,
                Duration::from_secs(5),
            )
            .await;
        match outcome {
            Ok(o) if o.exit_code == 0 && !o.timed_out => {}
            Ok(_) => {
                warn!(container_id, workdir, "workdir cleanup exited non-zero");
                handle.tainted = true;
            }
            Err(err) => {
                warn!(container_id, workdir, error = %err, "workdir cleanup exec failed");
                handle.tainted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_unknown_fields_rejects_typos() {
        let err = serde_json::from_str::<ExecutionRequest>(r#"{"scirpt": "echo hi"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field") || err.to_string().contains("missing field"));
    }

    #[test]
    fn defaults_stdin_and_image() {
        let req: ExecutionRequest = serde_json::from_str(r#"{"script": "echo hi"}"#).unwrap();
        assert_eq!(req.stdin, "");
        assert_eq!(req.image, None);
    }

    #[test]
    fn infra_error_never_leaks_internal_detail_beyond_message() {
        let err = ExecutorError::PoolExhausted { pool: "alpine:latest".to_string() };
        let result = ExecutionResult::infra_error(&err, 0.1);
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("alpine:latest"));
    }
}
