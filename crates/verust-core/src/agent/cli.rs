//! Subprocess agent adapter.
//!
//! Launches a configured CLI with the workspace as working directory,
//! writes the prompt to stdin, and captures stdout/stderr to completion.
//! Timeouts and cancellation terminate the child: SIGTERM first, then
//! SIGKILL after a short wait.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Agent, AgentError, AgentInvocation, AgentRequest};
use crate::config::AgentSettings;

/// How long a terminated child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Generic CLI-backed agent.
///
/// The binary receives the prompt on stdin, runs in the workspace
/// directory, and (when a model is requested) gets a `--model` flag.
/// The configured API key is exposed as `AGENT_API_KEY` in the child
/// environment.
pub struct CliAgent {
    agent_name: String,
    cli_path: String,
    api_key: Option<String>,
    timeout: Duration,
    default_model: Option<String>,
    fallback_models: Vec<String>,
}

impl CliAgent {
    pub fn new(name: String, settings: &AgentSettings) -> Self {
        Self {
            agent_name: name,
            cli_path: settings.cli_path.clone(),
            api_key: settings.api_key.clone(),
            timeout: Duration::from_secs(settings.timeout.max(1)),
            default_model: settings.default_model.clone(),
            fallback_models: settings.fallback_models.clone(),
        }
    }

    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and still own.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                debug!(pid, "agent exited after SIGTERM");
                return;
            }
        }
        let _ = child.kill().await;
    }
}

impl std::fmt::Debug for CliAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliAgent")
            .field("name", &self.agent_name)
            .field("cli_path", &self.cli_path)
            .finish()
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.agent_name
    }

    fn supports(&self, model: &str) -> bool {
        self.default_model.as_deref() == Some(model)
            || self.fallback_models.iter().any(|m| m == model)
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let started = Instant::now();

        let mut cmd = Command::new(&self.cli_path);
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.api_key {
            cmd.env("AGENT_API_KEY", key);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Transport(format!(
                "failed to spawn agent binary '{}': {e}",
                self.cli_path
            ))
        })?;

        // Write the prompt and close stdin so the agent starts working.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!(agent = %self.agent_name, error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        // Read both pipes concurrently so neither fills and deadlocks.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| AgentError::Transport(format!("failed to wait on agent: {e}")))?
            }
            _ = tokio::time::sleep(request.timeout) => {
                Self::terminate(&mut child).await;
                return Err(AgentError::Timeout(request.timeout));
            }
            _ = cancel.cancelled() => {
                Self::terminate(&mut child).await;
                return Err(AgentError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let raw_output = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        if !status.success() {
            return Err(AgentError::Failed {
                code: status.code(),
                stderr: truncate(&stderr, 4096),
            });
        }

        Ok(AgentInvocation {
            raw_output,
            stderr,
            duration: started.elapsed(),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
