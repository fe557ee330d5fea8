//! Container execution backend for dynamic analysis.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Captured result of one command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Place a host file inside the container at `dest`.
    async fn upload(&self, container: &str, source: &Path, dest: &str) -> Result<()>;

    async fn execute(&self, container: &str, command: &[String], timeout_secs: u64) -> Result<ExecOutput>;
}

/// Runs commands through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    binary: String,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerSandbox {
    #[allow(dead_code)] // Alternative container runtimes, e.g. podman
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<ExecOutput> {
        debug!("{} {}", self.binary, args.join(" "));
        let started = Instant::now();

        // Dropping the child on timeout or cancellation kills it.
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("Sandbox command timed out after {}s", timeout.as_secs()))?
            .context("Failed to collect sandbox output")?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandbox {
    async fn upload(&self, container: &str, source: &Path, dest: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            source.display().to_string(),
            format!("{}:{}", container, dest),
        ];
        let output = self.run(&args, Duration::from_secs(60)).await?;
        if output.exit_code != 0 {
            anyhow::bail!("docker cp failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn execute(&self, container: &str, command: &[String], timeout_secs: u64) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        self.run(&args, Duration::from_secs(timeout_secs.max(1))).await
    }
}

/// Substitute `{path}` in a command template.
pub fn render_command(template: &[String], path: &str) -> Vec<String> {
    template.iter().map(|arg| arg.replace("{path}", path)).collect()
}
