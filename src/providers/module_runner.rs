//! Invocation of embedded analysis modules hosted by an external runner.
//!
//! The runner is started as `<runner...> <module_id> <function>`, receives the
//! argument array as JSON on stdin and must print one JSON object shaped like
//! [`ModuleInvocation`] on stdout.

use crate::models::ModuleInvocation;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait ModuleInvoker: Send + Sync {
    async fn invoke(&self, module_id: &str, function: &str, args: &[Value]) -> Result<ModuleInvocation>;
}

#[derive(Debug, Clone)]
pub struct ProcessModuleRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessModuleRunner {
    /// Split a configured command line such as `wasm-host --fuel 1000000`.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().context("Module runner command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl ModuleInvoker for ProcessModuleRunner {
    async fn invoke(&self, module_id: &str, function: &str, args: &[Value]) -> Result<ModuleInvocation> {
        debug!("Invoking {}::{} via {}", module_id, function, self.program);
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(module_id)
            .arg(function)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn module runner {}", self.program))?;

        let payload = serde_json::to_vec(args).context("Failed to encode module arguments")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write module arguments")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to collect module runner output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Module runner exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let mut invocation = parse_invocation(&output.stdout)?;
        if invocation.execution_time_ms == 0 {
            invocation.execution_time_ms = started.elapsed().as_millis() as u64;
        }
        Ok(invocation)
    }
}

fn parse_invocation(stdout: &[u8]) -> Result<ModuleInvocation> {
    serde_json::from_slice(stdout).context("Module runner printed malformed output")
}
