//! Sandboxed execution through a container backend.

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{AnalysisFile, DynamicReport, Technique, TechniqueResult};
use crate::providers::sandbox::render_command;
use crate::providers::SandboxExecutor;
use crate::scheduler::{Analyzer, TaskContext};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct DynamicAnalyzer {
    sandbox: Arc<dyn SandboxExecutor>,
    container: String,
    command: Vec<String>,
    sample_dir: String,
    timeout_secs: u64,
}

impl DynamicAnalyzer {
    pub fn new(
        sandbox: Arc<dyn SandboxExecutor>,
        container: impl Into<String>,
        command: Vec<String>,
        sample_dir: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            sandbox,
            container: container.into(),
            command,
            sample_dir: sample_dir.into(),
            timeout_secs,
        }
    }

    fn failed(&self, message: impl std::fmt::Display) -> AnalysisError {
        AnalysisError::technique(Technique::Dynamic, format!("{}: {}", self.container, message))
    }
}

#[async_trait]
impl Analyzer for DynamicAnalyzer {
    fn technique(&self) -> Technique {
        Technique::Dynamic
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult> {
        let dest = format!("{}/{}", self.sample_dir.trim_end_matches('/'), file.sha256);

        ctx.cancellable(self.sandbox.upload(&self.container, &file.path, &dest))
            .await?
            .map_err(|e| self.failed(format!("upload failed: {:#}", e)))?;
        ctx.progress.update(20, format!("staged in {}", self.container));

        let command = render_command(&self.command, &dest);
        info!("Executing {} in {}", file.name, self.container);
        ctx.progress
            .update_with_eta(30, "executing", self.timeout_secs.saturating_mul(1000));

        let output = ctx
            .cancellable(self.sandbox.execute(&self.container, &command, self.timeout_secs))
            .await?
            .map_err(|e| self.failed(format!("{:#}", e)))?;

        Ok(TechniqueResult::Dynamic(DynamicReport {
            container: self.container.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            execution_time_ms: output.execution_time_ms,
        }))
    }
}
