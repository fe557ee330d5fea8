//! The per-technique execution seam.

use crate::error::{AnalysisError, AnalysisResult};
use crate::memory::MemoryAllocator;
use crate::models::{AnalysisFile, Technique, TechniqueResult};
use crate::scheduler::progress::TaskProgress;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running task may touch besides the file itself.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub file_id: String,
    pub technique: Technique,
    /// Fires on file cancellation, timeout or coordinator shutdown.
    pub cancel: CancellationToken,
    pub progress: TaskProgress,
    pub memory: Arc<MemoryAllocator>,
}

impl TaskContext {
    /// Await `fut` unless the task is cancelled first.
    pub async fn cancellable<T, F>(&self, fut: F) -> AnalysisResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AnalysisError::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub fn check_cancelled(&self) -> AnalysisResult<()> {
        if self.cancel.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Allocation id scoped to this task.
    pub fn allocation_id(&self, suffix: &str) -> String {
        format!("{}:{}", self.task_id, suffix)
    }
}

/// One analysis technique.
///
/// Implementations must observe `ctx.cancel` at every await on an external
/// collaborator. The coordinator frees the slot on timeout regardless.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn technique(&self) -> Technique;

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult>;
}

/// Analyzers keyed by the technique they implement.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<Technique, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an analyzer, replacing any previous one for its technique.
    pub fn register<A: Analyzer + 'static>(&mut self, analyzer: A) -> &mut Self {
        self.analyzers.insert(analyzer.technique(), Arc::new(analyzer));
        self
    }

    pub fn get(&self, technique: Technique) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&technique).cloned()
    }

    pub fn contains(&self, technique: Technique) -> bool {
        self.analyzers.contains_key(&technique)
    }

    pub fn techniques(&self) -> Vec<Technique> {
        self.analyzers.keys().copied().collect()
    }
}
