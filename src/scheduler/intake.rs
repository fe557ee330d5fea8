//! Feeds files to the coordinator a bounded window at a time.
//!
//! Every file puts one task into each enabled bulkhead. Keeping at most
//! `max_concurrent + queue_capacity` files in flight for the tightest enabled
//! bulkhead means no task is ever rejected with `QueueFull` because of the
//! size of the input set.

use crate::config::BulkheadsConfig;
use crate::error::AnalysisResult;
use crate::models::{AnalysisFile, FileReport, FileStatus, Technique};
use crate::scheduler::AnalysisCoordinator;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Files that can be in flight without overflowing any enabled bulkhead.
pub fn intake_window(bulkheads: &BulkheadsConfig, techniques: &[Technique]) -> usize {
    techniques
        .iter()
        .map(|t| {
            let b = bulkheads.for_technique(*t);
            b.max_concurrent + b.queue_capacity
        })
        .min()
        .unwrap_or(1)
        .max(1)
}

/// Submit every file, keeping at most `window` unfinished at once, and
/// collect each file's tasks once they are all terminal. Reports come back
/// in input order.
///
/// Files reached after `stop` fires are still registered, then cancelled at
/// once, so each of their tasks records a `cancelled` error.
pub async fn analyze_all(
    coordinator: &AnalysisCoordinator,
    files: Vec<AnalysisFile>,
    window: usize,
    stop: &CancellationToken,
) -> AnalysisResult<Vec<FileReport>> {
    info!("Analyzing {} files, at most {} at a time", files.len(), window);

    let mut finished: Vec<(usize, AnalysisResult<FileReport>)> =
        stream::iter(files.into_iter().enumerate())
            .map(|(index, file)| async move { (index, analyze_one(coordinator, file, stop).await) })
            .buffer_unordered(window.max(1))
            .collect()
            .await;

    finished.sort_by_key(|(index, _)| *index);
    finished.into_iter().map(|(_, report)| report).collect()
}

async fn analyze_one(
    coordinator: &AnalysisCoordinator,
    mut file: AnalysisFile,
    stop: &CancellationToken,
) -> AnalysisResult<FileReport> {
    file.status = FileStatus::Analyzing;
    let file_id = file.id.clone();
    coordinator.submit(file.clone())?;
    if stop.is_cancelled() {
        coordinator.cancel(&file_id);
    }

    if let Some(summary) = coordinator.wait_for_file(&file_id).await {
        debug!(
            "{} finished: {} completed, {} failed",
            file.name, summary.completed, summary.failed
        );
    }
    let tasks = coordinator.take_finished(&file_id).unwrap_or_default();
    file.status = FileStatus::Analyzed;
    Ok(FileReport { file, tasks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkheadConfig, MemoryConfig};
    use crate::error::AnalysisError;
    use crate::memory::MemoryAllocator;
    use crate::models::{SignatureReport, TaskStatus, TechniqueResult};
    use crate::scheduler::{Analyzer, AnalyzerRegistry, ProgressReporter, TaskContext};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct SlowAnalyzer {
        technique: Technique,
        delay: Duration,
    }

    #[async_trait]
    impl Analyzer for SlowAnalyzer {
        fn technique(&self) -> Technique {
            self.technique
        }

        async fn execute(
            &self,
            ctx: TaskContext,
            _file: Arc<AnalysisFile>,
        ) -> AnalysisResult<TechniqueResult> {
            ctx.cancellable(tokio::time::sleep(self.delay)).await?;
            Ok(TechniqueResult::Signature(SignatureReport {
                rules_evaluated: 0,
                matches: vec![],
            }))
        }
    }

    fn coordinator(bulkheads: &BulkheadsConfig, techniques: &[Technique]) -> AnalysisCoordinator {
        let mut registry = AnalyzerRegistry::new();
        for &technique in techniques {
            registry.register(SlowAnalyzer {
                technique,
                delay: Duration::from_secs(20),
            });
        }
        AnalysisCoordinator::new(
            bulkheads,
            techniques.to_vec(),
            registry,
            Arc::new(MemoryAllocator::new(MemoryConfig::default())),
            ProgressReporter::disabled(),
        )
    }

    fn samples(count: usize) -> Vec<AnalysisFile> {
        (0..count)
            .map(|i| AnalysisFile::from_bytes(format!("sample-{}.exe", i), format!("body {}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_window_follows_tightest_bulkhead() {
        let bulkheads = BulkheadsConfig::default();
        assert_eq!(intake_window(&bulkheads, &[Technique::Dynamic]), 6);
        assert_eq!(intake_window(&bulkheads, &[Technique::Static]), 13);
        assert_eq!(
            intake_window(&bulkheads, &[Technique::Static, Technique::Dynamic, Technique::Ai]),
            6
        );

        let mut tight = BulkheadsConfig::default();
        tight.signature = BulkheadConfig::new(1, 0, 1_000);
        assert_eq!(intake_window(&tight, &[Technique::Signature]), 1);
        assert_eq!(intake_window(&tight, &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_input_never_overflows_bulkheads() {
        let bulkheads = BulkheadsConfig::default();
        let techniques = [Technique::Dynamic, Technique::Static];
        let coordinator = coordinator(&bulkheads, &techniques);
        let files = samples(10);
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();

        let window = intake_window(&bulkheads, &techniques);
        let reports = analyze_all(&coordinator, files, window, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 10);
        let reported: Vec<String> = reports.iter().map(|r| r.file.name.clone()).collect();
        assert_eq!(reported, names);
        for report in &reports {
            assert_eq!(report.file.status, FileStatus::Analyzed);
            assert_eq!(report.tasks.len(), 2);
            assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        }
        assert_eq!(coordinator.resource_usage().active_analyses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_files_after_stop_are_cancelled() {
        let bulkheads = BulkheadsConfig::default();
        let coordinator = coordinator(&bulkheads, &[Technique::Dynamic]);
        let stop = CancellationToken::new();
        stop.cancel();

        let reports = analyze_all(&coordinator, samples(3), 2, &stop).await.unwrap();

        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!(report.tasks[0].error, Some(AnalysisError::Cancelled));
        }
    }
}
