//! Embedded analysis modules, each run under a module-kind memory reservation.

use crate::config::ModuleSpec;
use crate::error::{AnalysisError, AnalysisResult};
use crate::memory::{AllocationKind, AllocationRequest};
use crate::models::{AnalysisFile, ModuleInvocation, ModuleReport, ModuleRun, Technique, TechniqueResult};
use crate::providers::ModuleInvoker;
use crate::scheduler::{Analyzer, TaskContext};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ModuleAnalyzer {
    invoker: Arc<dyn ModuleInvoker>,
    modules: Vec<ModuleSpec>,
}

impl ModuleAnalyzer {
    pub fn new(invoker: Arc<dyn ModuleInvoker>, modules: Vec<ModuleSpec>) -> Self {
        Self { invoker, modules }
    }
}

#[async_trait]
impl Analyzer for ModuleAnalyzer {
    fn technique(&self) -> Technique {
        Technique::Module
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult> {
        let args = vec![
            Value::from(file.path.display().to_string()),
            Value::from(file.sha256.clone()),
        ];
        let mut report = ModuleReport {
            runs: Vec::new(),
            skipped: Vec::new(),
        };

        for (index, module) in self.modules.iter().enumerate() {
            ctx.check_cancelled()?;

            let reservation = ctx.memory.reserve(
                AllocationRequest::new(
                    ctx.allocation_id(&module.id),
                    module.memory_bytes,
                    AllocationKind::Module,
                )
                .description(format!("module {} for {}", module.id, file.name)),
            );
            let _reservation = match reservation {
                Ok(r) => r,
                Err(AnalysisError::AllocationDenied { available, .. }) => {
                    warn!(
                        "Skipping module {}: needs {} bytes, {} available",
                        module.id, module.memory_bytes, available
                    );
                    report.skipped.push(module.id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let invocation = match ctx
                .cancellable(self.invoker.invoke(&module.id, &module.function, &args))
                .await?
            {
                Ok(invocation) => invocation,
                Err(e) => ModuleInvocation {
                    success: false,
                    output: None,
                    error: Some(format!("{:#}", e)),
                    memory_used: 0,
                    execution_time_ms: 0,
                },
            };
            debug!(
                "Module {} finished (success: {}, {} bytes used)",
                module.id, invocation.success, invocation.memory_used
            );

            report.runs.push(ModuleRun {
                module_id: module.id.clone(),
                function: module.function.clone(),
                invocation,
            });

            let done = ((index + 1) * 100 / self.modules.len()) as u8;
            ctx.progress.update(done, format!("module {} done", module.id));
        }

        Ok(TechniqueResult::Module(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::MemoryAllocator;
    use crate::scheduler::ProgressReporter;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records peak allocator usage seen during each invocation.
    struct FakeInvoker {
        memory: Arc<MemoryAllocator>,
        seen: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl ModuleInvoker for FakeInvoker {
        async fn invoke(
            &self,
            module_id: &str,
            _function: &str,
            args: &[Value],
        ) -> anyhow::Result<ModuleInvocation> {
            self.seen
                .lock()
                .push((module_id.to_string(), self.memory.stats().total_allocated));
            if module_id == "broken" {
                anyhow::bail!("module trapped");
            }
            Ok(ModuleInvocation {
                success: true,
                output: Some(args[1].clone()),
                error: None,
                memory_used: 10,
                execution_time_ms: 3,
            })
        }
    }

    fn spec(id: &str, memory_bytes: u64) -> ModuleSpec {
        ModuleSpec {
            id: id.to_string(),
            function: "analyze".to_string(),
            memory_bytes,
        }
    }

    #[tokio::test]
    async fn test_runs_modules_under_reservation() {
        let memory = Arc::new(MemoryAllocator::new(MemoryConfig {
            total_limit_bytes: 1000,
            ..MemoryConfig::default()
        }));
        let invoker = Arc::new(FakeInvoker {
            memory: Arc::clone(&memory),
            seen: Mutex::new(Vec::new()),
        });
        let analyzer = ModuleAnalyzer::new(
            invoker.clone(),
            vec![spec("pe-parser", 400), spec("huge", 5000), spec("broken", 100)],
        );

        let file = Arc::new(AnalysisFile::from_bytes("/tmp/m.bin", b"payload"));
        let ctx = TaskContext {
            task_id: format!("{}:module", file.id),
            file_id: file.id.clone(),
            technique: Technique::Module,
            cancel: CancellationToken::new(),
            progress: ProgressReporter::disabled().for_task(&file.id, Technique::Module),
            memory: Arc::clone(&memory),
        };

        let result = analyzer.execute(ctx, Arc::clone(&file)).await.unwrap();
        let TechniqueResult::Module(report) = result else {
            panic!("expected a module report");
        };

        assert_eq!(report.skipped, vec!["huge"]);
        assert_eq!(report.runs.len(), 2);
        assert!(report.runs[0].invocation.success);
        assert_eq!(report.runs[0].invocation.output, Some(Value::from(file.sha256.clone())));
        assert!(!report.runs[1].invocation.success);
        assert!(report.runs[1].invocation.error.as_deref().unwrap().contains("trapped"));

        assert_eq!(
            *invoker.seen.lock(),
            vec![("pe-parser".to_string(), 400), ("broken".to_string(), 100)]
        );
        assert_eq!(memory.stats().total_allocated, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_module() {
        let memory = Arc::new(MemoryAllocator::new(MemoryConfig::default()));
        let invoker = Arc::new(FakeInvoker {
            memory: Arc::clone(&memory),
            seen: Mutex::new(Vec::new()),
        });
        let analyzer = ModuleAnalyzer::new(invoker.clone(), vec![spec("a", 1)]);
        let file = Arc::new(AnalysisFile::from_bytes("/tmp/c.bin", b"x"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = TaskContext {
            task_id: "c:module".to_string(),
            file_id: file.id.clone(),
            technique: Technique::Module,
            cancel,
            progress: ProgressReporter::disabled().for_task(&file.id, Technique::Module),
            memory,
        };

        assert_eq!(analyzer.execute(ctx, file).await, Err(AnalysisError::Cancelled));
        assert!(invoker.seen.lock().is_empty());
    }
}
