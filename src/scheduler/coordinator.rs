//! Bulkhead scheduler for per-technique analysis tasks.
//!
//! All bookkeeping (registry, bulkhead counters, queues) happens inside one
//! `parking_lot` critical section that never awaits. Analyzer bodies run as
//! spawned tasks, each watched by a supervisor that races it against its
//! cancellation token and its deadline. Whichever finishes first decides the
//! task outcome and frees the slot.

use crate::config::BulkheadsConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::memory::MemoryAllocator;
use crate::models::{
    AnalysisFile, AnalysisTask, BulkheadStatus, ResourceUsage, TaskStatus, TaskStatusSummary,
    Technique, TechniqueResult,
};
use crate::scheduler::analyzer::{AnalyzerRegistry, TaskContext};
use crate::scheduler::bulkhead::{Admission, Bulkhead};
use crate::scheduler::progress::{ProgressPhase, ProgressReporter};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Schedules analysis tasks. Clones share the same state.
#[derive(Clone)]
pub struct AnalysisCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    analyzers: AnalyzerRegistry,
    techniques: Vec<Technique>,
    memory: Arc<MemoryAllocator>,
    progress: ProgressReporter,
    root: CancellationToken,
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    bulkheads: BTreeMap<Technique, Bulkhead>,
    tasks: HashMap<String, TaskEntry>,
    files: HashMap<String, FileEntry>,
}

struct TaskEntry {
    task: AnalysisTask,
    /// Present while the task is running.
    token: Option<CancellationToken>,
}

struct FileEntry {
    file: Arc<AnalysisFile>,
    token: CancellationToken,
    task_ids: Vec<String>,
    /// Set by the first `cancel`. The token alone cannot tell, since it is
    /// already cancelled for files submitted after shutdown.
    cancel_requested: bool,
}

/// A task that has taken a slot and must be spawned once the lock is released.
struct Launch {
    task_id: String,
    technique: Technique,
    file: Arc<AnalysisFile>,
    token: CancellationToken,
    timeout: Duration,
}

/// Progress event decided under the lock, published after it.
struct Pending {
    file_id: String,
    technique: Technique,
    phase: ProgressPhase,
    message: String,
}

impl AnalysisCoordinator {
    /// Build a coordinator that creates one task per entry of `techniques`
    /// for every submitted file.
    pub fn new(
        bulkheads: &BulkheadsConfig,
        techniques: Vec<Technique>,
        analyzers: AnalyzerRegistry,
        memory: Arc<MemoryAllocator>,
        progress: ProgressReporter,
    ) -> Self {
        let state = State {
            bulkheads: Technique::ALL
                .iter()
                .map(|t| (*t, Bulkhead::new(*t, bulkheads.for_technique(*t))))
                .collect(),
            ..State::default()
        };

        Self {
            inner: Arc::new(Inner {
                analyzers,
                techniques,
                memory,
                progress,
                root: CancellationToken::new(),
                state: Mutex::new(state),
                changed: Notify::new(),
            }),
        }
    }

    /// Register a file and admit one task per technique.
    ///
    /// Tasks are visible in the registry as soon as this returns, whether they
    /// are running, queued or already rejected.
    pub fn submit(&self, file: AnalysisFile) -> AnalysisResult<()> {
        let file = Arc::new(file);
        let mut launches = Vec::new();
        let mut events = Vec::new();

        {
            let mut state = self.inner.state.lock();
            if state.files.contains_key(&file.id) {
                return Err(AnalysisError::DuplicateFile(file.id.clone()));
            }

            let file_token = self.inner.root.child_token();
            let mut task_ids = Vec::with_capacity(self.inner.techniques.len());

            for &technique in &self.inner.techniques {
                let task = AnalysisTask::new(&file.id, technique);
                let task_id = task.id.clone();
                task_ids.push(task_id.clone());
                state.tasks.insert(task_id.clone(), TaskEntry { task, token: None });

                if !self.inner.analyzers.contains(technique) {
                    fail_pending(&mut state, &task_id, AnalysisError::NoAnalyzer(technique), &mut events);
                    continue;
                }

                let admission = match state.bulkheads.get_mut(&technique) {
                    Some(bulkhead) => bulkhead.admit(&task_id),
                    None => Admission::Rejected,
                };

                match admission {
                    Admission::Run => {
                        launches.push(start_task(&mut state, &task_id, &file, &file_token, &mut events));
                    }
                    Admission::Queued => {
                        debug!("Queued {}", task_id);
                    }
                    Admission::Rejected => {
                        let capacity = state
                            .bulkheads
                            .get(&technique)
                            .map(|b| b.status().queue_capacity)
                            .unwrap_or_default();
                        warn!("Rejected {}: {} bulkhead is full", task_id, technique);
                        fail_pending(
                            &mut state,
                            &task_id,
                            AnalysisError::QueueFull { technique, capacity },
                            &mut events,
                        );
                    }
                }
            }

            info!("Submitted {} ({} tasks)", file.name, task_ids.len());
            state.files.insert(
                file.id.clone(),
                FileEntry {
                    file: Arc::clone(&file),
                    token: file_token,
                    task_ids,
                    cancel_requested: false,
                },
            );
        }

        self.after_change(launches, events);
        Ok(())
    }

    /// Cancel every unfinished task of a file. Queued tasks fail immediately;
    /// running tasks are signalled and fail as soon as their supervisor sees
    /// it. Calling this again has no further effect.
    pub fn cancel(&self, file_id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.files.get_mut(file_id) else {
                return;
            };
            if entry.cancel_requested {
                return;
            }
            entry.cancel_requested = true;
            entry.token.cancel();
            info!("Cancelling {}", entry.file.name);

            let task_ids = entry.task_ids.clone();
            for task_id in task_ids {
                let queued = match state.tasks.get(&task_id) {
                    Some(t) if t.task.status == TaskStatus::Pending => Some(t.task.technique),
                    _ => None,
                };
                if let Some(technique) = queued {
                    if let Some(bulkhead) = state.bulkheads.get_mut(&technique) {
                        bulkhead.remove_queued(&task_id);
                    }
                    fail_pending(&mut state, &task_id, AnalysisError::Cancelled, &mut events);
                }
            }
        }
        self.after_change(Vec::new(), events);
    }

    /// Cancel every file and stop accepting work from running analyzers.
    pub fn shutdown(&self) {
        let file_ids: Vec<String> = self.inner.state.lock().files.keys().cloned().collect();
        for file_id in file_ids {
            self.cancel(&file_id);
        }
        self.inner.root.cancel();
    }

    pub fn task_status(&self, file_id: &str) -> Option<TaskStatusSummary> {
        let state = self.inner.state.lock();
        let entry = state.files.get(file_id)?;
        Some(TaskStatusSummary::from_tasks(
            entry
                .task_ids
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .map(|t| &t.task),
        ))
    }

    /// Snapshot of the task records of a file, in technique order.
    #[allow(dead_code)] // Live view; the CLI reads results via take_finished
    pub fn tasks(&self, file_id: &str) -> Vec<AnalysisTask> {
        let state = self.inner.state.lock();
        state
            .files
            .get(file_id)
            .map(|entry| {
                entry
                    .task_ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id))
                    .map(|t| t.task.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bulkhead_status(&self) -> Vec<BulkheadStatus> {
        self.inner
            .state
            .lock()
            .bulkheads
            .values()
            .map(Bulkhead::status)
            .collect()
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        let bulkheads = self.bulkhead_status();
        ResourceUsage {
            active_analyses: bulkheads.iter().map(|b| b.active_count).sum(),
            queued_analyses: bulkheads.iter().map(|b| b.queue_length).sum(),
            memory: self.inner.memory.stats(),
            bulkheads,
        }
    }

    /// Resolve once every task of the file is terminal. `None` for unknown files.
    pub async fn wait_for_file(&self, file_id: &str) -> Option<TaskStatusSummary> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let summary = self.task_status(file_id)?;
            if summary.is_finished() {
                return Some(summary);
            }
            notified.await;
        }
    }

    /// Remove a fully terminal file from the registry and hand back its tasks.
    /// Returns `None` if the file is unknown or still has unfinished tasks.
    pub fn take_finished(&self, file_id: &str) -> Option<Vec<AnalysisTask>> {
        let mut state = self.inner.state.lock();
        let entry = state.files.get(file_id)?;
        let finished = entry
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .all(|t| t.task.status.is_terminal());
        if !finished {
            return None;
        }

        let entry = state.files.remove(file_id)?;
        let tasks = entry
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.remove(id))
            .map(|t| t.task)
            .collect();
        debug!("Released {} from the registry", entry.file.name);
        Some(tasks)
    }

    fn after_change(&self, launches: Vec<Launch>, events: Vec<Pending>) {
        for event in events {
            self.publish(event);
        }
        for launch in launches {
            self.launch(launch);
        }
        self.inner.changed.notify_waiters();
    }

    fn publish(&self, event: Pending) {
        let progress = if event.phase.is_terminal() { 100 } else { 0 };
        self.inner
            .progress
            .for_task(&event.file_id, event.technique)
            .emit(event.phase, progress, event.message);
    }

    fn launch(&self, launch: Launch) {
        let Some(analyzer) = self.inner.analyzers.get(launch.technique) else {
            self.finish(&launch.task_id, Err(AnalysisError::NoAnalyzer(launch.technique)));
            return;
        };

        let Launch {
            task_id,
            technique,
            file,
            token,
            timeout,
        } = launch;

        let ctx = TaskContext {
            task_id: task_id.clone(),
            file_id: file.id.clone(),
            technique,
            cancel: token.clone(),
            progress: self.inner.progress.for_task(&file.id, technique),
            memory: Arc::clone(&self.inner.memory),
        };

        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut work = tokio::spawn(async move { analyzer.execute(ctx, file).await });

            let outcome = tokio::select! {
                joined = &mut work => match joined {
                    Ok(result) => result,
                    Err(e) => Err(AnalysisError::technique(technique, format!("analyzer aborted: {}", e))),
                },
                _ = token.cancelled() => Err(AnalysisError::Cancelled),
                _ = tokio::time::sleep(timeout) => {
                    warn!("{} timed out after {}ms", task_id, timeout.as_millis());
                    token.cancel();
                    Err(AnalysisError::Timeout {
                        technique,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            // The analyzer is left to observe its token; the slot is freed now.
            drop(work);
            coordinator.finish(&task_id, outcome);
        });
    }

    /// Record a running task's outcome, free its slot and start the next
    /// queued task of the same technique.
    fn finish(&self, task_id: &str, outcome: AnalysisResult<TechniqueResult>) {
        let mut launches = Vec::new();
        let mut events = Vec::new();

        {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.status.is_terminal() {
                return;
            }

            let technique = entry.task.technique;
            let file_id = entry.task.file_id.clone();
            entry.token = None;
            entry.task.end_time = Some(Utc::now());

            let message = match outcome {
                Ok(result) => {
                    entry.task.status = TaskStatus::Completed;
                    entry.task.result = Some(result);
                    info!("{} completed", task_id);
                    events.push(Pending {
                        file_id: file_id.clone(),
                        technique,
                        phase: ProgressPhase::Completed,
                        message: "completed".to_string(),
                    });
                    None
                }
                Err(error) => {
                    let message = error.to_string();
                    entry.task.status = TaskStatus::Failed;
                    entry.task.error = Some(error);
                    Some(message)
                }
            };
            if let Some(message) = message {
                warn!("{} failed: {}", task_id, message);
                events.push(Pending {
                    file_id,
                    technique,
                    phase: ProgressPhase::Failed,
                    message,
                });
            }

            if let Some(launch) = release_slot(&mut state, technique, &mut events) {
                launches.push(launch);
            }
        }

        self.after_change(launches, events);
    }
}

/// Free one slot of `technique` and hand it to the first queued task that
/// still belongs to a registered file. Entries whose file is gone are skipped.
fn release_slot(state: &mut State, technique: Technique, events: &mut Vec<Pending>) -> Option<Launch> {
    let mut next = state.bulkheads.get_mut(&technique)?.release();
    while let Some(task_id) = next {
        if let Some((file, token)) = resolve_file(state, &task_id) {
            return Some(start_task(state, &task_id, &file, &token, events));
        }
        // The slot passed to an orphan; release it again.
        debug!("Dropping orphaned queue entry {}", task_id);
        next = state.bulkheads.get_mut(&technique)?.release();
    }
    None
}

fn resolve_file(state: &State, task_id: &str) -> Option<(Arc<AnalysisFile>, CancellationToken)> {
    let file_id = &state.tasks.get(task_id)?.task.file_id;
    let entry = state.files.get(file_id)?;
    Some((Arc::clone(&entry.file), entry.token.clone()))
}

/// Move a task that holds a slot to running. Caller must have taken the slot.
fn start_task(
    state: &mut State,
    task_id: &str,
    file: &Arc<AnalysisFile>,
    file_token: &CancellationToken,
    events: &mut Vec<Pending>,
) -> Launch {
    let token = file_token.child_token();
    let mut technique = Technique::Static;
    let mut timeout = Duration::ZERO;

    if let Some(entry) = state.tasks.get_mut(task_id) {
        entry.task.status = TaskStatus::Running;
        entry.task.start_time = Some(Utc::now());
        entry.token = Some(token.clone());
        technique = entry.task.technique;
    }
    if let Some(bulkhead) = state.bulkheads.get(&technique) {
        timeout = bulkhead.timeout();
    }

    debug!("Starting {}", task_id);
    events.push(Pending {
        file_id: file.id.clone(),
        technique,
        phase: ProgressPhase::Started,
        message: format!("{} analysis started", technique),
    });

    Launch {
        task_id: task_id.to_string(),
        technique,
        file: Arc::clone(file),
        token,
        timeout,
    }
}

/// Fail a task that never ran.
fn fail_pending(state: &mut State, task_id: &str, error: AnalysisError, events: &mut Vec<Pending>) {
    let Some(entry) = state.tasks.get_mut(task_id) else {
        return;
    };
    entry.task.status = TaskStatus::Failed;
    entry.task.end_time = Some(Utc::now());
    events.push(Pending {
        file_id: entry.task.file_id.clone(),
        technique: entry.task.technique,
        phase: ProgressPhase::Failed,
        message: error.to_string(),
    });
    entry.task.error = Some(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkheadConfig, MemoryConfig};
    use crate::models::SignatureReport;
    use crate::scheduler::analyzer::Analyzer;
    use crate::scheduler::progress::ProgressEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps for `delay`, tracking concurrency and start order.
    #[derive(Clone)]
    struct FakeAnalyzer {
        technique: Technique,
        delay: Duration,
        fail: bool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        started: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl FakeAnalyzer {
        fn new(technique: Technique, delay: Duration) -> Self {
            Self {
                technique,
                delay,
                fail: false,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                started: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        fn technique(&self) -> Technique {
            self.technique
        }

        async fn execute(
            &self,
            ctx: TaskContext,
            file: Arc<AnalysisFile>,
        ) -> AnalysisResult<TechniqueResult> {
            self.started.lock().push(file.name.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let slept = ctx.cancellable(tokio::time::sleep(self.delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            slept?;

            if self.fail {
                return Err(AnalysisError::technique(self.technique, "sample rejected"));
            }
            Ok(TechniqueResult::Signature(SignatureReport {
                rules_evaluated: 1,
                matches: vec![],
            }))
        }
    }

    fn bulkheads(max_concurrent: usize, queue_capacity: usize, timeout_ms: u64) -> BulkheadsConfig {
        let config = BulkheadConfig::new(max_concurrent, queue_capacity, timeout_ms);
        BulkheadsConfig {
            static_analysis: config,
            dynamic: config,
            ai: config,
            signature: config,
            module: config,
        }
    }

    fn coordinator(config: BulkheadsConfig, analyzers: Vec<FakeAnalyzer>) -> AnalysisCoordinator {
        let techniques = analyzers.iter().map(|a| a.technique).collect();
        let mut registry = AnalyzerRegistry::new();
        for analyzer in analyzers {
            registry.register(analyzer);
        }
        AnalysisCoordinator::new(
            &config,
            techniques,
            registry,
            Arc::new(MemoryAllocator::new(MemoryConfig::default())),
            ProgressReporter::disabled(),
        )
    }

    fn sample(name: &str) -> AnalysisFile {
        AnalysisFile::from_bytes(name, name.as_bytes())
    }

    fn error_kind(coordinator: &AnalysisCoordinator, file_id: &str) -> Option<&'static str> {
        coordinator.tasks(file_id)[0].error.as_ref().map(|e| e.kind())
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_and_liveness() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(2));
        let coordinator = coordinator(bulkheads(2, 3, 60_000), vec![analyzer.clone()]);

        let files: Vec<AnalysisFile> = (0..5).map(|i| sample(&format!("s{}", i))).collect();
        for file in &files {
            coordinator.submit(file.clone()).unwrap();
        }

        let status = coordinator
            .bulkhead_status()
            .into_iter()
            .find(|b| b.technique == Technique::Signature)
            .unwrap();
        assert_eq!(status.active_count, 2);
        assert_eq!(status.queue_length, 3);

        let usage = coordinator.resource_usage();
        assert_eq!(usage.active_analyses, 2);
        assert_eq!(usage.queued_analyses, 3);

        for file in &files {
            let summary = coordinator.wait_for_file(&file.id).await.unwrap();
            assert_eq!(summary.completed, 1);
        }
        assert!(analyzer.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(analyzer.started.lock().len(), 5);
        assert_eq!(coordinator.resource_usage().active_analyses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects_without_running() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(1));
        let coordinator = coordinator(bulkheads(2, 1, 60_000), vec![analyzer.clone()]);

        let files: Vec<AnalysisFile> = (0..4).map(|i| sample(&format!("s{}", i))).collect();
        for file in &files {
            coordinator.submit(file.clone()).unwrap();
        }

        let rejected = &files[3];
        let summary = coordinator.task_status(&rejected.id).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(error_kind(&coordinator, &rejected.id), Some("queue_full"));
        assert!(coordinator.tasks(&rejected.id)[0].start_time.is_none());

        for file in &files[..3] {
            coordinator.wait_for_file(&file.id).await;
        }
        assert!(!analyzer.started.lock().contains(&"s3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_millis(500));
        let coordinator = coordinator(bulkheads(1, 5, 60_000), vec![analyzer.clone()]);

        let files: Vec<AnalysisFile> = ["a", "b", "c", "d"].iter().map(|n| sample(n)).collect();
        for file in &files {
            coordinator.submit(file.clone()).unwrap();
        }
        for file in &files {
            coordinator.wait_for_file(&file.id).await;
        }

        assert_eq!(*analyzer.started.lock(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(600));
        let coordinator = coordinator(bulkheads(1, 1, 1_000), vec![analyzer.clone()]);

        let slow = sample("slow");
        let next = sample("next");
        coordinator.submit(slow.clone()).unwrap();
        coordinator.submit(next.clone()).unwrap();

        coordinator.wait_for_file(&slow.id).await;
        let task = &coordinator.tasks(&slow.id)[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error,
            Some(AnalysisError::Timeout {
                technique: Technique::Signature,
                timeout_ms: 1_000,
            })
        );

        coordinator.wait_for_file(&next.id).await;
        assert_eq!(error_kind(&coordinator, &next.id), Some("timeout"));
        assert_eq!(*analyzer.started.lock(), vec!["slow", "next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(30));
        let coordinator = coordinator(bulkheads(1, 5, 60_000), vec![analyzer.clone()]);

        let running = sample("running");
        let queued = sample("queued");
        coordinator.submit(running.clone()).unwrap();
        coordinator.submit(queued.clone()).unwrap();

        coordinator.cancel(&queued.id);
        let summary = coordinator.task_status(&queued.id).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(error_kind(&coordinator, &queued.id), Some("cancelled"));

        coordinator.cancel(&running.id);
        coordinator.cancel(&running.id);
        let summary = coordinator.wait_for_file(&running.id).await.unwrap();
        assert_eq!(summary.running, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(error_kind(&coordinator, &running.id), Some("cancelled"));

        coordinator.cancel(&running.id);
        assert_eq!(coordinator.task_status(&running.id), Some(summary));
        assert_eq!(*analyzer.started.lock(), vec!["running"]);
        assert_eq!(coordinator.resource_usage().active_analyses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_does_not_block_siblings() {
        let ok = FakeAnalyzer::new(Technique::Static, Duration::from_millis(100));
        let bad = FakeAnalyzer::new(Technique::Signature, Duration::from_millis(50)).failing();
        let coordinator = coordinator(bulkheads(2, 2, 60_000), vec![ok, bad]);

        let file = sample("mixed");
        coordinator.submit(file.clone()).unwrap();
        let summary = coordinator.wait_for_file(&file.id).await.unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let tasks = coordinator.tasks(&file.id);
        let failed = tasks.iter().find(|t| t.status == TaskStatus::Failed).unwrap();
        assert_eq!(failed.technique, Technique::Signature);
        assert_eq!(failed.error.as_ref().map(|e| e.kind()), Some("technique"));
        assert!(failed.duration_ms().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_submission_rejected() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_millis(10));
        let coordinator = coordinator(bulkheads(1, 1, 60_000), vec![analyzer]);

        let file = sample("twice");
        coordinator.submit(file.clone()).unwrap();
        assert_eq!(
            coordinator.submit(file.clone()),
            Err(AnalysisError::DuplicateFile(file.id.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_finished_only_after_terminal() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(1));
        let coordinator = coordinator(bulkheads(1, 1, 60_000), vec![analyzer]);

        let file = sample("gc");
        coordinator.submit(file.clone()).unwrap();
        assert!(coordinator.take_finished(&file.id).is_none());

        coordinator.wait_for_file(&file.id).await;
        let tasks = coordinator.take_finished(&file.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].result.is_some());

        assert!(coordinator.task_status(&file.id).is_none());
        assert!(coordinator.wait_for_file(&file.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_analyzer_fails_task() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_millis(10));
        let mut registry = AnalyzerRegistry::new();
        registry.register(analyzer);
        let coordinator = AnalysisCoordinator::new(
            &BulkheadsConfig::default(),
            vec![Technique::Signature, Technique::Dynamic],
            registry,
            Arc::new(MemoryAllocator::new(MemoryConfig::default())),
            ProgressReporter::disabled(),
        );

        let file = sample("partial");
        coordinator.submit(file.clone()).unwrap();
        let summary = coordinator.wait_for_file(&file.id).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let dynamic = coordinator
            .tasks(&file.id)
            .into_iter()
            .find(|t| t.technique == Technique::Dynamic)
            .unwrap();
        assert_eq!(dynamic.error, Some(AnalysisError::NoAnalyzer(Technique::Dynamic)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_start_and_terminal_events() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_millis(10));
        let mut registry = AnalyzerRegistry::new();
        registry.register(analyzer);
        let (reporter, mut rx) = ProgressReporter::channel(16);
        let coordinator = AnalysisCoordinator::new(
            &bulkheads(1, 1, 60_000),
            vec![Technique::Signature],
            registry,
            Arc::new(MemoryAllocator::new(MemoryConfig::default())),
            reporter,
        );

        let file = sample("events");
        coordinator.submit(file.clone()).unwrap();
        coordinator.wait_for_file(&file.id).await;

        let started: ProgressEvent = rx.recv().await.unwrap();
        assert_eq!(started.phase, ProgressPhase::Started);
        assert_eq!(started.progress, 0);
        assert_eq!(started.file_id, file.id);

        let done = rx.recv().await.unwrap();
        assert_eq!(done.phase, ProgressPhase::Completed);
        assert_eq!(done.progress, 100);
    }

    #[test]
    fn test_release_skips_orphaned_queue_entries() {
        let mut state = State::default();
        let mut bulkhead = Bulkhead::new(Technique::Signature, BulkheadConfig::new(1, 3, 1_000));
        assert_eq!(bulkhead.admit("busy"), Admission::Run);
        assert_eq!(bulkhead.admit("ghost-1"), Admission::Queued);
        assert_eq!(bulkhead.admit("ghost-2"), Admission::Queued);

        let file = Arc::new(sample("waiting"));
        let task = AnalysisTask::new(&file.id, Technique::Signature);
        let task_id = task.id.clone();
        assert_eq!(bulkhead.admit(&task_id), Admission::Queued);

        state.bulkheads.insert(Technique::Signature, bulkhead);
        state.tasks.insert(task_id.clone(), TaskEntry { task, token: None });
        state.files.insert(
            file.id.clone(),
            FileEntry {
                file: Arc::clone(&file),
                token: CancellationToken::new(),
                task_ids: vec![task_id.clone()],
                cancel_requested: false,
            },
        );

        let mut events = Vec::new();
        let launch = release_slot(&mut state, Technique::Signature, &mut events).unwrap();
        assert_eq!(launch.task_id, task_id);
        assert_eq!(state.tasks[&task_id].task.status, TaskStatus::Running);

        let status = state.bulkheads[&Technique::Signature].status();
        assert_eq!(status.active_count, 1);
        assert_eq!(status.queue_length, 0);

        // Only orphans left: the slot is simply freed.
        let mut bulkhead = Bulkhead::new(Technique::Static, BulkheadConfig::new(1, 2, 1_000));
        assert_eq!(bulkhead.admit("busy"), Admission::Run);
        assert_eq!(bulkhead.admit("ghost"), Admission::Queued);
        state.bulkheads.insert(Technique::Static, bulkhead);
        assert!(release_slot(&mut state, Technique::Static, &mut events).is_none());
        assert_eq!(state.bulkheads[&Technique::Static].active_count(), 0);
        assert_eq!(state.bulkheads[&Technique::Static].queue_length(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_shutdown_removes_queued_tasks() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(30));
        let coordinator = coordinator(bulkheads(1, 3, 600_000), vec![analyzer.clone()]);
        coordinator.shutdown();

        let first = sample("first");
        let queued = sample("queued");
        coordinator.submit(first.clone()).unwrap();
        coordinator.submit(queued.clone()).unwrap();
        assert_eq!(coordinator.task_status(&queued.id).unwrap().pending, 1);

        coordinator.cancel(&queued.id);
        let summary = coordinator.task_status(&queued.id).unwrap();
        assert_eq!(summary.pending, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(error_kind(&coordinator, &queued.id), Some("cancelled"));

        coordinator.wait_for_file(&first.id).await;
        assert_eq!(error_kind(&coordinator, &first.id), Some("cancelled"));
        assert!(!analyzer.started.lock().contains(&"queued".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let analyzer = FakeAnalyzer::new(Technique::Signature, Duration::from_secs(300));
        let coordinator = coordinator(bulkheads(1, 3, 600_000), vec![analyzer]);

        let files: Vec<AnalysisFile> = (0..3).map(|i| sample(&format!("s{}", i))).collect();
        for file in &files {
            coordinator.submit(file.clone()).unwrap();
        }

        coordinator.shutdown();
        for file in &files {
            let summary = coordinator.wait_for_file(&file.id).await.unwrap();
            assert_eq!(summary.failed, 1);
            assert_eq!(error_kind(&coordinator, &file.id), Some("cancelled"));
        }
    }
}
