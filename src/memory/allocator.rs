//! Pressure-aware memory budget for analysis resources.
//!
//! Every loaded module, buffered file, in-flight analysis buffer and cached
//! result is recorded here against one process-wide byte limit. The limit is
//! enforced when allocating: a request that does not fit after eviction is
//! refused and nothing is recorded.

use crate::config::MemoryConfig;
use crate::error::{AnalysisError, AnalysisResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an allocation backs. `Module` and `Analysis` entries are never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationKind {
    Module,
    File,
    Analysis,
    Cache,
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationKind::Module => write!(f, "module"),
            AllocationKind::File => write!(f, "file"),
            AllocationKind::Analysis => write!(f, "analysis"),
            AllocationKind::Cache => write!(f, "cache"),
        }
    }
}

/// Discretized utilization of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureLevel::Low => write!(f, "low"),
            PressureLevel::Medium => write!(f, "medium"),
            PressureLevel::High => write!(f, "high"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot returned by [`MemoryAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_allocated: u64,
    pub total_limit: u64,
    pub pressure: PressureLevel,
    pub allocation_count: usize,
}

impl MemoryStats {
    pub fn utilization(&self) -> f64 {
        if self.total_limit == 0 {
            return 1.0;
        }
        self.total_allocated as f64 / self.total_limit as f64
    }
}

/// Runs when an allocation is released, explicitly or by eviction.
pub type CleanupCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Notified with fresh stats after every allocate and deallocate.
pub type PressureObserver = Arc<dyn Fn(MemoryStats) + Send + Sync>;

/// A request to record an allocation.
pub struct AllocationRequest {
    pub id: String,
    pub size: u64,
    pub kind: AllocationKind,
    pub description: Option<String>,
    pub cleanup: Option<CleanupCallback>,
}

impl AllocationRequest {
    pub fn new(id: impl Into<String>, size: u64, kind: AllocationKind) -> Self {
        Self {
            id: id.into(),
            size,
            kind,
            description: None,
            cleanup: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn on_release<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

struct MemoryAllocation {
    size: u64,
    kind: AllocationKind,
    timestamp: Instant,
    description: Option<String>,
    cleanup: Option<CleanupCallback>,
}

#[derive(Default)]
struct AllocatorState {
    allocations: HashMap<String, MemoryAllocation>,
    total_allocated: u64,
}

impl AllocatorState {
    fn remove(&mut self, id: &str) -> Option<MemoryAllocation> {
        let allocation = self.allocations.remove(id)?;
        self.total_allocated -= allocation.size;
        Some(allocation)
    }
}

/// Subscription handle returned by [`MemoryAllocator::on_pressure_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Process-wide memory budget. Share it as `Arc<MemoryAllocator>`.
pub struct MemoryAllocator {
    config: MemoryConfig,
    state: Mutex<AllocatorState>,
    observers: Mutex<Vec<(SubscriptionId, PressureObserver)>>,
    next_subscription: AtomicU64,
}

impl MemoryAllocator {
    pub fn new(config: MemoryConfig) -> Self {
        info!(
            "Memory allocator limit: {} MiB",
            config.total_limit_bytes / (1024 * 1024)
        );
        Self {
            config,
            state: Mutex::new(AllocatorState::default()),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Record an allocation if it fits the budget, evicting stale entries first
    /// when it does not.
    pub fn allocate(&self, request: AllocationRequest) -> AnalysisResult<()> {
        self.allocate_at(request, Instant::now())
    }

    pub(crate) fn allocate_at(&self, request: AllocationRequest, now: Instant) -> AnalysisResult<()> {
        let limit = self.config.total_limit_bytes;

        let (outcome, evicted) = {
            let mut state = self.state.lock();

            if state.allocations.contains_key(&request.id) {
                return Err(AnalysisError::DuplicateAllocation(request.id));
            }

            let mut evicted = Vec::new();
            if state.total_allocated.saturating_add(request.size) > limit {
                evicted = self.evict_locked(&mut state, request.size, now);
            }

            let outcome = if state.total_allocated.saturating_add(request.size) <= limit {
                state.total_allocated += request.size;
                state.allocations.insert(
                    request.id.clone(),
                    MemoryAllocation {
                        size: request.size,
                        kind: request.kind,
                        timestamp: now,
                        description: request.description,
                        cleanup: request.cleanup,
                    },
                );
                debug!(
                    "Allocated {} ({} bytes, {}), total {}/{}",
                    request.id, request.size, request.kind, state.total_allocated, limit
                );
                Ok(())
            } else {
                warn!(
                    "Allocation {} of {} bytes denied, {} of {} bytes in use",
                    request.id, request.size, state.total_allocated, limit
                );
                Err(AnalysisError::AllocationDenied {
                    id: request.id,
                    requested: request.size,
                    available: limit - state.total_allocated.min(limit),
                })
            };

            (outcome, evicted)
        };

        release_all(evicted);
        self.notify();
        outcome
    }

    /// Release an allocation, running its cleanup callback. Returns false if
    /// the id is unknown.
    pub fn deallocate(&self, id: &str) -> bool {
        let removed = self.state.lock().remove(id);

        match removed {
            Some(allocation) => {
                debug!("Deallocated {} ({} bytes)", id, allocation.size);
                release(id, allocation);
                self.notify();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        self.stats_locked(&state)
    }

    /// Whether an allocation with this id is live.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().allocations.contains_key(id)
    }

    /// Subscribe to stats published after every allocate and deallocate.
    pub fn on_pressure_change<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(MemoryStats) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Evict stale cache entries, then stale file entries, oldest first, until
    /// `target_bytes` are freed or nothing eligible remains. Returns bytes freed.
    #[allow(dead_code)] // The sweeper calls run_eviction_at directly
    pub fn run_eviction(&self, target_bytes: u64) -> u64 {
        self.run_eviction_at(target_bytes, Instant::now())
    }

    pub(crate) fn run_eviction_at(&self, target_bytes: u64, now: Instant) -> u64 {
        let evicted = {
            let mut state = self.state.lock();
            self.evict_locked(&mut state, target_bytes, now)
        };
        let freed = evicted.iter().map(|(_, a)| a.size).sum();
        if !evicted.is_empty() {
            release_all(evicted);
            self.notify();
        }
        freed
    }

    /// One background pass: reclaim proactively under high pressure.
    pub(crate) fn sweep_at(&self, now: Instant) -> u64 {
        let stats = self.stats();
        if stats.pressure < PressureLevel::High {
            return 0;
        }
        let target = (self.config.total_limit_bytes as f64 * self.config.sweep_target_ratio) as u64;
        let freed = self.run_eviction_at(target, now);
        if freed > 0 {
            info!(
                "Pressure {} sweep freed {} bytes (target {})",
                stats.pressure, freed, target
            );
        }
        freed
    }

    /// Allocate and return a guard that deallocates when dropped.
    pub fn reserve(self: &Arc<Self>, request: AllocationRequest) -> AnalysisResult<Reservation> {
        let id = request.id.clone();
        let size = request.size;
        self.allocate(request)?;
        Ok(Reservation {
            allocator: Arc::clone(self),
            id,
            size,
        })
    }

    /// Spawn the periodic pressure sweep. Stops when `shutdown` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let allocator = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Memory sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        allocator.sweep_at(Instant::now());
                    }
                }
            }
        })
    }

    fn evict_locked(
        &self,
        state: &mut AllocatorState,
        target_bytes: u64,
        now: Instant,
    ) -> Vec<(String, MemoryAllocation)> {
        let cache_age = Duration::from_secs(self.config.cache_max_age_secs);
        let file_age = Duration::from_secs(self.config.file_max_age_secs);

        let mut evicted = Vec::new();
        let mut freed = 0u64;

        for (kind, max_age) in [
            (AllocationKind::Cache, cache_age),
            (AllocationKind::File, file_age),
        ] {
            if freed >= target_bytes {
                break;
            }

            let mut candidates: Vec<(String, Instant)> = state
                .allocations
                .iter()
                .filter(|(_, a)| a.kind == kind && now.saturating_duration_since(a.timestamp) > max_age)
                .map(|(id, a)| (id.clone(), a.timestamp))
                .collect();
            candidates.sort_by_key(|(_, ts)| *ts);

            for (id, _) in candidates {
                if freed >= target_bytes {
                    break;
                }
                if let Some(allocation) = state.remove(&id) {
                    debug!(
                        "Evicting {} ({} bytes, {}{})",
                        id,
                        allocation.size,
                        allocation.kind,
                        allocation
                            .description
                            .as_deref()
                            .map(|d| format!(": {}", d))
                            .unwrap_or_default()
                    );
                    freed += allocation.size;
                    evicted.push((id, allocation));
                }
            }
        }

        evicted
    }

    fn stats_locked(&self, state: &AllocatorState) -> MemoryStats {
        MemoryStats {
            total_allocated: state.total_allocated,
            total_limit: self.config.total_limit_bytes,
            pressure: self.pressure_for(state.total_allocated),
            allocation_count: state.allocations.len(),
        }
    }

    fn pressure_for(&self, allocated: u64) -> PressureLevel {
        let limit = self.config.total_limit_bytes;
        let ratio = if limit == 0 {
            1.0
        } else {
            allocated as f64 / limit as f64
        };

        if ratio < self.config.medium_threshold {
            PressureLevel::Low
        } else if ratio < self.config.high_threshold {
            PressureLevel::Medium
        } else if ratio < self.config.critical_threshold {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }

    fn notify(&self) {
        let observers: Vec<PressureObserver> =
            self.observers.lock().iter().map(|(_, o)| Arc::clone(o)).collect();
        if observers.is_empty() {
            return;
        }
        let stats = self.stats();
        for observer in observers {
            observer(stats);
        }
    }
}

/// Scoped allocation returned by [`MemoryAllocator::reserve`].
pub struct Reservation {
    allocator: Arc<MemoryAllocator>,
    id: String,
    size: u64,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Already gone if it was evicted.
        self.allocator.deallocate(&self.id);
    }
}

fn release_all(evicted: Vec<(String, MemoryAllocation)>) {
    for (id, allocation) in evicted {
        release(&id, allocation);
    }
}

// Callback failures are logged, never propagated.
fn release(id: &str, allocation: MemoryAllocation) {
    let Some(cleanup) = allocation.cleanup else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(cleanup)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Cleanup for {} failed: {:#}", id, e),
        Err(_) => warn!("Cleanup for {} panicked", id),
    }
}
