//! In-memory cache of ensemble verdicts keyed by sample SHA-256.
//!
//! Every entry is charged to the memory allocator as a `cache` allocation.
//! When the allocator evicts that allocation under pressure, its release hook
//! drops the entry here too, so the map never holds more than the budget
//! accounts for.

use crate::memory::{AllocationKind, AllocationRequest, MemoryAllocator};
use crate::models::EnsembleResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct CachedVerdict {
    ensemble: EnsembleResult,
    inserted: Instant,
}

pub struct VerdictCache {
    memory: Arc<MemoryAllocator>,
    entries: Arc<Mutex<HashMap<String, CachedVerdict>>>,
    ttl: Duration,
}

impl VerdictCache {
    pub fn new(memory: Arc<MemoryAllocator>, ttl: Duration) -> Self {
        Self {
            memory,
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// A live verdict for this hash, if one was stored within the TTL and its
    /// allocation has not been evicted.
    pub fn get(&self, sha256: &str) -> Option<EnsembleResult> {
        let id = allocation_id(sha256);
        {
            let entries = self.entries.lock();
            let entry = entries.get(sha256)?;
            if entry.inserted.elapsed() <= self.ttl && self.memory.contains(&id) {
                debug!("Verdict cache hit for {}", sha256);
                return Some(entry.ensemble.clone());
            }
        }

        // Stale. Deallocating runs the release hook, which drops the entry.
        if !self.memory.deallocate(&id) {
            self.entries.lock().remove(sha256);
        }
        None
    }

    /// Store a verdict. Returns false when the budget has no room for it.
    pub fn insert(&self, ensemble: &EnsembleResult) -> bool {
        let sha256 = ensemble.file_hash.clone();
        let id = allocation_id(&sha256);
        if self.memory.contains(&id) {
            return true;
        }

        let size = serde_json::to_vec(ensemble)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);

        let entries = Arc::clone(&self.entries);
        let key = sha256.clone();
        let request = AllocationRequest::new(id.clone(), size, AllocationKind::Cache)
            .description(format!("ensemble verdict for {}", sha256))
            .on_release(move || {
                entries.lock().remove(&key);
                Ok(())
            });

        // Allocate before touching the map: eviction may run release hooks
        // that take the entries lock.
        if let Err(e) = self.memory.allocate(request) {
            debug!("Not caching verdict for {}: {}", sha256, e);
            return false;
        }

        self.entries.lock().insert(
            sha256,
            CachedVerdict {
                ensemble: ensemble.clone(),
                inserted: Instant::now(),
            },
        );
        true
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

fn allocation_id(sha256: &str) -> String {
    format!("verdict:{}", sha256)
}
