//! Per-technique admission control.
//!
//! A bulkhead is plain bookkeeping: a slot counter and a FIFO of waiting task
//! ids. The coordinator owns every bulkhead behind its state lock, so nothing
//! here synchronizes or awaits.

use crate::config::BulkheadConfig;
use crate::models::{BulkheadStatus, Technique};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of offering a task to a bulkhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the task must start now.
    Run,
    /// Appended to the tail of the queue.
    Queued,
    /// Saturated with a full queue.
    Rejected,
}

#[derive(Debug)]
pub struct Bulkhead {
    technique: Technique,
    config: BulkheadConfig,
    active: usize,
    queue: VecDeque<String>,
}

impl Bulkhead {
    pub fn new(technique: Technique, config: BulkheadConfig) -> Self {
        Self {
            technique,
            config,
            active: 0,
            queue: VecDeque::with_capacity(config.queue_capacity),
        }
    }

    pub fn admit(&mut self, task_id: &str) -> Admission {
        if self.active < self.config.max_concurrent {
            self.active += 1;
            Admission::Run
        } else if self.queue.len() < self.config.queue_capacity {
            self.queue.push_back(task_id.to_string());
            Admission::Queued
        } else {
            Admission::Rejected
        }
    }

    /// Free one slot. If a task is waiting, the slot passes straight to the
    /// queue head and its id is returned for starting.
    pub fn release(&mut self) -> Option<String> {
        self.active = self.active.saturating_sub(1);
        let next = self.queue.pop_front()?;
        self.active += 1;
        Some(next)
    }

    /// Drop a waiting task without running it.
    pub fn remove_queued(&mut self, task_id: &str) -> bool {
        match self.queue.iter().position(|id| id == task_id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn status(&self) -> BulkheadStatus {
        BulkheadStatus {
            technique: self.technique,
            queue_length: self.queue.len(),
            active_count: self.active,
            max_concurrent: self.config.max_concurrent,
            queue_capacity: self.config.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max_concurrent: usize, queue_capacity: usize) -> Bulkhead {
        Bulkhead::new(
            Technique::Static,
            BulkheadConfig::new(max_concurrent, queue_capacity, 1_000),
        )
    }

    #[test]
    fn test_run_then_queue_then_reject() {
        let mut b = bulkhead(2, 1);
        assert_eq!(b.admit("t1"), Admission::Run);
        assert_eq!(b.admit("t2"), Admission::Run);
        assert_eq!(b.admit("t3"), Admission::Queued);
        assert_eq!(b.admit("t4"), Admission::Rejected);

        let status = b.status();
        assert_eq!(status.active_count, 2);
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.max_concurrent, 2);
    }

    #[test]
    fn test_release_hands_slot_to_queue_head() {
        let mut b = bulkhead(1, 3);
        b.admit("t1");
        b.admit("t2");
        b.admit("t3");

        assert_eq!(b.release().as_deref(), Some("t2"));
        assert_eq!(b.active_count(), 1);
        assert_eq!(b.release().as_deref(), Some("t3"));
        assert_eq!(b.release(), None);
        assert_eq!(b.active_count(), 0);
    }

    #[test]
    fn test_remove_queued() {
        let mut b = bulkhead(1, 3);
        b.admit("t1");
        b.admit("t2");
        b.admit("t3");

        assert!(b.remove_queued("t2"));
        assert!(!b.remove_queued("t2"));
        assert!(!b.remove_queued("t1"));
        assert_eq!(b.release().as_deref(), Some("t3"));
    }

    #[test]
    fn test_bounds_hold_under_churn() {
        let mut b = bulkhead(3, 4);
        for i in 0..100 {
            b.admit(&format!("t{}", i));
            if i % 3 == 0 {
                b.release();
            }
            assert!(b.active_count() <= 3);
            assert!(b.queue_length() <= 4);
        }
    }

    #[test]
    fn test_zero_capacity_queue_rejects_when_busy() {
        let mut b = bulkhead(1, 0);
        assert_eq!(b.admit("t1"), Admission::Run);
        assert_eq!(b.admit("t2"), Admission::Rejected);
        assert_eq!(b.timeout(), Duration::from_secs(1));
    }
}
