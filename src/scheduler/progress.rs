//! Progress events published while tasks run.
//!
//! Events travel over a bounded channel. Publishing never waits: when the
//! consumer falls behind, events are dropped.

use crate::models::Technique;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Started,
    Running,
    Completed,
    Failed,
}

impl ProgressPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressPhase::Completed | ProgressPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub file_id: String,
    pub technique: Technique,
    pub phase: ProgressPhase,
    /// Percentage in 0..=100.
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<u64>,
}

/// Sending half of the progress channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            debug!("Dropped progress event: {}", e);
        }
    }

    /// Scope this reporter to one task.
    pub fn for_task(&self, file_id: &str, technique: Technique) -> TaskProgress {
        TaskProgress {
            reporter: self.clone(),
            file_id: file_id.to_string(),
            technique,
        }
    }
}

/// Progress handle handed to an analyzer for its own checkpoints.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    reporter: ProgressReporter,
    file_id: String,
    technique: Technique,
}

impl TaskProgress {
    pub fn emit(&self, phase: ProgressPhase, progress: u8, message: impl Into<String>) {
        self.reporter.publish(ProgressEvent {
            file_id: self.file_id.clone(),
            technique: self.technique,
            phase,
            progress: progress.min(100),
            message: message.into(),
            estimated_time_remaining_ms: None,
        });
    }

    /// Intermediate checkpoint from inside an analyzer.
    pub fn update(&self, progress: u8, message: impl Into<String>) {
        self.emit(ProgressPhase::Running, progress, message);
    }

    pub fn update_with_eta(&self, progress: u8, message: impl Into<String>, eta_ms: u64) {
        self.reporter.publish(ProgressEvent {
            file_id: self.file_id.clone(),
            technique: self.technique,
            phase: ProgressPhase::Running,
            progress: progress.min(100),
            message: message.into(),
            estimated_time_remaining_ms: Some(eta_ms),
        });
    }
}
