//! Error taxonomy for analysis orchestration.
//!
//! Task-level failures are recorded on the task itself and never abort
//! sibling tasks. Collaborator calls use `anyhow` internally and are mapped
//! into this type at the technique boundary.

use crate::models::Technique;
use serde::Serialize;
use thiserror::Error;

/// Errors produced by the coordinator, the consensus engine, the allocator
/// and the technique analyzers.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AnalysisError {
    /// Admission rejected: bulkhead saturated and its queue full.
    #[error("{technique} bulkhead queue is full ({capacity} queued)")]
    QueueFull { technique: Technique, capacity: usize },

    /// Deadline exceeded while the task was running.
    #[error("{technique} analysis timed out after {timeout_ms}ms")]
    Timeout { technique: Technique, timeout_ms: u64 },

    /// Explicit cancellation of the owning file.
    #[error("analysis cancelled")]
    Cancelled,

    /// A single AI provider call failed.
    #[error("provider {provider} failed: {message}")]
    ProviderError { provider: String, message: String },

    /// Too few providers survived to form a consensus.
    #[error("insufficient providers: {available} usable, {required} required")]
    InsufficientProviders { available: usize, required: usize },

    /// The allocator could not satisfy a request even after eviction.
    #[error("allocation '{id}' of {requested} bytes denied ({available} bytes available)")]
    AllocationDenied {
        id: String,
        requested: u64,
        available: u64,
    },

    #[error("allocation '{0}' already exists")]
    DuplicateAllocation(String),

    #[error("file {0} is already registered")]
    DuplicateFile(String),

    #[error("no analyzer registered for {0}")]
    NoAnalyzer(Technique),

    /// Technique-internal failure.
    #[error("{technique} analysis failed: {message}")]
    Technique { technique: Technique, message: String },

    #[error("I/O error: {0}")]
    Io(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

impl AnalysisError {
    /// Create a technique-internal failure.
    pub fn technique(technique: Technique, message: impl Into<String>) -> Self {
        Self::Technique {
            technique,
            message: message.into(),
        }
    }

    /// Create a provider failure.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Stable classification string for task records and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::ProviderError { .. } => "provider_error",
            Self::InsufficientProviders { .. } => "insufficient_providers",
            Self::AllocationDenied { .. } => "allocation_denied",
            Self::DuplicateAllocation(_) => "duplicate_allocation",
            Self::DuplicateFile(_) => "duplicate_file",
            Self::NoAnalyzer(_) => "no_analyzer",
            Self::Technique { .. } => "technique",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
