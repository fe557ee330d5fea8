//! Bulkhead scheduling of analysis tasks.

pub mod analyzer;
pub mod bulkhead;
pub mod coordinator;
pub mod intake;
pub mod progress;

pub use analyzer::{Analyzer, AnalyzerRegistry, TaskContext};
pub use coordinator::AnalysisCoordinator;
pub use intake::{analyze_all, intake_window};
pub use progress::{ProgressEvent, ProgressPhase, ProgressReporter};
