//! Ensemble consensus over AI provider verdicts.

pub mod engine;

pub use engine::ConsensusEngine;
