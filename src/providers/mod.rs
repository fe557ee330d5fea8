//! Adapters for the external collaborators analyzers call out to.

pub mod circuit_breaker;
pub mod module_runner;
pub mod ollama;
pub mod retry;
pub mod sandbox;

use crate::models::ProviderResult;
use async_trait::async_trait;

pub use circuit_breaker::CircuitBreaker;
pub use module_runner::{ModuleInvoker, ProcessModuleRunner};
pub use ollama::OllamaProvider;
pub use retry::RetryPolicy;
pub use sandbox::{DockerSandbox, ExecOutput, SandboxExecutor};

/// What an AI provider is shown about a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub file_name: String,
    pub file_size: u64,
    pub declared_type: String,
    pub sha256: String,
    /// Printable strings pulled from the content, truncated.
    pub strings: Vec<String>,
    /// Leading bytes rendered as hex.
    pub header_hex: String,
}

/// One AI classifier. Clients apply their own retry policy; callers never retry.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, request: &ProviderRequest) -> anyhow::Result<ProviderResult>;
}
