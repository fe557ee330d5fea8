//! Multi-provider AI classification reconciled by the consensus engine.

use crate::cache::VerdictCache;
use crate::consensus::ConsensusEngine;
use crate::error::{AnalysisError, AnalysisResult};
use crate::memory::{AllocationKind, AllocationRequest};
use crate::models::{AnalysisFile, ProviderResult, Technique, TechniqueResult};
use crate::providers::{AiProvider, CircuitBreaker, ProviderRequest};
use crate::scheduler::{Analyzer, TaskContext};
use crate::techniques::read_sample;
use crate::techniques::static_analysis::{extract_strings, MIN_STRING_LEN};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_PROMPT_STRINGS: usize = 60;
const MAX_STRING_CHARS: usize = 160;
const HEADER_BYTES: usize = 32;

struct GuardedProvider {
    provider: Arc<dyn AiProvider>,
    breaker: CircuitBreaker,
}

pub struct AiAnalyzer {
    engine: ConsensusEngine,
    providers: Vec<GuardedProvider>,
    cache: Option<VerdictCache>,
}

impl AiAnalyzer {
    pub fn new(engine: ConsensusEngine) -> Self {
        Self {
            engine,
            providers: Vec::new(),
            cache: None,
        }
    }

    /// Reuse verdicts for samples whose hash was already classified.
    pub fn with_cache(mut self, cache: VerdictCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn AiProvider>, breaker: CircuitBreaker) -> Self {
        self.providers.push(GuardedProvider { provider, breaker });
        self
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    async fn ask(&self, guarded: &GuardedProvider, request: &ProviderRequest) -> ProviderResult {
        let name = guarded.provider.name().to_string();
        match guarded.breaker.call(guarded.provider.analyze(request)).await {
            Ok(mut result) => {
                result.provider = name;
                result
            }
            Err(e) => {
                let error = AnalysisError::provider(&name, format!("{:#}", e));
                warn!("{}", error);
                ProviderResult::failed(name, error.to_string())
            }
        }
    }
}

#[async_trait]
impl Analyzer for AiAnalyzer {
    fn technique(&self) -> Technique {
        Technique::Ai
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult> {
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&file.sha256)) {
            info!("Reusing cached AI verdict for {}", file.name);
            ctx.progress.update(90, "cached verdict");
            return Ok(TechniqueResult::Ai(hit));
        }

        let request = {
            let (content, _reservation) = read_sample(&ctx, &file).await?;
            build_request(&file, &content)
        };

        let buffer = request_bytes(&request) * self.providers.len().max(1) as u64;
        let _buffer = ctx.memory.reserve(
            AllocationRequest::new(ctx.allocation_id("ensemble"), buffer, AllocationKind::Analysis)
                .description(format!("ensemble prompts for {}", file.name)),
        )?;

        ctx.progress.update(
            10,
            format!("querying {} providers", self.providers.len()),
        );
        let calls = self.providers.iter().map(|p| self.ask(p, &request));
        let results = ctx.cancellable(join_all(calls)).await?;

        let failed = results.iter().filter(|r| !r.is_usable()).count();
        info!(
            "{} of {} providers answered for {}",
            results.len() - failed,
            results.len(),
            file.name
        );
        ctx.progress.update(80, "building consensus");

        let ensemble = self.engine.aggregate(&file.sha256, results, Utc::now())?;
        if let Some(cache) = &self.cache {
            if cache.insert(&ensemble) {
                debug!("Cached verdict for {} ({} entries)", file.name, cache.entry_count());
            }
        }
        Ok(TechniqueResult::Ai(ensemble))
    }
}

fn build_request(file: &AnalysisFile, content: &[u8]) -> ProviderRequest {
    let strings = extract_strings(content, MIN_STRING_LEN)
        .into_iter()
        .take(MAX_PROMPT_STRINGS)
        .map(|s| s.chars().take(MAX_STRING_CHARS).collect())
        .collect();

    let header_hex = content
        .iter()
        .take(HEADER_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect();

    ProviderRequest {
        file_name: file.name.clone(),
        file_size: file.size,
        declared_type: file.declared_type.clone(),
        sha256: file.sha256.clone(),
        strings,
        header_hex,
    }
}

fn request_bytes(request: &ProviderRequest) -> u64 {
    let strings: usize = request.strings.iter().map(String::len).sum();
    (strings + request.header_hex.len() + request.file_name.len() + request.sha256.len()) as u64
}
