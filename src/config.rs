//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.samplegate.toml` files. Every scheduling, consensus and memory
//! constant is exposed here as a tunable.

use crate::models::{Technique, ThreatLevel};
use crate::providers::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".samplegate.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Per-technique admission limits.
    #[serde(default)]
    pub bulkheads: BulkheadsConfig,

    /// Ensemble consensus settings.
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Memory budget settings.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// AI providers queried by the ensemble.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Sandbox used for dynamic execution.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Embedded analysis modules.
    #[serde(default)]
    pub module: ModuleConfig,

    /// Signature rules.
    #[serde(default)]
    pub signature: SignatureConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Techniques applied to every submitted file.
    #[serde(default = "default_techniques")]
    pub techniques: Vec<Technique>,

    /// Capacity of the bounded progress event channel.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,

    /// Samples larger than this are skipped by the scanner.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            techniques: default_techniques(),
            progress_buffer: default_progress_buffer(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_output() -> String {
    "samplegate_report.md".to_string()
}

fn default_techniques() -> Vec<Technique> {
    Technique::ALL.to_vec()
}

fn default_progress_buffer() -> usize {
    256
}

fn default_max_file_size() -> u64 {
    256 * 1024 * 1024
}

/// Admission limits for one technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Tasks allowed to run at once.
    pub max_concurrent: usize,
    /// Tasks allowed to wait for a slot.
    pub queue_capacity: usize,
    /// Deadline per running task.
    pub timeout_ms: u64,
}

impl BulkheadConfig {
    pub const fn new(max_concurrent: usize, queue_capacity: usize, timeout_ms: u64) -> Self {
        Self {
            max_concurrent,
            queue_capacity,
            timeout_ms,
        }
    }
}

/// Bulkhead per technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadsConfig {
    #[serde(rename = "static", default = "default_static_bulkhead")]
    pub static_analysis: BulkheadConfig,

    /// Resource-heavy, serialized by default.
    #[serde(default = "default_dynamic_bulkhead")]
    pub dynamic: BulkheadConfig,

    /// Bounded by provider rate limits.
    #[serde(default = "default_ai_bulkhead")]
    pub ai: BulkheadConfig,

    #[serde(default = "default_signature_bulkhead")]
    pub signature: BulkheadConfig,

    #[serde(default = "default_module_bulkhead")]
    pub module: BulkheadConfig,
}

impl Default for BulkheadsConfig {
    fn default() -> Self {
        Self {
            static_analysis: default_static_bulkhead(),
            dynamic: default_dynamic_bulkhead(),
            ai: default_ai_bulkhead(),
            signature: default_signature_bulkhead(),
            module: default_module_bulkhead(),
        }
    }
}

impl BulkheadsConfig {
    pub fn for_technique(&self, technique: Technique) -> BulkheadConfig {
        match technique {
            Technique::Static => self.static_analysis,
            Technique::Dynamic => self.dynamic,
            Technique::Ai => self.ai,
            Technique::Signature => self.signature,
            Technique::Module => self.module,
        }
    }
}

fn default_static_bulkhead() -> BulkheadConfig {
    BulkheadConfig::new(3, 10, 30_000)
}

fn default_dynamic_bulkhead() -> BulkheadConfig {
    BulkheadConfig::new(1, 5, 300_000)
}

fn default_ai_bulkhead() -> BulkheadConfig {
    BulkheadConfig::new(2, 20, 60_000)
}

fn default_signature_bulkhead() -> BulkheadConfig {
    BulkheadConfig::new(2, 10, 45_000)
}

fn default_module_bulkhead() -> BulkheadConfig {
    BulkheadConfig::new(2, 10, 60_000)
}

/// Ensemble consensus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Reserved. Accepted for compatibility, not read by aggregation.
    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,

    /// Confidence-weighted mean (true) or plurality vote (false).
    #[serde(default = "default_true")]
    pub weighted_voting: bool,

    /// Usable provider verdicts needed to form a consensus.
    #[serde(default = "default_required_providers")]
    pub required_providers: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_agreement: default_min_agreement(),
            weighted_voting: true,
            required_providers: default_required_providers(),
        }
    }
}

fn default_min_agreement() -> f64 {
    0.7
}

fn default_required_providers() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// Memory budget and eviction tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Process-wide byte budget.
    #[serde(default = "default_total_limit")]
    pub total_limit_bytes: u64,

    /// Cache entries older than this are evictable.
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age_secs: u64,

    /// File entries older than this are evictable.
    #[serde(default = "default_file_max_age")]
    pub file_max_age_secs: u64,

    /// Utilization at which pressure becomes medium.
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,

    /// Utilization at which pressure becomes high.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    /// Utilization at which pressure becomes critical.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Period of the background pressure sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Fraction of the limit a sweep tries to reclaim.
    #[serde(default = "default_sweep_target_ratio")]
    pub sweep_target_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_limit_bytes: default_total_limit(),
            cache_max_age_secs: default_cache_max_age(),
            file_max_age_secs: default_file_max_age(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            critical_threshold: default_critical_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_target_ratio: default_sweep_target_ratio(),
        }
    }
}

fn default_total_limit() -> u64 {
    500 * 1024 * 1024
}

fn default_cache_max_age() -> u64 {
    300
}

fn default_file_max_age() -> u64 {
    default_cache_max_age() / 2
}

fn default_medium_threshold() -> f64 {
    0.5
}

fn default_high_threshold() -> f64 {
    0.7
}

fn default_critical_threshold() -> f64 {
    0.9
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_sweep_target_ratio() -> f64 {
    0.3
}

/// One AI provider endpoint (Ollama-compatible chat API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name reported in verdicts.
    pub name: String,

    /// API base URL.
    #[serde(default = "default_provider_url")]
    pub url: String,

    /// Model to query.
    pub model: String,

    /// Request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Half-open successes that close it again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Seconds the circuit stays open.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,

    /// Retries after a transient failure (timeout, connect, 429, 5xx).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Upper bound for any backoff delay in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            model: model.into(),
            timeout_secs: default_provider_timeout(),
            temperature: default_temperature(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_secs: default_open_secs(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_retry_multiplier(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            multiplier: self.retry_multiplier,
        }
    }
}

fn default_provider_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_provider_timeout() -> u64 {
    55
}

fn default_temperature() -> f32 {
    0.1
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

/// Sandbox settings for dynamic execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container to execute samples in. Dynamic analysis is disabled when unset.
    #[serde(default)]
    pub container: Option<String>,

    /// Command template; `{path}` is replaced with the in-container sample path.
    #[serde(default = "default_sandbox_command")]
    pub command: Vec<String>,

    /// Directory the sample is expected at inside the container.
    #[serde(default = "default_sandbox_dir")]
    pub sample_dir: String,

    /// Timeout handed to the sandbox itself.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            container: None,
            command: default_sandbox_command(),
            sample_dir: default_sandbox_dir(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

fn default_sandbox_command() -> Vec<String> {
    vec!["/usr/bin/timeout".to_string(), "240".to_string(), "{path}".to_string()]
}

fn default_sandbox_dir() -> String {
    "/samples".to_string()
}

fn default_sandbox_timeout() -> u64 {
    270
}

/// Embedded analysis module settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Program that hosts modules. Module analysis is disabled when unset.
    #[serde(default)]
    pub runner: Option<String>,

    /// Modules run against every sample.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

/// One module function to invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: String,
    pub function: String,
    /// Memory reserved with the allocator while the module is loaded.
    #[serde(default = "default_module_memory")]
    pub memory_bytes: u64,
}

fn default_module_memory() -> u64 {
    64 * 1024 * 1024
}

/// Signature scanning rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_signature_rules")]
    pub rules: Vec<SignatureRule>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            rules: default_signature_rules(),
        }
    }
}

/// A literal byte or string pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRule {
    pub name: String,
    pub pattern: String,
    /// Pattern is hex-encoded bytes rather than text.
    #[serde(default)]
    pub hex: bool,
    #[serde(default = "default_rule_severity")]
    pub severity: ThreatLevel,
}

impl SignatureRule {
    pub fn text(name: &str, pattern: &str, severity: ThreatLevel) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            hex: false,
            severity,
        }
    }
}

fn default_rule_severity() -> ThreatLevel {
    ThreatLevel::Suspicious
}

fn default_signature_rules() -> Vec<SignatureRule> {
    vec![
        SignatureRule::text("upx_packed", "UPX!", ThreatLevel::Suspicious),
        SignatureRule::text("eicar_test", "EICAR-STANDARD-ANTIVIRUS-TEST-FILE", ThreatLevel::Malicious),
        SignatureRule::text("powershell_encoded", "-EncodedCommand", ThreatLevel::Suspicious),
        SignatureRule::text("mimikatz", "sekurlsa::logonpasswords", ThreatLevel::Critical),
        SignatureRule::text("vssadmin_delete", "vssadmin delete shadows", ThreatLevel::Malicious),
    ]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the scheduler and allocator cannot honour.
    pub fn validate(&self) -> Result<()> {
        for technique in Technique::ALL {
            let bulkhead = self.bulkheads.for_technique(technique);
            if bulkhead.max_concurrent == 0 {
                anyhow::bail!("{} bulkhead needs max_concurrent >= 1", technique);
            }
            if bulkhead.timeout_ms == 0 {
                anyhow::bail!("{} bulkhead needs a non-zero timeout", technique);
            }
        }

        let m = &self.memory;
        if m.total_limit_bytes == 0 {
            anyhow::bail!("memory.total_limit_bytes must be positive");
        }
        if !(m.medium_threshold <= m.high_threshold && m.high_threshold <= m.critical_threshold) {
            anyhow::bail!("memory pressure thresholds must be ascending");
        }
        if !(0.0..=1.0).contains(&m.sweep_target_ratio) {
            anyhow::bail!("memory.sweep_target_ratio must be within 0.0..=1.0");
        }

        for provider in &self.providers {
            if provider.retry_multiplier < 1.0 {
                anyhow::bail!("provider {}: retry_multiplier must be >= 1.0", provider.name);
            }
            if provider.retry_initial_ms > provider.retry_max_ms {
                anyhow::bail!("provider {}: retry_initial_ms exceeds retry_max_ms", provider.name);
            }
        }

        if self.general.progress_buffer == 0 {
            anyhow::bail!("general.progress_buffer must be at least 1");
        }

        Ok(())
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref techniques) = args.techniques {
            self.general.techniques = techniques.clone();
        }

        if let Some(ref url) = args.ollama_url {
            let models = if args.models.is_empty() {
                vec!["llama3.2:latest".to_string()]
            } else {
                args.models.clone()
            };
            self.providers = models
                .iter()
                .map(|model| ProviderConfig::new(model.clone(), url.clone(), model.clone()))
                .collect();
        }

        if let Some(required) = args.required_providers {
            self.consensus.required_providers = required;
        }

        if let Some(ref container) = args.container {
            self.sandbox.container = Some(container.clone());
        }

        if let Some(mb) = args.memory_limit_mb {
            self.memory.total_limit_bytes = mb * 1024 * 1024;
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
