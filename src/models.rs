//! Data models for sample analysis.
//!
//! This module contains the core data structures shared by the coordinator,
//! the technique analyzers, the consensus engine and the report generator.

use crate::error::AnalysisError;
use crate::memory::MemoryStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Analysis technique. One task per technique is created for every file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technique {
    /// Static inspection of the file bytes
    Static,
    /// Sandboxed execution
    Dynamic,
    /// Multi-provider AI classification
    Ai,
    /// Signature scanning
    Signature,
    /// Embedded analysis module execution
    Module,
}

impl Technique {
    pub const ALL: [Technique; 5] = [
        Technique::Static,
        Technique::Dynamic,
        Technique::Ai,
        Technique::Signature,
        Technique::Module,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Static => "static",
            Technique::Dynamic => "dynamic",
            Technique::Ai => "ai",
            Technique::Signature => "signature",
            Technique::Module => "module",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "static" => Ok(Technique::Static),
            "dynamic" | "sandbox" => Ok(Technique::Dynamic),
            "ai" => Ok(Technique::Ai),
            "signature" | "yara" => Ok(Technique::Signature),
            "module" | "wasm" => Ok(Technique::Module),
            other => Err(format!("unknown technique: {}", other)),
        }
    }
}

/// Lifecycle status of an analysis task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Caller-side lifecycle of a submitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Received,
    Analyzing,
    Analyzed,
}

/// A sample submitted for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFile {
    /// Unique identifier.
    pub id: String,
    /// Location of the sample on disk.
    pub path: PathBuf,
    /// File name for display.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    /// Type declared by the submitter (extension-based by default).
    pub declared_type: String,
    /// Caller-owned lifecycle status.
    #[serde(default)]
    pub status: FileStatus,
}

impl AnalysisFile {
    /// Build a file record from bytes already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, content: &[u8]) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            declared_type: declared_type_for(&path),
            name,
            size: content.len() as u64,
            sha256: format!("{:x}", Sha256::digest(content)),
            path,
            status: FileStatus::Received,
        }
    }

    /// Read a sample from disk, hashing its content.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read sample {}", path.display()))?;
        Ok(Self::from_bytes(path, &content))
    }
}

fn declared_type_for(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Threat classification, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Safe,
    Suspicious,
    Malicious,
    Critical,
}

impl ThreatLevel {
    /// Enum order, used for tie-breaking.
    pub const ALL: [ThreatLevel; 4] = [
        ThreatLevel::Safe,
        ThreatLevel::Suspicious,
        ThreatLevel::Malicious,
        ThreatLevel::Critical,
    ];

    pub fn ordinal(&self) -> f64 {
        match self {
            ThreatLevel::Safe => 0.0,
            ThreatLevel::Suspicious => 1.0,
            ThreatLevel::Malicious => 2.0,
            ThreatLevel::Critical => 3.0,
        }
    }

    /// Round a mean ordinal back to a level.
    pub fn from_score(score: f64) -> Self {
        if score < 0.5 {
            ThreatLevel::Safe
        } else if score < 1.5 {
            ThreatLevel::Suspicious
        } else if score < 2.5 {
            ThreatLevel::Malicious
        } else {
            ThreatLevel::Critical
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            ThreatLevel::Safe => "🟢",
            ThreatLevel::Suspicious => "🟡",
            ThreatLevel::Malicious => "🟠",
            ThreatLevel::Critical => "🔴",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatLevel::Safe => write!(f, "safe"),
            ThreatLevel::Suspicious => write!(f, "suspicious"),
            ThreatLevel::Malicious => write!(f, "malicious"),
            ThreatLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" | "benign" | "clean" => Ok(ThreatLevel::Safe),
            "suspicious" => Ok(ThreatLevel::Suspicious),
            "malicious" => Ok(ThreatLevel::Malicious),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(format!("unknown threat level: {}", other)),
        }
    }
}

/// Indicators of compromise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Iocs {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub registry: Vec<String>,
    #[serde(default)]
    pub processes: Vec<String>,
}

impl Iocs {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
            && self.ips.is_empty()
            && self.files.is_empty()
            && self.registry.is_empty()
            && self.processes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
            + self.ips.len()
            + self.files.len()
            + self.registry.len()
            + self.processes.len()
    }
}

/// One AI provider's verdict for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: String,
    pub threat_level: ThreatLevel,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware_type: Option<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub behaviors: Vec<String>,
    #[serde(default)]
    pub iocs: Iocs,
    /// Set when the provider call failed; such results never vote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResult {
    /// Create a successful verdict with no classification details.
    pub fn new(provider: impl Into<String>, threat_level: ThreatLevel, confidence: f64) -> Self {
        Self {
            provider: provider.into(),
            threat_level,
            confidence: confidence.clamp(0.0, 1.0),
            malware_family: None,
            malware_type: None,
            signatures: Vec::new(),
            behaviors: Vec::new(),
            iocs: Iocs::default(),
            error: None,
        }
    }

    /// Create an error-flagged result for a failed provider call.
    pub fn failed(provider: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(provider, ThreatLevel::Safe, 0.0)
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a provider disagrees with the consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum DisagreementReason {
    ThreatLevel {
        provider: ThreatLevel,
        consensus: ThreatLevel,
    },
    MalwareFamily {
        provider: String,
        consensus: Option<String>,
    },
    Confidence {
        provider: f64,
        consensus: f64,
    },
}

/// A provider whose verdict diverges from the consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub provider: String,
    pub reasons: Vec<DisagreementReason>,
}

/// The reconciled judgment of an ensemble run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    pub threat_level: ThreatLevel,
    pub confidence: f64,
    /// 1.0 when unanimous, lower as providers diverge.
    pub agreement_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware_type: Option<String>,
    pub aggregated_signatures: Vec<String>,
    pub aggregated_behaviors: Vec<String>,
    pub aggregated_iocs: Iocs,
    pub summary: String,
}

/// Immutable outcome of one ensemble invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub id: String,
    pub file_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Providers that contributed a usable verdict.
    pub providers: Vec<String>,
    pub individual_results: Vec<ProviderResult>,
    pub consensus: Consensus,
    pub disagreements: Vec<Disagreement>,
}

/// Result of static inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticReport {
    /// Format detected from magic bytes.
    pub format: String,
    /// Shannon entropy in bits per byte.
    pub entropy: f64,
    pub printable_strings: usize,
    pub urls: Vec<String>,
    pub ips: Vec<String>,
    pub suspicious_strings: Vec<String>,
    pub verdict: ThreatLevel,
}

/// A signature rule hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub rule: String,
    pub offset: usize,
    pub severity: ThreatLevel,
}

/// Result of signature scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureReport {
    pub rules_evaluated: usize,
    pub matches: Vec<SignatureMatch>,
}

impl SignatureReport {
    pub fn verdict(&self) -> ThreatLevel {
        self.matches
            .iter()
            .map(|m| m.severity)
            .max()
            .unwrap_or(ThreatLevel::Safe)
    }
}

/// Result of sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicReport {
    pub container: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

/// Outcome of invoking one analysis module function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInvocation {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub execution_time_ms: u64,
}

/// One module run recorded in a [`ModuleReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRun {
    pub module_id: String,
    pub function: String,
    pub invocation: ModuleInvocation,
}

/// Result of embedded-module execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub runs: Vec<ModuleRun>,
    /// Modules not run because memory could not be reserved.
    pub skipped: Vec<String>,
}

/// Technique-specific result of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "lowercase")]
pub enum TechniqueResult {
    Static(StaticReport),
    Dynamic(DynamicReport),
    Ai(EnsembleResult),
    Signature(SignatureReport),
    Module(ModuleReport),
}

impl TechniqueResult {
    pub fn technique(&self) -> Technique {
        match self {
            TechniqueResult::Static(_) => Technique::Static,
            TechniqueResult::Dynamic(_) => Technique::Dynamic,
            TechniqueResult::Ai(_) => Technique::Ai,
            TechniqueResult::Signature(_) => Technique::Signature,
            TechniqueResult::Module(_) => Technique::Module,
        }
    }

    /// Threat verdict carried by this result, if the technique produces one.
    pub fn verdict(&self) -> Option<ThreatLevel> {
        match self {
            TechniqueResult::Static(r) => Some(r.verdict),
            TechniqueResult::Ai(r) => Some(r.consensus.threat_level),
            TechniqueResult::Signature(r) => Some(r.verdict()),
            TechniqueResult::Dynamic(_) | TechniqueResult::Module(_) => None,
        }
    }
}

/// One unit of scheduled work: a technique applied to a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisTask {
    pub id: String,
    pub file_id: String,
    pub technique: Technique,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TechniqueResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalysisError>,
}

impl AnalysisTask {
    pub fn new(file_id: &str, technique: Technique) -> Self {
        Self {
            id: format!("{}:{}", file_id, technique),
            file_id: file_id.to_string(),
            technique,
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
        }
    }

    /// Wall-clock run time, if the task ran and finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Task counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStatusSummary {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a AnalysisTask>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Every task created for the file is terminal.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Live view of one technique's bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadStatus {
    pub technique: Technique,
    pub queue_length: usize,
    pub active_count: usize,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
}

/// Aggregate resource snapshot across the coordinator and allocator.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub active_analyses: usize,
    pub queued_analyses: usize,
    pub memory: MemoryStats,
    pub bulkheads: Vec<BulkheadStatus>,
}

/// Metadata for a generated report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub analysis_date: DateTime<Utc>,
    pub techniques: Vec<Technique>,
    pub providers: Vec<String>,
    pub files_analyzed: usize,
    /// Files with at least one failed task.
    pub files_degraded: usize,
    pub duration_seconds: f64,
}

/// Finished tasks for one sample.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: AnalysisFile,
    pub tasks: Vec<AnalysisTask>,
}

impl FileReport {
    pub fn result(&self, technique: Technique) -> Option<&TechniqueResult> {
        self.tasks
            .iter()
            .find(|t| t.technique == technique)
            .and_then(|t| t.result.as_ref())
    }

    pub fn ensemble(&self) -> Option<&EnsembleResult> {
        match self.result(Technique::Ai) {
            Some(TechniqueResult::Ai(ensemble)) => Some(ensemble),
            _ => None,
        }
    }

    /// The AI consensus when there is one, otherwise the most severe
    /// technique verdict.
    pub fn verdict(&self) -> Option<ThreatLevel> {
        if let Some(ensemble) = self.ensemble() {
            return Some(ensemble.consensus.threat_level);
        }
        self.tasks
            .iter()
            .filter_map(|t| t.result.as_ref().and_then(TechniqueResult::verdict))
            .max()
    }

    pub fn failed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count()
    }
}

/// The complete analysis report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub files: Vec<FileReport>,
    pub resource_usage: ResourceUsage,
}

impl Report {
    /// Number of files per verdict; files without any verdict are not counted.
    pub fn verdict_counts(&self) -> Vec<(ThreatLevel, usize)> {
        ThreatLevel::ALL
            .iter()
            .rev()
            .map(|level| {
                let count = self
                    .files
                    .iter()
                    .filter(|f| f.verdict() == Some(*level))
                    .count();
                (*level, count)
            })
            .collect()
    }

    /// Whether any file reached `threshold`.
    pub fn reaches(&self, threshold: ThreatLevel) -> bool {
        self.files
            .iter()
            .any(|f| f.verdict().is_some_and(|v| v >= threshold))
    }
}

/// Order-preserving union of string lists.
pub fn union_dedup<'a>(lists: impl IntoIterator<Item = &'a Vec<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for item in list {
            if seen.insert(item.as_str()) {
                out.push(item.clone());
            }
        }
    }
    out
}
