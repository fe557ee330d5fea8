//! Markdown and JSON report generation.
//!
//! The Markdown report is assembled from one function per section so that
//! each section can be tested on its own.

use crate::models::{
    AnalysisTask, EnsembleResult, FileReport, ModuleReport, Report, ReportMetadata,
    ResourceUsage, SignatureReport, StaticReport, TaskStatus, TechniqueResult, ThreatLevel,
    DisagreementReason, DynamicReport,
};
use anyhow::{Context, Result};
use std::path::Path;

const MAX_OUTPUT_CHARS: usize = 2000;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# SampleGate Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_table_of_contents(report));
    output.push_str(&generate_summary_section(report));
    output.push_str(&generate_files_section(&report.files));
    output.push_str(&generate_resource_section(&report.resource_usage));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    let techniques: Vec<&str> = metadata.techniques.iter().map(|t| t.as_str()).collect();
    section.push_str(&format!("- **Techniques:** {}\n", techniques.join(", ")));
    if !metadata.providers.is_empty() {
        section.push_str(&format!(
            "- **AI Providers:** `{}`\n",
            metadata.providers.join("`, `")
        ));
    }
    section.push_str(&format!(
        "- **Files Analyzed:** {}\n",
        metadata.files_analyzed
    ));
    if metadata.files_degraded > 0 {
        section.push_str(&format!(
            "- **Files With Failed Tasks:** {}\n",
            metadata.files_degraded
        ));
    }
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_table_of_contents(report: &Report) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    if !report.files.is_empty() {
        toc.push_str("- [Results by File](#results-by-file)\n");
        for file in &report.files {
            toc.push_str(&format!(
                "  - [{}](#{})\n",
                file.file.name,
                anchor(&file.file)
            ));
        }
    }
    toc.push_str("- [Resource Usage](#resource-usage)\n\n");

    toc
}

fn generate_summary_section(report: &Report) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Verdict | Files |\n");
    section.push_str("|---------|-------|\n");
    for (level, count) in report.verdict_counts() {
        section.push_str(&format!("| {} {} | {} |\n", level.emoji(), level, count));
    }
    let undecided = report.files.iter().filter(|f| f.verdict().is_none()).count();
    if undecided > 0 {
        section.push_str(&format!("| ⚪ no verdict | {} |\n", undecided));
    }
    section.push('\n');

    if report.files.is_empty() {
        return section;
    }

    section.push_str("| File | SHA-256 | Verdict | Tasks | Failed |\n");
    section.push_str("|------|---------|---------|-------|--------|\n");
    for file in &report.files {
        section.push_str(&format!(
            "| {} | `{}` | {} | {} | {} |\n",
            cell(&file.file.name),
            short_hash(&file.file.sha256),
            verdict_badge(file.verdict()),
            file.tasks.len(),
            file.failed_tasks()
        ));
    }
    section.push('\n');

    section
}

fn generate_files_section(files: &[FileReport]) -> String {
    if files.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Results by File\n\n");
    for file in files {
        section.push_str(&generate_file_section(file));
    }
    section
}

fn generate_file_section(report: &FileReport) -> String {
    let mut section = String::new();
    let file = &report.file;

    section.push_str(&format!("### {} {{#{}}}\n\n", file.name, anchor(file)));
    section.push_str(&format!(
        "*Type: {} | Size: {} bytes | SHA-256: `{}`*\n\n",
        file.declared_type, file.size, file.sha256
    ));

    section.push_str(&generate_task_table(&report.tasks));

    for task in &report.tasks {
        let block = match &task.result {
            Some(TechniqueResult::Ai(ensemble)) => generate_ensemble_block(ensemble),
            Some(TechniqueResult::Static(r)) => generate_static_block(r),
            Some(TechniqueResult::Signature(r)) => generate_signature_block(r),
            Some(TechniqueResult::Dynamic(r)) => generate_dynamic_block(r),
            Some(TechniqueResult::Module(r)) => generate_module_block(r),
            None => continue,
        };
        section.push_str(&block);
    }

    section.push_str("---\n\n");
    section
}

fn generate_task_table(tasks: &[AnalysisTask]) -> String {
    let mut table = String::new();

    table.push_str("| Technique | Status | Duration | Verdict | Error |\n");
    table.push_str("|-----------|--------|----------|---------|-------|\n");
    for task in tasks {
        let status = match task.status {
            TaskStatus::Completed => "✅ completed".to_string(),
            TaskStatus::Failed => "❌ failed".to_string(),
            other => other.to_string(),
        };
        let duration = task
            .duration_ms()
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let verdict = task
            .result
            .as_ref()
            .and_then(TechniqueResult::verdict)
            .map(|v| verdict_badge(Some(v)))
            .unwrap_or_else(|| "-".to_string());
        let error = task
            .error
            .as_ref()
            .map(|e| format!("`{}` {}", e.kind(), cell(&e.to_string())))
            .unwrap_or_else(|| "-".to_string());

        table.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            task.technique, status, duration, verdict, error
        ));
    }
    table.push('\n');

    table
}

fn generate_ensemble_block(ensemble: &EnsembleResult) -> String {
    let mut block = String::new();
    let consensus = &ensemble.consensus;

    block.push_str("#### AI Consensus\n\n");
    block.push_str(&format!(
        "**Verdict:** {} | **Confidence:** {:.0}% | **Agreement:** {:.0}%\n\n",
        verdict_badge(Some(consensus.threat_level)),
        consensus.confidence * 100.0,
        consensus.agreement_factor * 100.0
    ));
    if let Some(ref family) = consensus.malware_family {
        let kind = consensus.malware_type.as_deref().unwrap_or("unknown type");
        block.push_str(&format!("**Family:** {} ({})\n\n", family, kind));
    }
    block.push_str(&format!(
        "**Providers:** {}\n\n",
        if ensemble.providers.is_empty() {
            "none".to_string()
        } else {
            ensemble.providers.join(", ")
        }
    ));
    if !consensus.summary.is_empty() {
        block.push_str(&format!("> {}\n\n", consensus.summary));
    }

    let failed: Vec<_> = ensemble
        .individual_results
        .iter()
        .filter(|r| r.error.is_some())
        .collect();
    for result in failed {
        block.push_str(&format!(
            "- ⚠️ `{}` failed: {}\n",
            result.provider,
            result.error.as_deref().unwrap_or_default()
        ));
    }

    if !consensus.aggregated_behaviors.is_empty() {
        block.push_str("\n**Behaviors:**\n\n");
        for behavior in &consensus.aggregated_behaviors {
            block.push_str(&format!("- {}\n", behavior));
        }
    }
    if !consensus.aggregated_iocs.is_empty() {
        let iocs = &consensus.aggregated_iocs;
        block.push_str("\n**Indicators:**\n\n");
        for (label, values) in [
            ("Domains", &iocs.domains),
            ("IPs", &iocs.ips),
            ("Files", &iocs.files),
            ("Registry", &iocs.registry),
            ("Processes", &iocs.processes),
        ] {
            if !values.is_empty() {
                block.push_str(&format!("- {}: `{}`\n", label, values.join("`, `")));
            }
        }
    }

    if !ensemble.disagreements.is_empty() {
        block.push_str("\n**Disagreements:**\n\n");
        for disagreement in &ensemble.disagreements {
            let reasons: Vec<String> = disagreement.reasons.iter().map(describe_reason).collect();
            block.push_str(&format!(
                "- `{}`: {}\n",
                disagreement.provider,
                reasons.join("; ")
            ));
        }
    }
    block.push('\n');

    block
}

fn describe_reason(reason: &DisagreementReason) -> String {
    match reason {
        DisagreementReason::ThreatLevel { provider, consensus } => {
            format!("threat level {} vs {}", provider, consensus)
        }
        DisagreementReason::MalwareFamily { provider, consensus } => format!(
            "family {} vs {}",
            provider,
            consensus.as_deref().unwrap_or("none")
        ),
        DisagreementReason::Confidence { provider, consensus } => {
            format!("confidence {:.2} vs {:.2}", provider, consensus)
        }
    }
}

fn generate_static_block(report: &StaticReport) -> String {
    let mut block = String::new();

    block.push_str("#### Static Inspection\n\n");
    block.push_str(&format!(
        "- **Format:** {}\n- **Entropy:** {:.2} bits/byte\n- **Printable strings:** {}\n",
        report.format, report.entropy, report.printable_strings
    ));
    for (label, values) in [
        ("URLs", &report.urls),
        ("IPs", &report.ips),
        ("Suspicious strings", &report.suspicious_strings),
    ] {
        if !values.is_empty() {
            block.push_str(&format!("- **{}:** `{}`\n", label, values.join("`, `")));
        }
    }
    block.push('\n');

    block
}

fn generate_signature_block(report: &SignatureReport) -> String {
    let mut block = String::new();

    block.push_str("#### Signatures\n\n");
    if report.matches.is_empty() {
        block.push_str(&format!(
            "No matches across {} rules.\n\n",
            report.rules_evaluated
        ));
        return block;
    }

    block.push_str("| Rule | Offset | Severity |\n");
    block.push_str("|------|--------|----------|\n");
    for hit in &report.matches {
        block.push_str(&format!(
            "| {} | 0x{:x} | {} |\n",
            hit.rule,
            hit.offset,
            verdict_badge(Some(hit.severity))
        ));
    }
    block.push('\n');

    block
}

fn generate_dynamic_block(report: &DynamicReport) -> String {
    let mut block = String::new();

    block.push_str("#### Sandbox Execution\n\n");
    block.push_str(&format!(
        "*Container: {} | Exit code: {} | Time: {} ms*\n\n",
        report.container, report.exit_code, report.execution_time_ms
    ));
    for (label, output) in [("stdout", &report.stdout), ("stderr", &report.stderr)] {
        if output.trim().is_empty() {
            continue;
        }
        block.push_str(&format!("<details>\n<summary>{}</summary>\n\n```\n", label));
        block.push_str(&truncate(output, MAX_OUTPUT_CHARS));
        block.push_str("\n```\n</details>\n\n");
    }

    block
}

fn generate_module_block(report: &ModuleReport) -> String {
    let mut block = String::new();

    block.push_str("#### Modules\n\n");
    if !report.runs.is_empty() {
        block.push_str("| Module | Function | Result | Memory | Time |\n");
        block.push_str("|--------|----------|--------|--------|------|\n");
        for run in &report.runs {
            let result = if run.invocation.success {
                "✅".to_string()
            } else {
                format!(
                    "❌ {}",
                    cell(run.invocation.error.as_deref().unwrap_or("failed"))
                )
            };
            block.push_str(&format!(
                "| {} | {} | {} | {} B | {} ms |\n",
                run.module_id,
                run.function,
                result,
                run.invocation.memory_used,
                run.invocation.execution_time_ms
            ));
        }
        block.push('\n');
    }
    if !report.skipped.is_empty() {
        block.push_str(&format!(
            "> Skipped for lack of memory: {}\n\n",
            report.skipped.join(", ")
        ));
    }

    block
}

fn generate_resource_section(usage: &ResourceUsage) -> String {
    let mut section = String::new();

    section.push_str("## Resource Usage\n\n");
    section.push_str(&format!(
        "- **Memory:** {} / {} bytes ({:.1}%, pressure {})\n",
        usage.memory.total_allocated,
        usage.memory.total_limit,
        usage.memory.utilization() * 100.0,
        usage.memory.pressure
    ));
    section.push_str(&format!(
        "- **Active analyses:** {} | **Queued:** {}\n\n",
        usage.active_analyses, usage.queued_analyses
    ));

    section.push_str("| Bulkhead | Active | Max | Queued | Capacity |\n");
    section.push_str("|----------|--------|-----|--------|----------|\n");
    for bulkhead in &usage.bulkheads {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            bulkhead.technique,
            bulkhead.active_count,
            bulkhead.max_concurrent,
            bulkhead.queue_length,
            bulkhead.queue_capacity
        ));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by SampleGate v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn verdict_badge(verdict: Option<ThreatLevel>) -> String {
    match verdict {
        Some(level) => format!("{} **{}**", level.emoji(), level.to_string().to_uppercase()),
        None => "⚪ -".to_string(),
    }
}

fn anchor(file: &crate::models::AnalysisFile) -> String {
    format!("file-{}", short_hash(&file.sha256))
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// Keep table cells on one line.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n... (truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Write a report to `path` in the requested format.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::memory::{MemoryStats, PressureLevel};
    use crate::models::{
        AnalysisFile, BulkheadStatus, Consensus, Disagreement, Iocs, ProviderResult,
        SignatureMatch, Technique,
    };
    use chrono::{Duration, Utc};

    fn ensemble() -> EnsembleResult {
        EnsembleResult {
            id: "e1".to_string(),
            file_hash: "ab".repeat(32),
            timestamp: Utc::now(),
            providers: vec!["llama".to_string(), "qwen".to_string()],
            individual_results: vec![
                ProviderResult::new("llama", ThreatLevel::Malicious, 0.9),
                ProviderResult::new("qwen", ThreatLevel::Suspicious, 0.6),
                ProviderResult::failed("mistral", "connection refused"),
            ],
            consensus: Consensus {
                threat_level: ThreatLevel::Malicious,
                confidence: 0.78,
                agreement_factor: 0.5,
                malware_family: Some("Emotet".to_string()),
                malware_type: Some("trojan".to_string()),
                aggregated_signatures: Vec::new(),
                aggregated_behaviors: vec!["persistence via run key".to_string()],
                aggregated_iocs: Iocs {
                    domains: vec!["c2.example".to_string()],
                    ..Iocs::default()
                },
                summary: "2 providers, weighted consensus".to_string(),
            },
            disagreements: vec![Disagreement {
                provider: "qwen".to_string(),
                reasons: vec![DisagreementReason::ThreatLevel {
                    provider: ThreatLevel::Suspicious,
                    consensus: ThreatLevel::Malicious,
                }],
            }],
        }
    }

    fn create_test_report() -> Report {
        let file = AnalysisFile::from_bytes("/samples/invoice.exe", b"MZ payload");
        let now = Utc::now();

        let mut ai = AnalysisTask::new(&file.id, Technique::Ai);
        ai.status = TaskStatus::Completed;
        ai.start_time = Some(now - Duration::milliseconds(1500));
        ai.end_time = Some(now);
        ai.result = Some(TechniqueResult::Ai(ensemble()));

        let mut signature = AnalysisTask::new(&file.id, Technique::Signature);
        signature.status = TaskStatus::Completed;
        signature.result = Some(TechniqueResult::Signature(SignatureReport {
            rules_evaluated: 5,
            matches: vec![SignatureMatch {
                rule: "upx_packed".to_string(),
                offset: 0x200,
                severity: ThreatLevel::Suspicious,
            }],
        }));

        let mut dynamic = AnalysisTask::new(&file.id, Technique::Dynamic);
        dynamic.status = TaskStatus::Failed;
        dynamic.error = Some(AnalysisError::Timeout {
            technique: Technique::Dynamic,
            timeout_ms: 300_000,
        });

        Report {
            metadata: ReportMetadata {
                analysis_date: now,
                techniques: vec![Technique::Ai, Technique::Signature, Technique::Dynamic],
                providers: vec!["llama".to_string(), "qwen".to_string()],
                files_analyzed: 1,
                files_degraded: 1,
                duration_seconds: 12.5,
            },
            files: vec![FileReport {
                file,
                tasks: vec![ai, signature, dynamic],
            }],
            resource_usage: ResourceUsage {
                active_analyses: 0,
                queued_analyses: 0,
                memory: MemoryStats {
                    total_allocated: 0,
                    total_limit: 1024,
                    pressure: PressureLevel::Low,
                    allocation_count: 0,
                },
                bulkheads: vec![BulkheadStatus {
                    technique: Technique::Ai,
                    queue_length: 0,
                    active_count: 0,
                    max_concurrent: 2,
                    queue_capacity: 20,
                }],
            },
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# SampleGate Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Results by File"));
        assert!(markdown.contains("## Resource Usage"));
        assert!(markdown.contains("invoice.exe"));
        assert!(markdown.contains("Files With Failed Tasks:** 1"));
    }

    #[test]
    fn test_task_table_shows_error_kind() {
        let report = create_test_report();
        let table = generate_task_table(&report.files[0].tasks);

        assert!(table.contains("❌ failed"));
        assert!(table.contains("`timeout`"));
        assert!(table.contains("1500 ms"));
    }

    #[test]
    fn test_ensemble_block() {
        let block = generate_ensemble_block(&ensemble());

        assert!(block.contains("MALICIOUS"));
        assert!(block.contains("**Confidence:** 78%"));
        assert!(block.contains("Emotet (trojan)"));
        assert!(block.contains("`mistral` failed: connection refused"));
        assert!(block.contains("`qwen`: threat level suspicious vs malicious"));
        assert!(block.contains("Domains: `c2.example`"));
    }

    #[test]
    fn test_signature_block_formats_offset() {
        let report = create_test_report();
        let markdown = generate_file_section(&report.files[0]);
        assert!(markdown.contains("| upx_packed | 0x200 |"));
    }

    #[test]
    fn test_cell_and_truncate() {
        assert_eq!(cell("a|b\nc"), "a\\|b c");
        assert_eq!(truncate("abcdef", 3), "abc\n... (truncated)");
        assert_eq!(truncate("abc", 3), "abc");
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"metadata\""));
        assert!(json.contains("\"files\""));
        assert!(json.contains("\"technique\": \"ai\""));
        assert!(json.contains("\"resource_usage\""));
    }
}
