//! Static inspection: format magic, entropy and embedded strings.

use crate::error::AnalysisResult;
use crate::models::{AnalysisFile, StaticReport, Technique, TechniqueResult, ThreatLevel};
use crate::scheduler::{Analyzer, TaskContext};
use crate::techniques::read_sample;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Shortest run of printable ASCII counted as a string.
pub const MIN_STRING_LEN: usize = 5;

/// Entropy above this usually means packed or encrypted content.
const PACKED_ENTROPY: f64 = 7.2;

const SUSPICIOUS_MARKERS: &[&str] = &[
    "VirtualAlloc",
    "VirtualProtect",
    "WriteProcessMemory",
    "CreateRemoteThread",
    "NtUnmapViewOfSection",
    "SetWindowsHookEx",
    "GetAsyncKeyState",
    "IsDebuggerPresent",
    "URLDownloadToFile",
    "WinExec",
    "cmd.exe /c",
    "powershell",
    "RegSetValue",
    "CurrentVersion\\Run",
    "/bin/sh -c",
    "chmod +x",
];

#[derive(Debug, Default, Clone)]
pub struct StaticAnalyzer;

impl StaticAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    fn technique(&self) -> Technique {
        Technique::Static
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult> {
        let (content, _reservation) = read_sample(&ctx, &file).await?;
        ctx.progress.update(40, "content loaded");
        ctx.check_cancelled()?;

        let report = inspect(&content);
        ctx.progress.update(90, format!("{} strings extracted", report.printable_strings));
        Ok(TechniqueResult::Static(report))
    }
}

/// Inspect raw sample bytes.
pub fn inspect(content: &[u8]) -> StaticReport {
    let format = detect_format(content).to_string();
    let entropy = shannon_entropy(content);
    let strings = extract_strings(content, MIN_STRING_LEN);

    let mut urls = Vec::new();
    let mut ips = Vec::new();
    let mut suspicious = Vec::new();

    for s in &strings {
        for token in s.split(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
            if token.starts_with("http://") || token.starts_with("https://") {
                push_unique(&mut urls, token);
            } else if token.parse::<Ipv4Addr>().is_ok() {
                push_unique(&mut ips, token);
            }
        }
        for marker in SUSPICIOUS_MARKERS {
            if s.contains(marker) {
                push_unique(&mut suspicious, marker);
            }
        }
    }

    let verdict = static_verdict(&format, entropy, suspicious.len(), urls.len());

    StaticReport {
        format,
        entropy: (entropy * 1000.0).round() / 1000.0,
        printable_strings: strings.len(),
        urls,
        ips,
        suspicious_strings: suspicious,
        verdict,
    }
}

fn static_verdict(format: &str, entropy: f64, suspicious: usize, urls: usize) -> ThreatLevel {
    let packed = entropy > PACKED_ENTROPY;
    let executable = matches!(format, "pe" | "elf" | "macho");

    if suspicious >= 3 || (packed && suspicious >= 1) {
        ThreatLevel::Malicious
    } else if packed || suspicious >= 1 || (executable && urls > 0) {
        ThreatLevel::Suspicious
    } else {
        ThreatLevel::Safe
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Identify a format from its leading magic bytes.
pub fn detect_format(content: &[u8]) -> &'static str {
    match content {
        [b'M', b'Z', ..] => "pe",
        [0x7f, b'E', b'L', b'F', ..] => "elf",
        [0xfe, 0xed, 0xfa, 0xce | 0xcf, ..] | [0xce | 0xcf, 0xfa, 0xed, 0xfe, ..] => "macho",
        [0xca, 0xfe, 0xba, 0xbe, ..] => "java-class",
        [b'P', b'K', 0x03, 0x04, ..] => "zip",
        [b'%', b'P', b'D', b'F', ..] => "pdf",
        [0xd0, 0xcf, 0x11, 0xe0, ..] => "ole",
        [0x00, b'a', b's', b'm', ..] => "wasm",
        [b'#', b'!', ..] => "script",
        [0x1f, 0x8b, ..] => "gzip",
        _ => "unknown",
    }
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(content: &[u8]) -> f64 {
    if content.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in content {
        counts[b as usize] += 1;
    }
    let len = content.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Runs of printable ASCII at least `min_len` long.
pub fn extract_strings(content: &[u8], min_len: usize) -> Vec<String> {
    let mut strings = Vec::new();
    let mut current = Vec::new();

    for &b in content {
        if b.is_ascii_graphic() || b == b' ' || b == b'\t' {
            current.push(b);
        } else {
            if current.len() >= min_len {
                strings.push(String::from_utf8_lossy(&current).to_string());
            }
            current.clear();
        }
    }
    if current.len() >= min_len {
        strings.push(String::from_utf8_lossy(&current).to_string());
    }

    strings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::MemoryAllocator;
    use crate::scheduler::ProgressReporter;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"MZ\x90\x00"), "pe");
        assert_eq!(detect_format(b"\x7fELF\x02"), "elf");
        assert_eq!(detect_format(b"\xcf\xfa\xed\xfe"), "macho");
        assert_eq!(detect_format(b"#!/bin/sh"), "script");
        assert_eq!(detect_format(b""), "unknown");
    }

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(shannon_entropy(b""), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 64]), 0.0);

        let all: Vec<u8> = (0..=255).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_strings() {
        let data = b"\x00\x01hello world\x00abc\x00tail-string";
        assert_eq!(
            extract_strings(data, 5),
            vec!["hello world", "tail-string"]
        );
    }

    #[test]
    fn test_inspect_dropper() {
        let mut data = b"MZ\x90\x00\x03\x00".to_vec();
        data.extend_from_slice(b"\x00VirtualAlloc\x00WriteProcessMemory\x00CreateRemoteThread\x00");
        data.extend_from_slice(b"\x00fetch http://evil.example/stage2 from 203.0.113.9\x00");

        let report = inspect(&data);
        assert_eq!(report.format, "pe");
        assert_eq!(report.urls, vec!["http://evil.example/stage2"]);
        assert_eq!(report.ips, vec!["203.0.113.9"]);
        assert_eq!(report.suspicious_strings.len(), 3);
        assert_eq!(report.verdict, ThreatLevel::Malicious);
    }

    #[test]
    fn test_inspect_plain_text_is_safe() {
        let report = inspect(b"just some release notes for version two");
        assert_eq!(report.format, "unknown");
        assert_eq!(report.verdict, ThreatLevel::Safe);
        assert_eq!(report.printable_strings, 1);
    }

    #[tokio::test]
    async fn test_execute_holds_and_releases_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropper.exe");
        std::fs::write(&path, b"MZ\x90\x00powershell -nop").unwrap();
        let file = Arc::new(AnalysisFile::from_path(&path).await.unwrap());

        let memory = Arc::new(MemoryAllocator::new(MemoryConfig::default()));
        let ctx = TaskContext {
            task_id: format!("{}:static", file.id),
            file_id: file.id.clone(),
            technique: Technique::Static,
            cancel: CancellationToken::new(),
            progress: ProgressReporter::disabled().for_task(&file.id, Technique::Static),
            memory: Arc::clone(&memory),
        };

        let result = StaticAnalyzer::new().execute(ctx, file).await.unwrap();
        assert_eq!(result.verdict(), Some(ThreatLevel::Suspicious));
        assert_eq!(memory.stats().total_allocated, 0);
    }

    #[tokio::test]
    async fn test_execute_fails_when_budget_denies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = Arc::new(AnalysisFile::from_path(&path).await.unwrap());

        let memory = Arc::new(MemoryAllocator::new(MemoryConfig {
            total_limit_bytes: 1024,
            ..MemoryConfig::default()
        }));
        let ctx = TaskContext {
            task_id: "big:static".to_string(),
            file_id: file.id.clone(),
            technique: Technique::Static,
            cancel: CancellationToken::new(),
            progress: ProgressReporter::disabled().for_task(&file.id, Technique::Static),
            memory,
        };

        let err = StaticAnalyzer::new().execute(ctx, file).await.unwrap_err();
        assert_eq!(err.kind(), "allocation_denied");
    }
}
