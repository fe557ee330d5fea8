//! Literal byte-pattern signature scanning.

use crate::config::SignatureRule;
use crate::error::AnalysisResult;
use crate::models::{AnalysisFile, SignatureMatch, SignatureReport, Technique, TechniqueResult, ThreatLevel};
use crate::scheduler::{Analyzer, TaskContext};
use crate::techniques::read_sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
struct CompiledRule {
    name: String,
    bytes: Vec<u8>,
    severity: ThreatLevel,
}

#[derive(Debug, Clone)]
pub struct SignatureAnalyzer {
    rules: Vec<CompiledRule>,
}

impl SignatureAnalyzer {
    /// Compile configured rules. Fails on empty patterns or bad hex.
    pub fn new(rules: &[SignatureRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let bytes = if rule.hex {
                    decode_hex(&rule.pattern)
                        .with_context(|| format!("Invalid hex in signature rule {}", rule.name))?
                } else {
                    rule.pattern.as_bytes().to_vec()
                };
                if bytes.is_empty() {
                    anyhow::bail!("Signature rule {} has an empty pattern", rule.name);
                }
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    bytes,
                    severity: rule.severity,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Compiled {} signature rules", rules.len());
        Ok(Self { rules })
    }

    /// First hit of every rule, in rule order.
    pub fn scan(&self, content: &[u8]) -> SignatureReport {
        let matches = self
            .rules
            .iter()
            .filter_map(|rule| {
                content
                    .windows(rule.bytes.len())
                    .position(|window| window == rule.bytes.as_slice())
                    .map(|offset| SignatureMatch {
                        rule: rule.name.clone(),
                        offset,
                        severity: rule.severity,
                    })
            })
            .collect();

        SignatureReport {
            rules_evaluated: self.rules.len(),
            matches,
        }
    }
}

#[async_trait]
impl Analyzer for SignatureAnalyzer {
    fn technique(&self) -> Technique {
        Technique::Signature
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        file: Arc<AnalysisFile>,
    ) -> AnalysisResult<TechniqueResult> {
        let (content, _reservation) = read_sample(&ctx, &file).await?;
        ctx.check_cancelled()?;

        let report = self.scan(&content);
        ctx.progress.update(
            90,
            format!("{} of {} rules matched", report.matches.len(), report.rules_evaluated),
        );
        Ok(TechniqueResult::Signature(report))
    }
}

fn decode_hex(pattern: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = pattern
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }

    digits
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).context("non-ASCII hex digit")?;
            u8::from_str_radix(s, 16).with_context(|| format!("bad hex byte '{}'", s))
        })
        .collect()
}
