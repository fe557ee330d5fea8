//! Ensemble consensus over independent AI provider verdicts.
//!
//! Aggregation is a pure function of the provider results and the supplied
//! timestamp, so it can be exercised without the scheduler.

use crate::config::ConsensusConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{
    union_dedup, Consensus, Disagreement, DisagreementReason, EnsembleResult, Iocs,
    ProviderResult, ThreatLevel,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

/// Confidence gap beyond which a provider is reported as disagreeing.
const CONFIDENCE_TOLERANCE: f64 = 0.2;

/// Reconciles provider verdicts into one [`EnsembleResult`].
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Aggregate provider results for one file.
    ///
    /// Error-flagged results are dropped first; if fewer than
    /// `required_providers` remain the whole aggregation fails with
    /// [`AnalysisError::InsufficientProviders`].
    pub fn aggregate(
        &self,
        file_hash: &str,
        results: Vec<ProviderResult>,
        timestamp: DateTime<Utc>,
    ) -> AnalysisResult<EnsembleResult> {
        let usable: Vec<&ProviderResult> = results.iter().filter(|r| r.is_usable()).collect();

        if usable.is_empty() || usable.len() < self.config.required_providers {
            return Err(AnalysisError::InsufficientProviders {
                available: usable.len(),
                required: self.config.required_providers,
            });
        }

        let threat_level = if self.config.weighted_voting {
            weighted_threat_level(&usable)
        } else {
            plurality_threat_level(&usable)
        };

        let avg_confidence = usable.iter().map(|r| r.confidence).sum::<f64>() / usable.len() as f64;
        let agreement_factor = agreement_factor(&usable);
        let confidence = round2(avg_confidence * 0.7 + agreement_factor * 0.3);

        let malware_family = weighted_pick(usable.iter().map(|r| (r.malware_family.as_deref(), r.confidence)));
        let malware_type = weighted_pick(usable.iter().map(|r| (r.malware_type.as_deref(), r.confidence)));

        let aggregated_iocs = Iocs {
            domains: union_dedup(usable.iter().map(|r| &r.iocs.domains)),
            ips: union_dedup(usable.iter().map(|r| &r.iocs.ips)),
            files: union_dedup(usable.iter().map(|r| &r.iocs.files)),
            registry: union_dedup(usable.iter().map(|r| &r.iocs.registry)),
            processes: union_dedup(usable.iter().map(|r| &r.iocs.processes)),
        };

        let summary = summarize(usable.len(), confidence, threat_level, malware_family.as_deref());

        let consensus = Consensus {
            threat_level,
            confidence,
            agreement_factor,
            aggregated_signatures: union_dedup(usable.iter().map(|r| &r.signatures)),
            aggregated_behaviors: union_dedup(usable.iter().map(|r| &r.behaviors)),
            aggregated_iocs,
            malware_family,
            malware_type,
            summary,
        };

        let disagreements = find_disagreements(&usable, &consensus);
        debug!(
            "Consensus for {}: {} at {:.2} ({} disagreements)",
            file_hash,
            consensus.threat_level,
            consensus.confidence,
            disagreements.len()
        );

        let providers = usable.iter().map(|r| r.provider.clone()).collect();
        let short_hash: String = file_hash.chars().take(12).collect();

        Ok(EnsembleResult {
            id: format!("ensemble-{}-{}", short_hash, timestamp.timestamp_millis()),
            file_hash: file_hash.to_string(),
            timestamp,
            providers,
            individual_results: results,
            consensus,
            disagreements,
        })
    }
}

/// Confidence-weighted mean ordinal, rounded back to a level. When every
/// provider reports zero confidence the plain mean is used.
fn weighted_threat_level(results: &[&ProviderResult]) -> ThreatLevel {
    let total_weight: f64 = results.iter().map(|r| r.confidence).sum();
    let score = if total_weight > 0.0 {
        results
            .iter()
            .map(|r| r.threat_level.ordinal() * r.confidence)
            .sum::<f64>()
            / total_weight
    } else {
        results.iter().map(|r| r.threat_level.ordinal()).sum::<f64>() / results.len() as f64
    };
    ThreatLevel::from_score(score)
}

/// Most frequent level; ties go to the earliest level in enum order.
fn plurality_threat_level(results: &[&ProviderResult]) -> ThreatLevel {
    let mut best = ThreatLevel::Safe;
    let mut best_count = 0;
    for level in ThreatLevel::ALL {
        let count = results.iter().filter(|r| r.threat_level == level).count();
        if count > best_count {
            best = level;
            best_count = count;
        }
    }
    best
}

fn agreement_factor(results: &[&ProviderResult]) -> f64 {
    let distinct: HashSet<ThreatLevel> = results.iter().map(|r| r.threat_level).collect();
    1.0 - (distinct.len() as f64 - 1.0) / 3.0
}

/// Candidate with the highest summed confidence; ties go to the first seen.
fn weighted_pick<'a>(candidates: impl Iterator<Item = (Option<&'a str>, f64)>) -> Option<String> {
    let mut totals: Vec<(&str, f64)> = Vec::new();
    for (value, confidence) in candidates {
        let Some(value) = value else { continue };
        match totals.iter_mut().find(|(v, _)| *v == value) {
            Some((_, total)) => *total += confidence,
            None => totals.push((value, confidence)),
        }
    }

    let mut best: Option<(&str, f64)> = None;
    for (value, total) in totals {
        if best.map_or(true, |(_, b)| total > b) {
            best = Some((value, total));
        }
    }
    best.map(|(v, _)| v.to_string())
}

fn summarize(
    provider_count: usize,
    confidence: f64,
    threat_level: ThreatLevel,
    family: Option<&str>,
) -> String {
    let mut summary = format!(
        "Ensemble analysis by {} provider{} reached {:.0}% confidence that the sample is {}",
        provider_count,
        if provider_count == 1 { "" } else { "s" },
        confidence * 100.0,
        threat_level
    );
    if let Some(family) = family {
        summary.push_str(&format!(" (family: {})", family));
    }
    summary.push('.');
    summary
}

fn find_disagreements(results: &[&ProviderResult], consensus: &Consensus) -> Vec<Disagreement> {
    results
        .iter()
        .filter_map(|r| {
            let mut reasons = Vec::new();

            if r.threat_level != consensus.threat_level {
                reasons.push(DisagreementReason::ThreatLevel {
                    provider: r.threat_level,
                    consensus: consensus.threat_level,
                });
            }

            if let Some(family) = &r.malware_family {
                if consensus.malware_family.as_ref() != Some(family) {
                    reasons.push(DisagreementReason::MalwareFamily {
                        provider: family.clone(),
                        consensus: consensus.malware_family.clone(),
                    });
                }
            }

            if (r.confidence - consensus.confidence).abs() > CONFIDENCE_TOLERANCE {
                reasons.push(DisagreementReason::Confidence {
                    provider: r.confidence,
                    consensus: consensus.confidence,
                });
            }

            (!reasons.is_empty()).then(|| Disagreement {
                provider: r.provider.clone(),
                reasons,
            })
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(required: usize, weighted: bool) -> ConsensusEngine {
        ConsensusEngine::new(ConsensusConfig {
            required_providers: required,
            weighted_voting: weighted,
            ..ConsensusConfig::default()
        })
    }

    fn verdict(provider: &str, level: ThreatLevel, confidence: f64) -> ProviderResult {
        ProviderResult::new(provider, level, confidence)
    }

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_weighted_mixed_verdicts() {
        let results = vec![
            verdict("claude", ThreatLevel::Malicious, 0.9),
            verdict("openai", ThreatLevel::Suspicious, 0.6),
            verdict("gemini", ThreatLevel::Safe, 0.5),
        ];
        let ensemble = engine(3, true).aggregate("abc", results, ts()).unwrap();

        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Suspicious);
        assert!((ensemble.consensus.agreement_factor - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(ensemble.consensus.confidence, 0.57);
        assert_eq!(ensemble.providers, vec!["claude", "openai", "gemini"]);
    }

    #[test]
    fn test_unanimous_critical() {
        let results = vec![
            verdict("a", ThreatLevel::Critical, 0.8),
            verdict("b", ThreatLevel::Critical, 0.9),
            verdict("c", ThreatLevel::Critical, 1.0),
        ];
        let ensemble = engine(3, true).aggregate("abc", results, ts()).unwrap();

        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Critical);
        assert_eq!(ensemble.consensus.agreement_factor, 1.0);
        // 0.9 * 0.7 + 1.0 * 0.3
        assert_eq!(ensemble.consensus.confidence, 0.93);
        assert!(ensemble.disagreements.is_empty());
    }

    #[test]
    fn test_insufficient_providers_fails_fast() {
        let results = vec![
            verdict("a", ThreatLevel::Malicious, 0.9),
            verdict("b", ThreatLevel::Malicious, 0.8),
            ProviderResult::failed("c", "HTTP 503"),
        ];
        let err = engine(3, true).aggregate("abc", results, ts()).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::InsufficientProviders {
                available: 2,
                required: 3,
            }
        );
    }

    #[test]
    fn test_no_usable_results_always_fails() {
        let err = engine(0, true)
            .aggregate("abc", vec![ProviderResult::failed("a", "timeout")], ts())
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_providers");
    }

    #[test]
    fn test_error_results_do_not_vote() {
        let results = vec![
            verdict("a", ThreatLevel::Safe, 0.9),
            verdict("b", ThreatLevel::Safe, 0.9),
            ProviderResult::failed("c", "rate limited"),
        ];
        let ensemble = engine(2, true).aggregate("abc", results, ts()).unwrap();
        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Safe);
        assert_eq!(ensemble.providers.len(), 2);
        assert_eq!(ensemble.individual_results.len(), 3);
    }

    #[test]
    fn test_plurality_vote_and_tie_break() {
        let results = vec![
            verdict("a", ThreatLevel::Critical, 1.0),
            verdict("b", ThreatLevel::Suspicious, 0.1),
            verdict("c", ThreatLevel::Suspicious, 0.1),
        ];
        let ensemble = engine(3, false).aggregate("abc", results, ts()).unwrap();
        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Suspicious);

        let tied = vec![
            verdict("a", ThreatLevel::Critical, 1.0),
            verdict("b", ThreatLevel::Malicious, 1.0),
        ];
        let ensemble = engine(2, false).aggregate("abc", tied, ts()).unwrap();
        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Malicious);
    }

    #[test]
    fn test_zero_confidence_falls_back_to_plain_mean() {
        let results = vec![
            verdict("a", ThreatLevel::Critical, 0.0),
            verdict("b", ThreatLevel::Malicious, 0.0),
        ];
        let ensemble = engine(2, true).aggregate("abc", results, ts()).unwrap();
        assert_eq!(ensemble.consensus.threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn test_family_and_type_by_summed_confidence() {
        let mut a = verdict("a", ThreatLevel::Malicious, 0.5);
        a.malware_family = Some("Emotet".to_string());
        a.malware_type = Some("trojan".to_string());
        let mut b = verdict("b", ThreatLevel::Malicious, 0.45);
        b.malware_family = Some("TrickBot".to_string());
        let mut c = verdict("c", ThreatLevel::Malicious, 0.45);
        c.malware_family = Some("TrickBot".to_string());
        c.malware_type = Some("loader".to_string());

        let ensemble = engine(3, true).aggregate("abc", vec![a, b, c], ts()).unwrap();
        assert_eq!(ensemble.consensus.malware_family.as_deref(), Some("TrickBot"));
        assert_eq!(ensemble.consensus.malware_type.as_deref(), Some("trojan"));
        assert!(ensemble.consensus.summary.contains("TrickBot"));

        let disagreeing: Vec<&str> = ensemble
            .disagreements
            .iter()
            .map(|d| d.provider.as_str())
            .collect();
        assert_eq!(disagreeing, vec!["a"]);
    }

    #[test]
    fn test_family_tie_goes_to_first_seen() {
        let mut a = verdict("a", ThreatLevel::Malicious, 0.5);
        a.malware_family = Some("Qakbot".to_string());
        let mut b = verdict("b", ThreatLevel::Malicious, 0.5);
        b.malware_family = Some("IcedID".to_string());

        let ensemble = engine(2, true).aggregate("abc", vec![a, b], ts()).unwrap();
        assert_eq!(ensemble.consensus.malware_family.as_deref(), Some("Qakbot"));
    }

    #[test]
    fn test_no_family_when_none_proposed() {
        let results = vec![
            verdict("a", ThreatLevel::Safe, 0.9),
            verdict("b", ThreatLevel::Safe, 0.9),
        ];
        let ensemble = engine(2, true).aggregate("abc", results, ts()).unwrap();
        assert!(ensemble.consensus.malware_family.is_none());
        assert!(ensemble.consensus.malware_type.is_none());
        assert!(!ensemble.consensus.summary.contains("family"));
    }

    #[test]
    fn test_aggregates_are_deduplicated_unions() {
        let mut a = verdict("a", ThreatLevel::Malicious, 0.9);
        a.signatures = vec!["UPX".to_string(), "AntiDebug".to_string()];
        a.behaviors = vec!["persistence".to_string()];
        a.iocs.domains = vec!["evil.example".to_string()];
        a.iocs.ips = vec!["10.0.0.1".to_string()];
        let mut b = verdict("b", ThreatLevel::Malicious, 0.9);
        b.signatures = vec!["UPX".to_string()];
        b.behaviors = vec!["persistence".to_string(), "exfiltration".to_string()];
        b.iocs.domains = vec!["evil.example".to_string(), "c2.example".to_string()];
        b.iocs.registry = vec!["HKCU\\Run\\x".to_string()];

        let ensemble = engine(2, true).aggregate("abc", vec![a, b], ts()).unwrap();
        let c = &ensemble.consensus;
        assert_eq!(c.aggregated_signatures.len(), 2);
        assert_eq!(c.aggregated_behaviors.len(), 2);
        assert_eq!(c.aggregated_iocs.domains.len(), 2);
        assert_eq!(c.aggregated_iocs.ips, vec!["10.0.0.1"]);
        assert_eq!(c.aggregated_iocs.registry.len(), 1);
    }

    #[test]
    fn test_disagreement_reasons() {
        let results = vec![
            verdict("a", ThreatLevel::Malicious, 0.9),
            verdict("b", ThreatLevel::Malicious, 0.9),
            verdict("c", ThreatLevel::Malicious, 0.3),
        ];
        let ensemble = engine(3, true).aggregate("abc", results, ts()).unwrap();
        // avg 0.7 * 0.7 + 1.0 * 0.3 = 0.79
        assert_eq!(ensemble.consensus.confidence, 0.79);
        assert_eq!(ensemble.disagreements.len(), 1);
        assert_eq!(ensemble.disagreements[0].provider, "c");
        assert!(matches!(
            ensemble.disagreements[0].reasons[0],
            DisagreementReason::Confidence { .. }
        ));
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let results = vec![
            verdict("a", ThreatLevel::Suspicious, 0.7),
            verdict("b", ThreatLevel::Malicious, 0.6),
        ];
        let e = engine(2, true);
        let first = e.aggregate("deadbeef", results.clone(), ts()).unwrap();
        let second = e.aggregate("deadbeef", results, ts()).unwrap();
        assert_eq!(first, second);
        assert!(first.id.starts_with("ensemble-deadbeef-"));
    }
}
