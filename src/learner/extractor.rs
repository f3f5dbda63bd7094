// src/learner/extractor.rs — Failure-pattern extraction from a closed iteration

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::types::*;
use crate::core::types::{PromptVersion, ScoredVariant};

/// Longest list kept per pattern kind.
pub const MAX_TERMS: usize = 20;

/// Turns a failed iteration's evaluations into the next node of the scene's
/// learning chain. Counts accumulate along the chain, so the head always
/// summarizes every failed iteration so far.
pub struct LearningExtractor;

impl LearningExtractor {
    pub fn extract(
        version: &PromptVersion,
        scored: &[ScoredVariant],
        parent: Option<&Learning>,
        status: LearningStatus,
    ) -> Learning {
        let fresh = Self::patterns_from_batch(scored);
        let patterns = match parent {
            Some(p) => merge(&p.patterns, &fresh),
            None => fresh,
        };

        let mut extra = BTreeMap::new();
        extra.insert("iteration".to_string(), serde_json::json!(version.iteration));
        if let Some(best) = scored.iter().max_by(|a, b| {
            a.classification
                .score
                .total_cmp(&b.classification.score)
                .then(b.variant.variant_index.cmp(&a.variant.variant_index))
        }) {
            extra.insert(
                "best_description".to_string(),
                serde_json::Value::String(best.evaluation.description.clone()),
            );
            extra.insert(
                "best_score".to_string(),
                serde_json::json!(best.classification.score),
            );
        }

        Learning {
            id: uuid::Uuid::new_v4().to_string(),
            scene_id: version.scene_id.clone(),
            prompt_version_id: version.id.clone(),
            parent_learning_id: parent.map(|p| p.id.clone()),
            patterns,
            status,
            extra,
            created_at: Utc::now(),
        }
    }

    /// Patterns of one batch, without history.
    pub fn patterns_from_batch(scored: &[ScoredVariant]) -> FailurePatterns {
        let mut failed_terms: HashMap<String, u32> = HashMap::new();
        let mut artifacts: HashMap<String, u32> = HashMap::new();
        let mut style: HashMap<String, u32> = HashMap::new();

        for sv in scored {
            let eval = &sv.evaluation;
            // A term counts once per variant
            for term in unique_terms(&eval.missing_elements) {
                *failed_terms.entry(term).or_default() += 1;
            }
            for term in unique_terms(&eval.unwanted_elements) {
                *artifacts.entry(term).or_default() += 1;
            }
            for term in unique_terms(&eval.style_issues) {
                *style.entry(term).or_default() += 1;
            }
        }

        // An artifact is "common" once it shows up in more than one image
        let min_artifact = if scored.len() > 1 { 2 } else { 1 };
        artifacts.retain(|_, count| *count >= min_artifact);

        let scores: Vec<f64> = scored.iter().map(|sv| sv.classification.score).collect();
        FailurePatterns {
            failed_terms: ranked(failed_terms),
            common_artifacts: ranked(artifacts),
            style_violations: ranked(style),
            score_distribution: ScoreDistribution::from_scores(&scores),
        }
    }
}

fn normalize_term(term: &str) -> String {
    term.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn unique_terms(terms: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    terms
        .iter()
        .map(|t| normalize_term(t))
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Highest count first, then alphabetical, capped at `MAX_TERMS`.
fn ranked(counts: HashMap<String, u32>) -> Vec<TermCount> {
    let mut terms: Vec<TermCount> = counts
        .into_iter()
        .map(|(term, count)| TermCount { term, count })
        .collect();
    terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
    terms.truncate(MAX_TERMS);
    terms
}

fn merge_terms(a: &[TermCount], b: &[TermCount]) -> Vec<TermCount> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for t in a.iter().chain(b) {
        *counts.entry(t.term.clone()).or_default() += t.count;
    }
    ranked(counts)
}

fn merge_distribution(a: &ScoreDistribution, b: &ScoreDistribution) -> ScoreDistribution {
    match (a.count, b.count) {
        (0, _) => *b,
        (_, 0) => *a,
        (na, nb) => {
            let total = na + nb;
            ScoreDistribution {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
                mean: (a.mean * na as f64 + b.mean * nb as f64) / total as f64,
                count: total,
            }
        }
    }
}

/// Cumulative patterns: parent history plus this iteration.
pub fn merge(parent: &FailurePatterns, fresh: &FailurePatterns) -> FailurePatterns {
    FailurePatterns {
        failed_terms: merge_terms(&parent.failed_terms, &fresh.failed_terms),
        common_artifacts: merge_terms(&parent.common_artifacts, &fresh.common_artifacts),
        style_violations: merge_terms(&parent.style_violations, &fresh.style_violations),
        score_distribution: merge_distribution(
            &parent.score_distribution,
            &fresh.score_distribution,
        ),
    }
}
