// src/evaluator/scoring.rs — Adherence score and pass/fail decision

use crate::core::types::{Classification, DimensionScores, Evaluation};
use crate::infra::config::{Config, ScoringConfig};

/// Pure mapping from an evaluation to `{score, passed}`. Weights come from
/// `[scoring]`, the threshold from `[pipeline]`.
#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    weights: ScoringConfig,
    threshold: f64,
}

impl ScoringPolicy {
    pub fn new(weights: ScoringConfig, threshold: f64) -> Self {
        Self { weights, threshold }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.scoring.clone(), config.pipeline.quality_threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Weighted mean of the match dimensions and style fidelity, minus capped
    /// element penalties, clamped to [0, 1].
    pub fn score(&self, dims: &DimensionScores, missing: usize, unwanted: usize) -> f64 {
        let w = &self.weights;
        let parts = [
            (unit(dims.object_match), w.object_match),
            (unit(dims.color_match), w.color_match),
            (unit(dims.spatial_match), w.spatial_match),
            (1.0 - unit(dims.style_deviation), w.style_fidelity),
        ];

        let total_weight: f64 = parts.iter().map(|(_, w)| w.max(0.0)).sum();
        let base = if total_weight <= 0.0 {
            parts.iter().map(|(s, _)| s).sum::<f64>() / parts.len() as f64
        } else {
            parts.iter().map(|(s, w)| s * w.max(0.0)).sum::<f64>() / total_weight
        };

        let penalty = (missing as f64 * w.missing_element_penalty
            + unwanted as f64 * w.unwanted_element_penalty)
            .min(w.max_penalty)
            .max(0.0);

        unit(base - penalty)
    }

    pub fn classify(&self, eval: &Evaluation) -> Classification {
        let score = if eval.failed {
            0.0
        } else {
            self.score(
                &eval.dimensions,
                eval.missing_elements.len(),
                eval.unwanted_elements.len(),
            )
        };
        Classification {
            score,
            passed: score >= self.threshold,
        }
    }
}

/// Clamp into [0, 1]; NaN counts as 0.
fn unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
