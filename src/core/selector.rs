// src/core/selector.rs — Best-candidate selection within one batch

use super::types::ScoredVariant;
use crate::infra::errors::{PipelineError, PipelineResult};

/// Winner of a batch. `accepted` is the winner's pass flag; a batch where
/// nothing passed still has a best-so-far.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub variant_id: String,
    pub variant_index: u32,
    pub evaluation_id: String,
    pub score: f64,
    pub accepted: bool,
}

/// Highest score wins; ties go to the lowest variant index.
pub fn select(scored: &[ScoredVariant]) -> PipelineResult<Selection> {
    let mut best: Option<&ScoredVariant> = None;
    for candidate in scored {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let (c, b) = (candidate.classification.score, current.classification.score);
                if c > b || (c == b && candidate.variant.variant_index < current.variant.variant_index)
                {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    let winner =
        best.ok_or_else(|| PipelineError::Validation("cannot select from an empty batch".into()))?;
    Ok(Selection {
        variant_id: winner.variant.id.clone(),
        variant_index: winner.variant.variant_index,
        evaluation_id: winner.evaluation.id.clone(),
        score: winner.classification.score,
        accepted: winner.classification.passed,
    })
}
