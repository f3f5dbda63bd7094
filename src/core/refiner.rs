// src/core/refiner.rs — Prompt refinement with output validation

use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{validate_prompt_text, PromptVersion};
use crate::infra::errors::{PipelineError, PipelineResult};
use crate::provider::retry::{call_with_retry, CallAudit, RetryPolicy};
use crate::provider::{FailureContext, RefineService};

/// A degenerate reply gets exactly one more chance.
pub const MAX_REFINE_ATTEMPTS: u32 = 2;

pub struct PromptRefiner {
    service: Arc<dyn RefineService>,
    retry: RetryPolicy,
    audit: Arc<dyn CallAudit>,
    max_chars: usize,
}

impl PromptRefiner {
    pub fn new(
        service: Arc<dyn RefineService>,
        retry: RetryPolicy,
        audit: Arc<dyn CallAudit>,
        max_chars: usize,
    ) -> Self {
        Self {
            service,
            retry,
            audit,
            max_chars,
        }
    }

    /// Ask for a better prompt given the scene's cumulative failure history.
    ///
    /// The returned text is trimmed, non-empty, within the length bound and
    /// never identical to `version.prompt_text`.
    pub async fn refine(
        &self,
        version: &PromptVersion,
        context: &FailureContext,
    ) -> PipelineResult<String> {
        let original = version.prompt_text.as_str();
        let mut reason = String::new();

        for attempt in 1..=MAX_REFINE_ATTEMPTS {
            let reply = call_with_retry(
                &self.retry,
                self.audit.as_ref(),
                self.service.id(),
                "refine",
                || self.service.refine(original, context),
            )
            .await;

            match reply {
                Ok(text) => match self.check(original, &text) {
                    Ok(refined) => {
                        debug!(
                            iteration = version.iteration,
                            similarity = strsim::normalized_levenshtein(original, &refined),
                            "Prompt refined"
                        );
                        return Ok(refined);
                    }
                    Err(why) => reason = why,
                },
                Err(e) if e.is_permanent() => return Err(PipelineError::Service(e)),
                Err(e) => reason = e.to_string(),
            }
            warn!(
                iteration = version.iteration,
                attempt,
                "Refinement attempt rejected: {reason}"
            );
        }

        Err(PipelineError::RefinementDegenerate { reason })
    }

    fn check(&self, original: &str, text: &str) -> Result<String, String> {
        let refined = text.trim();
        if refined.is_empty() {
            return Err("empty output".into());
        }
        if refined == original.trim() {
            return Err("output identical to the input prompt".into());
        }
        validate_prompt_text(refined, self.max_chars)?;
        Ok(refined.to_string())
    }
}
