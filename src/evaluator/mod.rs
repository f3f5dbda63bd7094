// src/evaluator/mod.rs — Evaluation collection for generated variants

pub mod parser;
pub mod scoring;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::types::{DimensionScores, Evaluation, Variant};
use crate::infra::errors::{PipelineError, PipelineResult, ServiceError};
use crate::provider::retry::{call_with_retry, CallAudit, RetryPolicy};
use crate::provider::{ImageArtifact, VisionService};
use scoring::ScoringPolicy;

/// Requests a judgment for each variant and turns it into an `Evaluation`.
pub struct EvaluationCollector {
    vision: Arc<dyn VisionService>,
    policy: ScoringPolicy,
    retry: RetryPolicy,
    audit: Arc<dyn CallAudit>,
    concurrency: usize,
}

impl EvaluationCollector {
    pub fn new(
        vision: Arc<dyn VisionService>,
        policy: ScoringPolicy,
        retry: RetryPolicy,
        audit: Arc<dyn CallAudit>,
        concurrency: usize,
    ) -> Self {
        Self {
            vision,
            policy,
            retry,
            audit,
            concurrency: concurrency.max(1),
        }
    }

    /// Evaluate one variant against the prompt it was generated from.
    ///
    /// Transient failures that outlast the retry budget yield a failing
    /// evaluation (adherence 0.0). Rejected credentials or requests are returned
    /// as errors.
    pub async fn evaluate(
        &self,
        variant: &Variant,
        image: &ImageArtifact,
    ) -> PipelineResult<Evaluation> {
        let prompt = variant.params.prompt.as_str();
        let result = call_with_retry(
            &self.retry,
            self.audit.as_ref(),
            self.vision.id(),
            "evaluate",
            || self.vision.evaluate(image, prompt),
        )
        .await;

        match result {
            Ok(judgment) => {
                let n = parser::normalize(&judgment);
                if n.incomplete {
                    debug!(variant = variant.variant_index, "Evaluation incomplete, neutral defaults used");
                }
                let score = self.policy.score(
                    &n.dimensions,
                    n.missing_elements.len(),
                    n.unwanted_elements.len(),
                );
                Ok(Evaluation {
                    id: uuid::Uuid::new_v4().to_string(),
                    variant_id: variant.id.clone(),
                    description: n.description,
                    dimensions: n.dimensions,
                    missing_elements: n.missing_elements,
                    unwanted_elements: n.unwanted_elements,
                    style_issues: n.style_issues,
                    adherence: score,
                    passed: score >= self.policy.threshold(),
                    incomplete: n.incomplete,
                    failed: false,
                    extra: n.extra,
                    evaluator: self.vision.id().to_string(),
                    created_at: Utc::now(),
                })
            }
            Err(e) if e.is_permanent() => Err(PipelineError::Service(e)),
            Err(e) => {
                warn!(
                    variant = variant.variant_index,
                    "Evaluation failed after retries, scoring as failing: {e}"
                );
                Ok(self.failing_evaluation(variant, &e))
            }
        }
    }

    fn failing_evaluation(&self, variant: &Variant, error: &ServiceError) -> Evaluation {
        let mut extra = BTreeMap::new();
        extra.insert("error".to_string(), serde_json::Value::String(error.to_string()));
        extra.insert(
            "error_kind".to_string(),
            serde_json::Value::String(error.kind().to_string()),
        );
        Evaluation {
            id: uuid::Uuid::new_v4().to_string(),
            variant_id: variant.id.clone(),
            description: String::new(),
            dimensions: DimensionScores::zero(),
            missing_elements: Vec::new(),
            unwanted_elements: Vec::new(),
            style_issues: Vec::new(),
            adherence: 0.0,
            passed: false,
            incomplete: true,
            failed: true,
            extra,
            evaluator: self.vision.id().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Evaluate a batch concurrently. One result per input, in input order; a
    /// failure of one variant never blocks the others.
    pub async fn evaluate_all(
        &self,
        items: &[(Variant, ImageArtifact)],
    ) -> Vec<PipelineResult<Evaluation>> {
        let mut results: Vec<(usize, PipelineResult<Evaluation>)> = stream::iter(items.iter().enumerate())
            .map(|(pos, (variant, image))| async move { (pos, self.evaluate(variant, image).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(pos, _)| *pos);
        results.into_iter().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GenerationParams;
    use crate::infra::config::{GenerationConfig, ScoringConfig};
    use crate::provider::retry::NoAudit;
    use crate::provider::VisionJudgment;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Scores each image by its first byte; 0xFF fails transiently, 0xFE rejects auth.
    struct ByteVision;

    #[async_trait]
    impl VisionService for ByteVision {
        fn id(&self) -> &str {
            "byte-vision"
        }

        async fn evaluate(
            &self,
            image: &ImageArtifact,
            _prompt: &str,
        ) -> Result<VisionJudgment, ServiceError> {
            match image.bytes.first().copied().unwrap_or(0) {
                0xFF => Err(ServiceError::Server {
                    service: "byte-vision".into(),
                    message: "HTTP 503".into(),
                }),
                0xFE => Err(ServiceError::Auth {
                    service: "byte-vision".into(),
                    message: "bad key".into(),
                }),
                b => {
                    let s = b as f64 / 100.0;
                    Ok(VisionJudgment {
                        description: format!("image {b}"),
                        raw: serde_json::json!({
                            "object_match": s, "color_match": s, "spatial_match": s,
                            "style_deviation": 1.0 - s, "confidence": 1.0,
                        }),
                    })
                }
            }
        }
    }

    fn collector() -> EvaluationCollector {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(2),
            jitter_fraction: 0.0,
            call_timeout: Duration::from_secs(1),
        };
        EvaluationCollector::new(
            Arc::new(ByteVision),
            ScoringPolicy::new(ScoringConfig::default(), 0.7),
            retry,
            Arc::new(NoAudit),
            4,
        )
    }

    fn item(index: u32, first_byte: u8) -> (Variant, ImageArtifact) {
        let variant = Variant {
            id: format!("var-{index}"),
            prompt_version_id: "pv".into(),
            variant_index: index,
            storage_locator: format!("/tmp/{index}.png"),
            params: GenerationParams::new(&GenerationConfig::default(), None, "a fox".into()),
            width: 8,
            height: 8,
            content_type: "image/png".into(),
            created_at: Utc::now(),
        };
        let image = ImageArtifact {
            bytes: vec![first_byte],
            width: 8,
            height: 8,
            content_type: "image/png".into(),
            source_url: None,
        };
        (variant, image)
    }

    #[tokio::test]
    async fn test_evaluate_scores_and_passes() {
        let (v, img) = item(0, 90);
        let e = collector().evaluate(&v, &img).await.unwrap();
        assert!((e.adherence - 0.9).abs() < 1e-9);
        assert!(e.passed);
        assert!(!e.failed);
        assert_eq!(e.variant_id, "var-0");
    }

    #[tokio::test]
    async fn test_transient_failure_scored_as_failing() {
        let (v, img) = item(1, 0xFF);
        let e = collector().evaluate(&v, &img).await.unwrap();
        assert!(e.failed);
        assert_eq!(e.adherence, 0.0);
        assert!(!e.passed);
        assert_eq!(e.extra.get("error_kind"), Some(&serde_json::json!("server")));
    }

    #[tokio::test]
    async fn test_permanent_failure_propagates() {
        let (v, img) = item(2, 0xFE);
        let err = collector().evaluate(&v, &img).await.unwrap_err();
        assert!(matches!(err, PipelineError::Service(ServiceError::Auth { .. })));
    }

    #[tokio::test]
    async fn test_evaluate_all_keeps_order_and_isolates_failures() {
        let items = vec![item(0, 40), item(1, 0xFF), item(2, 80)];
        let results = collector().evaluate_all(&items).await;
        assert_eq!(results.len(), 3);
        let evals: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(evals[0].variant_id, "var-0");
        assert!(evals[1].failed);
        assert_eq!(evals[2].variant_id, "var-2");
        assert!(evals[2].passed);
    }
}
