// src/core/batch.rs — Variant batch generation for one prompt version
//
// Indices are fixed before any request goes out, so file names and rows do not
// depend on which request finishes first.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{GenerationParams, PromptVersion, Scene, Variant};
use crate::infra::config::GenerationConfig;
use crate::infra::errors::{PipelineError, PipelineResult, ServiceError};
use crate::memory::artifacts::ArtifactStore;
use crate::memory::{self, SharedStore};
use crate::provider::retry::{call_with_retry, CallAudit, RetryPolicy};
use crate::provider::ImageService;

pub struct BatchGenerator {
    image: Arc<dyn ImageService>,
    artifacts: Arc<ArtifactStore>,
    store: SharedStore,
    generation: GenerationConfig,
    retry: RetryPolicy,
    audit: Arc<dyn CallAudit>,
    concurrency: usize,
}

impl BatchGenerator {
    pub fn new(
        image: Arc<dyn ImageService>,
        artifacts: Arc<ArtifactStore>,
        store: SharedStore,
        generation: GenerationConfig,
        retry: RetryPolicy,
        audit: Arc<dyn CallAudit>,
        concurrency: usize,
    ) -> Self {
        Self {
            image,
            artifacts,
            store,
            generation,
            retry,
            audit,
            concurrency: concurrency.max(1),
        }
    }

    /// Parameters for every variant of `version`: the composed scene prompt
    /// plus the configured generation settings.
    pub fn params_for(&self, scene: &Scene, version: &PromptVersion) -> GenerationParams {
        GenerationParams::new(
            &self.generation,
            scene.model.as_deref(),
            scene.compose_prompt(&version.prompt_text),
        )
    }

    /// Generate variants `0..count`.
    pub async fn generate_batch(
        &self,
        scene: &Scene,
        version: &PromptVersion,
        count: u32,
    ) -> PipelineResult<Vec<Variant>> {
        if count == 0 {
            return Err(PipelineError::Validation("batch size must be at least 1".into()));
        }
        let indices: Vec<u32> = (0..count).collect();
        self.generate_indices(scene, version, &indices).await
    }

    /// Generate the given variant indices concurrently. Each success is stored
    /// (file, then row) as soon as it arrives. A partial batch is returned with
    /// a warning; an empty one fails with `GenerationExhausted`, or with the
    /// service error when the service rejected the request outright.
    pub async fn generate_indices(
        &self,
        scene: &Scene,
        version: &PromptVersion,
        indices: &[u32],
    ) -> PipelineResult<Vec<Variant>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let params = self.params_for(scene, version);

        let outcomes: Vec<(u32, PipelineResult<Variant>)> = stream::iter(indices.iter().copied())
            .map(|index| {
                let params = &params;
                async move { (index, self.generate_one(scene, version, params, index).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut variants = Vec::new();
        let mut failures: Vec<(u32, ServiceError)> = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(variant) => variants.push(variant),
                Err(PipelineError::Service(e)) => {
                    warn!(
                        scene = %scene.label,
                        iteration = version.iteration,
                        variant = index,
                        "Variant generation failed: {e}"
                    );
                    failures.push((index, e));
                }
                // Storage and integrity failures are never downgraded to a shortfall
                Err(other) => return Err(other),
            }
        }
        variants.sort_by_key(|v| v.variant_index);

        if variants.is_empty() {
            if let Some((_, permanent)) = failures.iter().find(|(_, e)| e.is_permanent()) {
                return Err(PipelineError::Service(permanent.clone()));
            }
            let last_error = failures
                .last()
                .map(|(_, e)| e.to_string())
                .unwrap_or_else(|| "no variant produced".into());
            return Err(PipelineError::GenerationExhausted {
                requested: indices.len() as u32,
                last_error,
            });
        }

        if !failures.is_empty() {
            let mut missing: Vec<u32> = failures.iter().map(|(i, _)| *i).collect();
            missing.sort_unstable();
            warn!(
                scene = %scene.label,
                iteration = version.iteration,
                requested = indices.len(),
                produced = variants.len(),
                ?missing,
                "Partial batch"
            );
        }
        Ok(variants)
    }

    async fn generate_one(
        &self,
        scene: &Scene,
        version: &PromptVersion,
        params: &GenerationParams,
        index: u32,
    ) -> PipelineResult<Variant> {
        let artifact = call_with_retry(
            &self.retry,
            self.audit.as_ref(),
            self.image.id(),
            "generate",
            || self.image.generate(params),
        )
        .await?;

        let locator = self
            .artifacts
            .save(&scene.label, version.iteration, index, &artifact)?;
        let variant = Variant {
            id: uuid::Uuid::new_v4().to_string(),
            prompt_version_id: version.id.clone(),
            variant_index: index,
            storage_locator: locator,
            params: params.clone(),
            width: artifact.width,
            height: artifact.height,
            content_type: artifact.content_type.clone(),
            created_at: Utc::now(),
        };
        memory::lock(&self.store)?.insert_variant(&variant)?;
        debug!(
            scene = %scene.label,
            iteration = version.iteration,
            variant = index,
            bytes = artifact.bytes.len(),
            "Variant stored"
        );
        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{scene_id_for, PromptStatus};
    use crate::memory::LineageDb;
    use crate::provider::retry::NoAudit;
    use crate::provider::ImageArtifact;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Image bytes are the call counter. `fail_every` rejects every n-th call
    /// (starting with the first); `reject` fails every call with an auth error.
    struct CountingImage {
        fail_every: Option<u32>,
        reject: bool,
        calls: std::sync::atomic::AtomicU32,
    }

    impl CountingImage {
        fn new(fail_every: Option<u32>, reject: bool) -> Self {
            Self {
                fail_every,
                reject,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageService for CountingImage {
        fn id(&self) -> &str {
            "counting"
        }

        async fn generate(&self, _params: &GenerationParams) -> Result<ImageArtifact, ServiceError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.reject {
                return Err(ServiceError::Auth {
                    service: "counting".into(),
                    message: "no".into(),
                });
            }
            if let Some(every) = self.fail_every {
                if n % every == 0 {
                    return Err(ServiceError::InvalidRequest {
                        service: "counting".into(),
                        message: "nsfw".into(),
                    });
                }
            }
            Ok(ImageArtifact {
                bytes: n.to_le_bytes().to_vec(),
                width: 4,
                height: 4,
                content_type: "image/png".into(),
                source_url: None,
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(1),
            jitter_fraction: 0.0,
            call_timeout: Duration::from_secs(1),
        }
    }

    fn setup(image: CountingImage) -> (BatchGenerator, SharedStore, Scene, PromptVersion, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LineageDb::in_memory().unwrap().shared();
        let scene = Scene {
            scene_id: scene_id_for("a fox in snow"),
            label: "fox".into(),
            title: "Fox".into(),
            description: "a fox in snow".into(),
            mood: "calm".into(),
            model: None,
            best: None,
            active_learning_id: None,
            created_at: Utc::now(),
        };
        let version = store
            .lock()
            .unwrap()
            .create_scene(&scene, "red fox", PromptStatus::Completed)
            .unwrap()
            .unwrap();
        let gen = BatchGenerator::new(
            Arc::new(image),
            Arc::new(ArtifactStore::new(dir.path())),
            store.clone(),
            GenerationConfig::default(),
            fast_retry(),
            Arc::new(NoAudit),
            3,
        );
        (gen, store, scene, version, dir)
    }

    #[tokio::test]
    async fn test_full_batch_indices_and_files() {
        let (gen, store, scene, version, _dir) = setup(CountingImage::new(None, false));
        let variants = gen.generate_batch(&scene, &version, 5).await.unwrap();
        let indices: Vec<u32> = variants.iter().map(|v| v.variant_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        for v in &variants {
            assert!(std::path::Path::new(&v.storage_locator).exists());
            assert!(v.storage_locator.ends_with(&format!("fox_iter0_v{}.png", v.variant_index)));
            assert!(v.params.prompt.contains("Prompt: red fox"));
        }
        let stored = store.lock().unwrap().variants_for_version(&version.id).unwrap();
        assert_eq!(stored.len(), 5);
    }

    #[tokio::test]
    async fn test_partial_batch_is_usable() {
        // Every second call is rejected
        let (gen, _store, scene, version, _dir) = setup(CountingImage::new(Some(2), false));
        let variants = gen.generate_batch(&scene, &version, 4).await.unwrap();
        assert_eq!(variants.len(), 2);
        let unique: HashSet<u32> = variants.iter().map(|v| v.variant_index).collect();
        assert_eq!(unique.len(), 2);
    }

    #[tokio::test]
    async fn test_all_rejected_surfaces_service_error() {
        let (gen, store, scene, version, _dir) = setup(CountingImage::new(None, true));
        let err = gen.generate_batch(&scene, &version, 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Service(ServiceError::Auth { .. })));
        assert!(store.lock().unwrap().variants_for_version(&version.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generate_only_requested_indices() {
        let (gen, _store, scene, version, _dir) = setup(CountingImage::new(None, false));
        let variants = gen.generate_indices(&scene, &version, &[1, 3]).await.unwrap();
        let indices: Vec<u32> = variants.iter().map(|v| v.variant_index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert!(gen.generate_indices(&scene, &version, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_count_rejected() {
        let (gen, _store, scene, version, _dir) = setup(CountingImage::new(None, false));
        assert!(matches!(
            gen.generate_batch(&scene, &version, 0).await,
            Err(PipelineError::Validation(_))
        ));
    }
}
