// tests/common/mod.rs — Scripted collaborators and fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use imgrefine::core::orchestrator::{Collaborators, Orchestrator};
use imgrefine::core::types::{GenerationParams, SceneInput};
use imgrefine::infra::config::Config;
use imgrefine::infra::errors::ServiceError;
use imgrefine::memory::artifacts::ArtifactStore;
use imgrefine::memory::{LineageDb, SharedStore};
use imgrefine::provider::{
    FailureContext, ImageArtifact, ImageService, RefineService, VisionJudgment, VisionService,
};

// ─── Image service ──────────────────────────────────────────────────────────

pub enum ImageMode {
    /// Each call yields an image whose first byte is the next percentage
    /// from the list (cycled). The scripted vision turns it into the score.
    Scores(Vec<u8>),
    /// Every call fails with a retriable server error.
    Transient,
    /// Every call is rejected for bad credentials.
    Permanent,
}

pub struct FakeImage {
    mode: ImageMode,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl FakeImage {
    pub fn new(mode: ImageMode) -> Self {
        Self {
            mode,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageService for FakeImage {
    fn id(&self) -> &str {
        "fake-image"
    }

    async fn generate(&self, params: &GenerationParams) -> Result<ImageArtifact, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(params.prompt.clone());
        match &self.mode {
            ImageMode::Scores(pcts) => Ok(image_with_score(pcts[n as usize % pcts.len()], n)),
            ImageMode::Transient => Err(ServiceError::Server {
                service: "fake-image".into(),
                message: "HTTP 503".into(),
            }),
            ImageMode::Permanent => Err(ServiceError::Auth {
                service: "fake-image".into(),
                message: "HTTP 401: invalid key".into(),
            }),
        }
    }
}

pub fn image_with_score(pct: u8, salt: u32) -> ImageArtifact {
    let mut bytes = vec![pct];
    bytes.extend_from_slice(&salt.to_le_bytes());
    ImageArtifact {
        bytes,
        width: 1024,
        height: 768,
        content_type: "image/png".into(),
        source_url: None,
    }
}

// ─── Vision service ─────────────────────────────────────────────────────────

/// Scores an image from its first byte (percent), unless the prompt contains
/// the boost marker. Every match dimension gets the score, style deviation its
/// complement, so the weighted adherence equals the score when nothing is missing.
pub struct ScriptedVision {
    boost: Option<(String, f64)>,
    missing: Vec<String>,
    calls: AtomicU32,
}

impl ScriptedVision {
    pub fn new() -> Self {
        Self {
            boost: None,
            missing: Vec::new(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_boost(mut self, marker: &str, score: f64) -> Self {
        self.boost = Some((marker.to_string(), score));
        self
    }

    pub fn with_missing(mut self, elements: &[&str]) -> Self {
        self.missing = elements.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionService for ScriptedVision {
    fn id(&self) -> &str {
        "scripted-vision"
    }

    async fn evaluate(
        &self,
        image: &ImageArtifact,
        prompt: &str,
    ) -> Result<VisionJudgment, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let boosted = self
            .boost
            .as_ref()
            .filter(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, s)| *s);
        let s = boosted.unwrap_or_else(|| image.bytes.first().copied().unwrap_or(0) as f64 / 100.0);
        let missing = if boosted.is_some() {
            Vec::new()
        } else {
            self.missing.clone()
        };
        Ok(VisionJudgment {
            description: format!("an image scoring {s:.2}"),
            raw: serde_json::json!({
                "object_match": s,
                "color_match": s,
                "spatial_match": s,
                "style_deviation": 1.0 - s,
                "confidence": 0.9,
                "missing_elements": missing,
            }),
        })
    }
}

// ─── Refine service ─────────────────────────────────────────────────────────

pub enum RefineMode {
    /// Appends `, refined <n>` to the prompt.
    Append,
    /// Returns the prompt unchanged.
    Echo,
}

pub struct FakeRefiner {
    mode: RefineMode,
    calls: AtomicU32,
    contexts: Mutex<Vec<FailureContext>>,
}

impl FakeRefiner {
    pub fn new(mode: RefineMode) -> Self {
        Self {
            mode,
            calls: AtomicU32::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<FailureContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RefineService for FakeRefiner {
    fn id(&self) -> &str {
        "fake-refiner"
    }

    async fn refine(&self, prompt: &str, context: &FailureContext) -> Result<String, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());
        Ok(match self.mode {
            RefineMode::Append => format!("{prompt}, refined {n}"),
            RefineMode::Echo => prompt.to_string(),
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

/// Defaults with millisecond backoff and two attempts per call.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter_fraction = 0.0;
    config.timeouts.call_timeout_secs = 5;
    config.pipeline.batch_size = 5;
    config.pipeline.max_iterations = 3;
    config.pipeline.quality_threshold = 0.7;
    config
}

pub fn scene_input(label: &str, description: &str) -> SceneInput {
    SceneInput {
        label: label.into(),
        title: format!("{label} title"),
        description: description.into(),
        mood: "quiet".into(),
        prompt: format!("{description}, watercolor"),
        model: None,
    }
}

pub struct Harness {
    pub store: SharedStore,
    pub image: Arc<FakeImage>,
    pub vision: Arc<ScriptedVision>,
    pub refine: Arc<FakeRefiner>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(image: FakeImage, vision: ScriptedVision, refine: FakeRefiner) -> Self {
        Self {
            store: LineageDb::in_memory().unwrap().shared(),
            image: Arc::new(image),
            vision: Arc::new(vision),
            refine: Arc::new(refine),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn services(&self) -> Collaborators {
        Collaborators {
            image: self.image.clone(),
            vision: self.vision.clone(),
            refine: self.refine.clone(),
        }
    }

    pub fn artifacts_root(&self) -> &Path {
        self.dir.path()
    }

    pub fn orchestrator(&self, config: &Config, worker: &str) -> Orchestrator {
        Orchestrator::new(
            config,
            self.store.clone(),
            ArtifactStore::new(self.dir.path()),
            self.services(),
            worker,
        )
    }
}
