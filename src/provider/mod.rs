// src/provider/mod.rs — External collaborators: image generation, vision evaluation, refinement

pub mod fal;
pub mod google;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::GenerationParams;
use crate::infra::errors::ServiceError;
use crate::learner::types::FailurePatterns;

/// A generated image plus the metadata the service reported for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArtifact {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    pub source_url: Option<String>,
}

/// Raw reply of a vision service, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionJudgment {
    pub description: String,
    /// Structured scores, in whatever shape the service produced.
    pub raw: serde_json::Value,
}

/// Everything the refinement service is told about why a prompt failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub title: String,
    pub scene_description: String,
    pub mood: String,
    pub iteration: u32,
    /// Cumulative patterns from the scene's learning chain.
    pub patterns: FailurePatterns,
    /// Number of failed iterations summarized in `patterns`.
    pub chain_depth: u32,
    /// Description of the best variant of the failed iteration.
    pub best_description: Option<String>,
    pub best_score: Option<f64>,
}

#[async_trait]
pub trait ImageService: Send + Sync {
    fn id(&self) -> &str;

    /// Produce one image. Implementations hide their own submit/poll cycle.
    async fn generate(&self, params: &GenerationParams) -> Result<ImageArtifact, ServiceError>;
}

#[async_trait]
pub trait VisionService: Send + Sync {
    fn id(&self) -> &str;

    async fn evaluate(
        &self,
        image: &ImageArtifact,
        prompt: &str,
    ) -> Result<VisionJudgment, ServiceError>;
}

#[async_trait]
pub trait RefineService: Send + Sync {
    fn id(&self) -> &str;

    async fn refine(&self, prompt: &str, context: &FailureContext) -> Result<String, ServiceError>;
}

/// Image model families that want differently written prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Flux,
    Sdxl,
}

impl ModelFamily {
    /// Family of a generation model id such as `fal-ai/fast-sdxl`. Flux unless the id says otherwise.
    pub fn of(model: &str) -> Self {
        if model.to_lowercase().contains("sdxl") {
            ModelFamily::Sdxl
        } else {
            ModelFamily::Flux
        }
    }

    /// Writing guidance handed to the prompt writer.
    pub fn guidance(&self) -> &'static str {
        match self {
            ModelFamily::Flux => {
                "The prompt is for a Flux model:\n\
                 - Use natural language that describes the visual elements\n\
                 - Avoid technical terms like \"4K\" or \"HDR\"\n\
                 - Convey composition, lighting and mood in plain description\n\
                 - Do not use style keywords like \"digital art\" or \"photorealistic\"\n\
                 - Keep the text flowing and conversational"
            }
            ModelFamily::Sdxl => {
                "The prompt is for an SDXL model:\n\
                 - Include technical quality terms (8K, HDR, photorealistic)\n\
                 - Name artistic styles explicitly\n\
                 - Give camera details (wide angle, macro)\n\
                 - Describe the lighting in detail\n\
                 - Style keywords and artist references are fine"
            }
        }
    }
}

/// A scene that arrived without a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub title: String,
    pub scene: String,
    pub mood: String,
    /// Generation model the prompt will be used with.
    pub model: String,
}

/// Writes an initial prompt from a scene description.
#[async_trait]
pub trait PromptService: Send + Sync {
    fn id(&self) -> &str;

    async fn write_prompt(&self, request: &PromptRequest) -> Result<String, ServiceError>;
}

/// Map a non-success HTTP status to a typed failure.
pub(crate) fn error_for_status(
    service: &str,
    status: reqwest::StatusCode,
    body: &str,
    retry_after: Option<&str>,
) -> ServiceError {
    let service = service.to_string();
    let message = format!("HTTP {}: {}", status, truncate(body, 300));
    match status.as_u16() {
        401 | 403 => ServiceError::Auth { service, message },
        429 => ServiceError::RateLimited {
            service,
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000),
        },
        408 => ServiceError::Timeout {
            service,
            after_ms: 0,
        },
        s if s >= 500 => ServiceError::Server { service, message },
        _ => ServiceError::InvalidRequest { service, message },
    }
}

/// Map a reqwest transport failure.
pub(crate) fn error_for_transport(service: &str, e: &reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout {
            service: service.to_string(),
            after_ms: 0,
        }
    } else {
        ServiceError::Transport {
            service: service.to_string(),
            message: e.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
