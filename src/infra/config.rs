// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::infra::errors::PipelineError;
use crate::infra::paths;

/// Hard limits on the configurable batch bounds.
pub const BATCH_LIMIT_MIN: u32 = 1;
pub const BATCH_LIMIT_MAX: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub batch_size: u32,
    pub min_batch: u32,
    pub max_batch: u32,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    /// Prompts processed concurrently by one orchestrator; also the variant fan-out cap.
    pub concurrency: usize,
    /// Upper bound on prompt text accepted by validation.
    pub max_prompt_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            min_batch: 3,
            max_batch: 7,
            max_iterations: 3,
            quality_threshold: 0.7,
            concurrency: 4,
            max_prompt_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per collaborator call, each attempt.
    pub call_timeout_secs: u64,
    /// Claims older than this are reverted by the sweep.
    pub stale_after_secs: u64,
    /// Status polling interval for queued image jobs.
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            stale_after_secs: 900,
            poll_interval_ms: 1_000,
        }
    }
}

/// Weight table consumed by the scoring policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub object_match: f64,
    pub color_match: f64,
    pub spatial_match: f64,
    /// Weight of `1 - style_deviation`.
    pub style_fidelity: f64,
    pub missing_element_penalty: f64,
    pub unwanted_element_penalty: f64,
    /// Cap on the summed element penalties.
    pub max_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            object_match: 0.35,
            color_match: 0.20,
            spatial_match: 0.25,
            style_fidelity: 0.20,
            missing_element_penalty: 0.05,
            unwanted_element_penalty: 0.03,
            max_penalty: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub negative_prompt: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "fal-ai/fast-lightning-sdxl".into(),
            width: 1024,
            height: 1024,
            negative_prompt: "blurry, low quality, distorted, deformed, ugly, bad anatomy".into(),
            num_inference_steps: 30,
            guidance_scale: 7.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub vision_model: String,
    pub refine_model: String,
    /// Writes prompts for imported scenes that arrive without one.
    #[serde(default = "default_prompt_model")]
    pub prompt_model: String,
    /// Environment variable holding the fal.ai key.
    pub fal_key_env: String,
    /// Environment variable holding the Gemini key.
    pub gemini_key_env: String,
}

fn default_prompt_model() -> String {
    "gemini-2.0-flash".into()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            vision_model: "gemini-2.0-flash".into(),
            refine_model: "gemini-2.0-flash".into(),
            prompt_model: default_prompt_model(),
            fal_key_env: "FAL_KEY".into(),
            gemini_key_env: "GEMINI_API_KEY".into(),
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let p = &self.pipeline;
        if p.min_batch < BATCH_LIMIT_MIN || p.max_batch > BATCH_LIMIT_MAX {
            return Err(PipelineError::Config(format!(
                "batch bounds {}..={} outside {}..={}",
                p.min_batch, p.max_batch, BATCH_LIMIT_MIN, BATCH_LIMIT_MAX
            )));
        }
        if p.min_batch > p.max_batch {
            return Err(PipelineError::Config(format!(
                "min_batch {} exceeds max_batch {}",
                p.min_batch, p.max_batch
            )));
        }
        if !(0.0..=1.0).contains(&p.quality_threshold) {
            return Err(PipelineError::Config(format!(
                "quality_threshold {} outside [0, 1]",
                p.quality_threshold
            )));
        }
        if p.max_iterations == 0 {
            return Err(PipelineError::Config("max_iterations must be >= 1".into()));
        }
        if p.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    /// Requested batch size clamped into the configured bounds.
    pub fn effective_batch_size(&self) -> u32 {
        self.pipeline
            .batch_size
            .clamp(self.pipeline.min_batch, self.pipeline.max_batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let c = Config::default();
        assert_eq!(c.pipeline.batch_size, 5);
        assert_eq!(c.pipeline.max_iterations, 3);
        assert!((c.pipeline.quality_threshold - 0.7).abs() < 1e-9);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay_ms, 2_000);
        assert_eq!(c.retry.max_delay_ms, 60_000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_scoring_weights_sum_to_one() {
        let s = ScoringConfig::default();
        let sum = s.object_match + s.color_match + s.spatial_match + s.style_fidelity;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.pipeline.max_iterations, 3);
        assert_eq!(config.generation.width, 1024);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[pipeline]
batch_size = 7
min_batch = 3
max_batch = 7
max_iterations = 5
quality_threshold = 0.8
concurrency = 2
max_prompt_chars = 2000

[retry]
max_attempts = 4
base_delay_ms = 500
max_delay_ms = 10000
jitter_fraction = 0.1

[timeouts]
call_timeout_secs = 30
stale_after_secs = 60
poll_interval_ms = 250

[generation]
model = "fal-ai/flux/dev"
width = 768
height = 512
negative_prompt = "text"
num_inference_steps = 20
guidance_scale = 5.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pipeline.batch_size, 7);
        assert_eq!(config.pipeline.max_iterations, 5);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.timeouts.stale_after_secs, 60);
        assert_eq!(config.generation.model, "fal-ai/flux/dev");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_batch_bounds() {
        let mut c = Config::default();
        c.pipeline.min_batch = 6;
        c.pipeline.max_batch = 4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut c = Config::default();
        c.pipeline.quality_threshold = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_effective_batch_size_clamped() {
        let mut c = Config::default();
        c.pipeline.batch_size = 12;
        assert_eq!(c.effective_batch_size(), 7);
        c.pipeline.batch_size = 1;
        assert_eq!(c.effective_batch_size(), 3);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.scoring, config.scoring);
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(Config::load_from(Path::new("/nonexistent/config.toml")).is_err());
    }
}
