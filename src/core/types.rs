// src/core/types.rs — Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::infra::config::{Config, GenerationConfig};
use crate::infra::errors::PipelineError;

/// Lifecycle of a prompt version. Only the orchestrator moves a version between states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Draft,
    Imported,
    Completed,
    Generating,
    Evaluating,
    NeedsRefinement,
    Incomplete,
    Archived,
    Error,
}

impl PromptStatus {
    /// States a worker may claim.
    pub const ELIGIBLE: [PromptStatus; 4] = [
        PromptStatus::Draft,
        PromptStatus::Imported,
        PromptStatus::Completed,
        PromptStatus::NeedsRefinement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStatus::Draft => "draft",
            PromptStatus::Imported => "imported",
            PromptStatus::Completed => "completed",
            PromptStatus::Generating => "generating",
            PromptStatus::Evaluating => "evaluating",
            PromptStatus::NeedsRefinement => "needs_refinement",
            PromptStatus::Incomplete => "incomplete",
            PromptStatus::Archived => "archived",
            PromptStatus::Error => "error",
        }
    }

    pub fn is_eligible(&self) -> bool {
        Self::ELIGIBLE.contains(self)
    }

    /// Held under a claim; never picked up by another worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PromptStatus::Generating | PromptStatus::Evaluating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PromptStatus::Archived | PromptStatus::Error)
    }

    /// Whether `self -> to` is a legal forward edge of the lifecycle.
    pub fn can_transition_to(&self, to: PromptStatus) -> bool {
        use PromptStatus::*;
        match (self, to) {
            (Draft | Imported, Completed | Incomplete | Generating) => true,
            (Completed, Generating) => true,
            (Generating, Evaluating | Incomplete | Archived | Error) => true,
            (Evaluating, Archived | NeedsRefinement | Error) => true,
            (NeedsRefinement, Generating | Error) => true,
            (Incomplete, Imported) => true,
            _ => false,
        }
    }

    /// Whether a dropped claim on `self` may fall back to `to`, the state it
    /// was claimed from. Only the stale sweep and claim release take this path.
    pub fn can_revert_to(&self, to: PromptStatus) -> bool {
        self.is_in_flight() && to.is_eligible()
    }
}

impl std::fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft" => PromptStatus::Draft,
            "imported" => PromptStatus::Imported,
            "completed" => PromptStatus::Completed,
            "generating" => PromptStatus::Generating,
            "evaluating" => PromptStatus::Evaluating,
            "needs_refinement" => PromptStatus::NeedsRefinement,
            "incomplete" => PromptStatus::Incomplete,
            "archived" => PromptStatus::Archived,
            "error" => PromptStatus::Error,
            other => {
                return Err(PipelineError::Integrity(format!(
                    "unknown prompt status '{other}'"
                )))
            }
        })
    }
}

/// Scene identity: hex SHA-256 of the whitespace-collapsed, lowercased description.
pub fn scene_id_for(description: &str) -> String {
    let normalized = description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// A prompt as submitted or imported, before it has a lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneInput {
    /// Operator-facing label, used in artifact file names.
    pub label: String,
    pub title: String,
    pub description: String,
    pub mood: String,
    pub prompt: String,
    pub model: Option<String>,
}

/// Stable creative concept that persists across prompt refinements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub label: String,
    pub title: String,
    pub description: String,
    pub mood: String,
    pub model: Option<String>,
    pub best: Option<BestCandidate>,
    pub active_learning_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Scene {
    /// Text sent to the image service for one prompt version.
    pub fn compose_prompt(&self, prompt_text: &str) -> String {
        format!(
            "Title: {}\nScene: {}\nMood: {}\nPrompt: {}",
            self.title, self.description, self.mood, prompt_text
        )
    }
}

/// Per-scene pointer to the best (version, variant, evaluation) seen so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BestCandidate {
    pub version_id: String,
    pub variant_id: String,
    pub evaluation_id: String,
    pub iteration: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: String,
    pub scene_id: String,
    pub iteration: u32,
    pub prompt_text: String,
    pub status: PromptStatus,
    pub best_variant_id: Option<String>,
    pub best_score: Option<f64>,
    pub passed: Option<bool>,
    pub failure_cause: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_from: Option<PromptStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters sent with each generation call, kept with the variant as provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl GenerationParams {
    pub fn new(cfg: &GenerationConfig, model: Option<&str>, prompt: String) -> Self {
        Self {
            model: model.unwrap_or(&cfg.model).to_string(),
            prompt,
            negative_prompt: cfg.negative_prompt.clone(),
            width: cfg.width,
            height: cfg.height,
            num_inference_steps: cfg.num_inference_steps,
            guidance_scale: cfg.guidance_scale,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub prompt_version_id: String,
    pub variant_index: u32,
    pub storage_locator: String,
    pub params: GenerationParams,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Per-dimension judgment, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DimensionScores {
    pub object_match: f64,
    pub color_match: f64,
    pub spatial_match: f64,
    /// Higher is worse.
    pub style_deviation: f64,
    pub confidence: f64,
}

impl DimensionScores {
    pub fn neutral() -> Self {
        Self {
            object_match: 0.5,
            color_match: 0.5,
            spatial_match: 0.5,
            style_deviation: 0.5,
            confidence: 0.5,
        }
    }

    pub fn zero() -> Self {
        Self {
            object_match: 0.0,
            color_match: 0.0,
            spatial_match: 0.0,
            style_deviation: 1.0,
            confidence: 0.0,
        }
    }
}

/// Normalized evaluation of one variant. Append-only; the newest row for a variant wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub variant_id: String,
    pub description: String,
    pub dimensions: DimensionScores,
    pub missing_elements: Vec<String>,
    pub unwanted_elements: Vec<String>,
    pub style_issues: Vec<String>,
    pub adherence: f64,
    pub passed: bool,
    /// Some fields were absent and took the neutral default.
    pub incomplete: bool,
    /// The evaluator never answered; scored as failing.
    pub failed: bool,
    /// Fields the evaluator returned that have no slot in the fixed record.
    pub extra: BTreeMap<String, serde_json::Value>,
    pub evaluator: String,
    pub created_at: DateTime<Utc>,
}

/// Output of the scoring policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub score: f64,
    pub passed: bool,
}

/// A variant with its winning evaluation and classification, ready for selection.
#[derive(Debug, Clone)]
pub struct ScoredVariant {
    pub variant: Variant,
    pub evaluation: Evaluation,
    pub classification: Classification,
}

/// Values the orchestrator reads from `[pipeline]`, `[timeouts]` and `[generation]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: u32,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    pub concurrency: usize,
    pub max_prompt_chars: usize,
    pub stale_after: Duration,
    pub generation: GenerationConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.effective_batch_size(),
            max_iterations: cfg.pipeline.max_iterations,
            quality_threshold: cfg.pipeline.quality_threshold,
            concurrency: cfg.pipeline.concurrency,
            max_prompt_chars: cfg.pipeline.max_prompt_chars,
            stale_after: Duration::from_secs(cfg.timeouts.stale_after_secs),
            generation: cfg.generation.clone(),
        }
    }
}

/// Why a version cannot be sent to generation, if it cannot.
pub fn validate_prompt_text(text: &str, max_chars: usize) -> Result<(), String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("prompt text is empty".into());
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(format!("prompt text is {len} chars, limit is {max_chars}"));
    }
    Ok(())
}

/// How one claimed version ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOutcome {
    Accepted,
    Exhausted,
    Refined,
    Incomplete,
    Errored,
    ClaimLost,
    /// Claim handed back after a transient failure; the version is eligible again.
    Released,
}

/// Tally of one `run_once` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub validated: u32,
    pub claimed: u32,
    pub accepted: u32,
    pub exhausted: u32,
    pub incomplete: u32,
    pub errored: u32,
    pub lost_claims: u32,
    pub released: u32,
}

impl RunSummary {
    pub fn record(&mut self, outcome: VersionOutcome) {
        match outcome {
            VersionOutcome::Accepted => self.accepted += 1,
            VersionOutcome::Exhausted => self.exhausted += 1,
            VersionOutcome::Incomplete => self.incomplete += 1,
            VersionOutcome::Errored => self.errored += 1,
            VersionOutcome::ClaimLost => self.lost_claims += 1,
            VersionOutcome::Released => self.released += 1,
            VersionOutcome::Refined => {}
        }
    }

    /// Fold another pass into this one.
    pub fn absorb(&mut self, other: &RunSummary) {
        self.validated += other.validated;
        self.claimed += other.claimed;
        self.accepted += other.accepted;
        self.exhausted += other.exhausted;
        self.incomplete += other.incomplete;
        self.errored += other.errored;
        self.lost_claims += other.lost_claims;
        self.released += other.released;
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.validated == 0
    }
}
