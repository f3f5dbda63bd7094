// src/provider/google.rs — Gemini vision evaluation, prompt refinement and prompt writing
//
// All services call `generateContent`; the vision service sends the image
// inline as base64 and asks for a JSON judgment.

use async_trait::async_trait;
use base64::Engine;

use super::{
    error_for_status, error_for_transport, FailureContext, ImageArtifact, ModelFamily,
    PromptRequest, PromptService, RefineService, VisionJudgment, VisionService,
};
use crate::infra::errors::ServiceError;

const SERVICE: &str = "gemini";

/// Thin `generateContent` client shared by the two Gemini services.
#[derive(Clone)]
pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> &str {
        "https://generativelanguage.googleapis.com/v1beta"
    }

    /// Concatenated text parts of the first candidate.
    pub async fn generate_text(
        &self,
        model: &str,
        body: &serde_json::Value,
    ) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url(),
            model,
            self.api_key,
        );

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| error_for_transport(SERVICE, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let error_body = response.text().await.unwrap_or_default();
            return Err(error_for_status(
                SERVICE,
                status,
                &error_body,
                retry_after.as_deref(),
            ));
        }

        let resp: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ServiceError::MalformedResponse {
                    service: SERVICE.into(),
                    message: format!("Failed to parse response: {e}"),
                })?;

        let content = candidate_text(&resp);
        if content.trim().is_empty() {
            return Err(ServiceError::MalformedResponse {
                service: SERVICE.into(),
                message: format!(
                    "empty candidate (finishReason {})",
                    resp["candidates"][0]["finishReason"]
                        .as_str()
                        .unwrap_or("unknown")
                ),
            });
        }
        Ok(content)
    }
}

fn candidate_text(resp: &serde_json::Value) -> String {
    resp["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Drop a surrounding Markdown code fence, if any.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ─── Vision ─────────────────────────────────────────────────────

const VISION_INSTRUCTION: &str = "You judge how well a generated image adheres to the prompt \
that produced it. Minor variations are acceptable; focus on significant deviations. \
Reply with a single JSON object with these keys: \
description (string, what the image shows), \
object_match, color_match, spatial_match (numbers 0-1, higher is better), \
style_deviation (number 0-1, higher is worse), confidence (number 0-1), \
missing_elements, unwanted_elements, style_issues (arrays of short strings).";

pub struct GeminiVisionService {
    client: GeminiClient,
    model: String,
}

impl GeminiVisionService {
    pub fn new(client: GeminiClient, model: String) -> Self {
        Self { client, model }
    }

    fn build_request_body(image: &ImageArtifact, prompt: &str) -> serde_json::Value {
        let data = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
        serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": format!("{VISION_INSTRUCTION}\n\nPrompt:\n{prompt}") },
                    { "inline_data": { "mime_type": image.content_type, "data": data } },
                ],
            }],
            "generationConfig": {
                "temperature": 0.0,
                "responseMimeType": "application/json",
            },
        })
    }
}

/// Structured part of a reply when it parses as JSON, otherwise the text itself.
pub fn judgment_from_text(text: &str) -> VisionJudgment {
    let body = strip_fences(text);
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(raw) if raw.is_object() => VisionJudgment {
            description: raw["description"].as_str().unwrap_or_default().to_string(),
            raw,
        },
        _ => VisionJudgment {
            description: body.to_string(),
            raw: serde_json::Value::String(body.to_string()),
        },
    }
}

#[async_trait]
impl VisionService for GeminiVisionService {
    fn id(&self) -> &str {
        SERVICE
    }

    async fn evaluate(
        &self,
        image: &ImageArtifact,
        prompt: &str,
    ) -> Result<VisionJudgment, ServiceError> {
        let body = Self::build_request_body(image, prompt);
        let text = self.client.generate_text(&self.model, &body).await?;
        Ok(judgment_from_text(&text))
    }
}

// ─── Refinement ─────────────────────────────────────────────────

pub struct GeminiRefineService {
    client: GeminiClient,
    model: String,
}

impl GeminiRefineService {
    pub fn new(client: GeminiClient, model: String) -> Self {
        Self { client, model }
    }

    fn build_instruction(prompt: &str, context: &FailureContext) -> String {
        let list = |terms: &[crate::learner::types::TermCount]| {
            if terms.is_empty() {
                "none".to_string()
            } else {
                terms
                    .iter()
                    .map(|t| format!("{} (x{})", t.term, t.count))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };
        let p = &context.patterns;
        let mut out = String::new();
        out.push_str(
            "You rewrite image-generation prompts. The prompt below was used for several \
             images and none met the quality bar. Write an improved prompt that keeps the \
             scene's intent, states the missing elements explicitly and discourages the \
             recurring artifacts.\n\n",
        );
        out.push_str(&format!("Title: {}\n", context.title));
        out.push_str(&format!("Scene: {}\n", context.scene_description));
        out.push_str(&format!("Mood: {}\n", context.mood));
        out.push_str(&format!("Iteration: {}\n", context.iteration));
        out.push_str(&format!("Current prompt: {prompt}\n\n"));
        out.push_str(&format!(
            "Failure history over {} iteration(s):\n",
            context.chain_depth
        ));
        out.push_str(&format!("- Missing elements: {}\n", list(&p.failed_terms)));
        out.push_str(&format!("- Recurring artifacts: {}\n", list(&p.common_artifacts)));
        out.push_str(&format!("- Style problems: {}\n", list(&p.style_violations)));
        out.push_str(&format!(
            "- Scores: min {:.2}, max {:.2}, mean {:.2} over {} images\n",
            p.score_distribution.min,
            p.score_distribution.max,
            p.score_distribution.mean,
            p.score_distribution.count
        ));
        if let Some(desc) = &context.best_description {
            out.push_str(&format!("\nBest image so far showed: {desc}\n"));
        }
        out.push_str("\nReply with the new prompt text only.");
        out
    }
}

#[async_trait]
impl RefineService for GeminiRefineService {
    fn id(&self) -> &str {
        SERVICE
    }

    async fn refine(&self, prompt: &str, context: &FailureContext) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": Self::build_instruction(prompt, context) }],
            }],
            "generationConfig": { "temperature": 0.7 },
        });
        let text = self.client.generate_text(&self.model, &body).await?;
        Ok(strip_fences(&text).trim_matches('"').trim().to_string())
    }
}

// ─── Prompt writing ─────────────────────────────────────────────

const PROMPT_WRITER_INSTRUCTION: &str = "You write prompts for AI image generation. \
Turn the scene below into a concise prompt about what is visible: subjects, composition, \
lighting, colors. Start with the subject, not with phrases like \"an image of\". \
No commentary, no explanations, under 100 words.";

pub struct GeminiPromptService {
    client: GeminiClient,
    model: String,
}

impl GeminiPromptService {
    pub fn new(client: GeminiClient, model: String) -> Self {
        Self { client, model }
    }

    fn build_instruction(request: &PromptRequest) -> String {
        format!(
            "{PROMPT_WRITER_INSTRUCTION}\n\n{}\n\nTitle: {}\nScene: {}\nMood: {}\n\n\
             Reply with the prompt text only.",
            ModelFamily::of(&request.model).guidance(),
            request.title,
            request.scene,
            request.mood,
        )
    }
}

#[async_trait]
impl PromptService for GeminiPromptService {
    fn id(&self) -> &str {
        SERVICE
    }

    async fn write_prompt(&self, request: &PromptRequest) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": Self::build_instruction(request) }],
            }],
            "generationConfig": { "temperature": 0.7 },
        });
        let text = self.client.generate_text(&self.model, &body).await?;
        let prompt = strip_fences(&text).trim_matches('"').trim().to_string();
        if prompt.is_empty() {
            return Err(ServiceError::MalformedResponse {
                service: SERVICE.into(),
                message: "empty prompt".into(),
            });
        }
        Ok(prompt)
    }
}
