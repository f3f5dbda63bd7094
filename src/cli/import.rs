// src/cli/import.rs — Prompt import from JSON files

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::core::orchestrator::register_scene;
use crate::core::types::{scene_id_for, PromptStatus, SceneInput};
use crate::infra::config::Config;
use crate::memory::{self, SharedStore, StoreAudit};
use crate::provider::google::{GeminiClient, GeminiPromptService};
use crate::provider::retry::{call_with_retry, CallAudit, RetryPolicy};
use crate::provider::{PromptRequest, PromptService};

#[derive(Debug, Deserialize)]
struct ImportFile {
    #[serde(default)]
    model: Option<String>,
    prompts: Vec<ImportEntry>,
}

#[derive(Debug, Deserialize)]
struct ImportEntry {
    id: String,
    #[serde(default)]
    title: String,
    scene: String,
    #[serde(default)]
    mood: String,
    /// Written by the prompt service at import when absent or blank.
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Outcome of one import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    /// Prompts written by the prompt service.
    pub generated: usize,
    /// Entries left out because no prompt could be written; a later import retries them.
    pub failed: Vec<String>,
}

/// Prompt writer used for entries without a prompt.
pub struct PromptWriter<'a> {
    pub service: &'a dyn PromptService,
    pub retry: RetryPolicy,
    pub audit: &'a dyn CallAudit,
    /// Generation model assumed when neither the entry nor the file names one.
    pub default_model: String,
}

/// Parse and check an import document. Entry model overrides the file model.
/// Missing prompts come back empty.
pub fn parse_import(text: &str) -> anyhow::Result<Vec<SceneInput>> {
    let file: ImportFile = serde_json::from_str(text).context("invalid import file")?;
    if file.prompts.is_empty() {
        bail!("import file contains no prompts");
    }

    let mut seen = HashSet::new();
    let mut inputs = Vec::with_capacity(file.prompts.len());
    for (pos, entry) in file.prompts.into_iter().enumerate() {
        let id = entry.id.trim().to_string();
        if id.is_empty() {
            bail!("prompt #{pos} has an empty id");
        }
        if !seen.insert(id.clone()) {
            bail!("duplicate prompt id '{id}'");
        }
        if entry.scene.trim().is_empty() {
            bail!("prompt '{id}' has an empty scene description");
        }
        inputs.push(SceneInput {
            label: id,
            title: entry.title,
            description: entry.scene,
            mood: entry.mood,
            prompt: entry.prompt.unwrap_or_default(),
            model: entry.model.or_else(|| file.model.clone()),
        });
    }
    Ok(inputs)
}

/// Register `inputs` as `imported` iteration-0 versions. Known scenes are
/// skipped without any service call; new scenes without a prompt get one
/// from `writer`.
pub async fn import_inputs(
    store: &SharedStore,
    inputs: Vec<SceneInput>,
    writer: Option<&PromptWriter<'_>>,
) -> anyhow::Result<ImportReport> {
    let mut report = ImportReport::default();
    for mut input in inputs {
        let known = memory::lock(store)?
            .get_scene(&scene_id_for(&input.description))?
            .is_some();
        if known {
            report.skipped += 1;
            continue;
        }

        if input.prompt.trim().is_empty() {
            let Some(writer) = writer else {
                bail!(
                    "prompt '{}' has no prompt text and no prompt service is configured",
                    input.label
                );
            };
            let request = PromptRequest {
                title: input.title.clone(),
                scene: input.description.clone(),
                mood: input.mood.clone(),
                model: input
                    .model
                    .clone()
                    .unwrap_or_else(|| writer.default_model.clone()),
            };
            let written = call_with_retry(
                &writer.retry,
                writer.audit,
                writer.service.id(),
                "write_prompt",
                || writer.service.write_prompt(&request),
            )
            .await;
            match written {
                Ok(text) => {
                    info!(scene = %input.label, model = %request.model, "Prompt written");
                    input.prompt = text;
                    report.generated += 1;
                }
                Err(e) => {
                    warn!(scene = %input.label, "No prompt written: {e}");
                    report.failed.push(input.label.clone());
                    continue;
                }
            }
        }

        match register_scene(store, &input, PromptStatus::Imported)? {
            Some(_) => report.imported += 1,
            None => report.skipped += 1,
        }
    }
    Ok(report)
}

/// Import every prompt of `path`. A Gemini prompt writer is set up only when
/// a new entry lacks a prompt.
pub async fn run_import(
    config: &Config,
    store: &SharedStore,
    path: &Path,
) -> anyhow::Result<ImportReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let inputs = parse_import(&text)?;

    let needs_writer = {
        let store = memory::lock(store)?;
        let mut needs = false;
        for input in inputs.iter().filter(|i| i.prompt.trim().is_empty()) {
            if store.get_scene(&scene_id_for(&input.description))?.is_none() {
                needs = true;
                break;
            }
        }
        needs
    };

    let report = if needs_writer {
        let key = super::run::api_key(&config.services.gemini_key_env)
            .context("entries without a prompt need the prompt service")?;
        let service = GeminiPromptService::new(
            GeminiClient::new(key),
            config.services.prompt_model.clone(),
        );
        let audit = StoreAudit::new(store.clone());
        let writer = PromptWriter {
            service: &service,
            retry: RetryPolicy::from_config(&config.retry, &config.timeouts),
            audit: &audit,
            default_model: config.generation.model.clone(),
        };
        import_inputs(store, inputs, Some(&writer)).await?
    } else {
        import_inputs(store, inputs, None).await?
    };

    println!(
        "Imported {} prompt(s), {} already known, {} prompt(s) written",
        report.imported, report.skipped, report.generated
    );
    if !report.failed.is_empty() {
        println!("No prompt could be written for: {}", report.failed.join(", "));
    }
    Ok(report)
}
