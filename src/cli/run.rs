// src/cli/run.rs — `run`: drive the pipeline until idle

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::core::orchestrator::{Collaborators, Orchestrator};
use crate::core::types::RunSummary;
use crate::infra::config::Config;
use crate::infra::paths;
use crate::memory::artifacts::ArtifactStore;
use crate::memory::SharedStore;
use crate::provider::fal::FalImageService;
use crate::provider::google::{GeminiClient, GeminiRefineService, GeminiVisionService};

pub(crate) fn api_key(env_name: &str) -> anyhow::Result<String> {
    match std::env::var(env_name) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => anyhow::bail!("{env_name} is not set"),
    }
}

/// HTTP-backed collaborators, keys read from the environment.
pub fn build_services(config: &Config) -> anyhow::Result<Collaborators> {
    let fal_key = api_key(&config.services.fal_key_env)?;
    let gemini_key = api_key(&config.services.gemini_key_env)?;
    let gemini = GeminiClient::new(gemini_key);

    Ok(Collaborators {
        image: Arc::new(FalImageService::new(
            fal_key,
            Duration::from_millis(config.timeouts.poll_interval_ms),
        )),
        vision: Arc::new(GeminiVisionService::new(
            gemini.clone(),
            config.services.vision_model.clone(),
        )),
        refine: Arc::new(GeminiRefineService::new(
            gemini,
            config.services.refine_model.clone(),
        )),
    })
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
    format!("{host}-{}", std::process::id())
}

pub async fn run_pipeline(
    config: &Config,
    store: SharedStore,
    once: bool,
    worker: Option<String>,
    output: Option<String>,
) -> anyhow::Result<RunSummary> {
    let services = build_services(config).context("collaborator setup failed")?;
    let output_dir = output.map(PathBuf::from).unwrap_or_else(paths::output_dir);
    let worker_id = worker.unwrap_or_else(default_worker_id);

    // Ctrl-C flips the flag; the orchestrator stops claiming and lets in-flight calls finish
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown requested, finishing in-flight work");
            let _ = tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(
        config,
        store,
        ArtifactStore::new(output_dir),
        services,
        worker_id,
    )
    .with_shutdown(rx);

    let summary = if once {
        orchestrator.sweep_stale()?;
        orchestrator.run_once().await?
    } else {
        orchestrator.run_until_idle().await?
    };

    println!(
        "Claimed {} | accepted {} | exhausted {} | incomplete {} | error {} | lost claims {} | released {}",
        summary.claimed,
        summary.accepted,
        summary.exhausted,
        summary.incomplete,
        summary.errored,
        summary.lost_claims,
        summary.released
    );
    Ok(summary)
}
