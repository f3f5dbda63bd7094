// src/cli/status.rs — Status, history and maintenance commands

use crate::core::orchestrator::{requeue_scene, sweep_stale_claims};
use crate::core::types::PromptStatus;
use crate::infra::config::Config;
use crate::infra::paths;
use crate::memory::store::SceneHistory;
use crate::memory::{self, SharedStore};
use std::time::Duration;

/// Display status counts and, when verbose, every scene.
pub fn show_status(store: &SharedStore, db_path: &std::path::Path, verbose: bool) -> anyhow::Result<()> {
    let config_path = paths::config_file_path();

    println!("imgrefine v{}", env!("CARGO_PKG_VERSION"));
    println!();
    if config_path.exists() {
        println!("  Config:     {} (loaded)", config_path.display());
    } else {
        println!("  Config:     (using defaults)");
    }
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    println!("  Database:   {} ({})", db_path.display(), format_bytes(db_size));

    let store = memory::lock(store)?;
    let counts = store.status_counts()?;
    println!();
    println!("  Prompt versions:");
    if counts.is_empty() {
        println!("    (none)");
    }
    for (status, count) in &counts {
        println!("    {:<18} {}", status.as_str(), count);
    }

    if verbose {
        println!();
        println!("  Scenes:");
        for scene in store.list_scenes()? {
            let latest = store
                .versions_for_scene(&scene.scene_id)?
                .into_iter()
                .last();
            let state = latest
                .as_ref()
                .map(|v| format!("iter {} {}", v.iteration, v.status))
                .unwrap_or_else(|| "-".into());
            let best = scene
                .best
                .as_ref()
                .map(|b| format!("{:.3} (iter {})", b.score, b.iteration))
                .unwrap_or_else(|| "-".into());
            println!(
                "    {}  {:<20} {:<26} best {}",
                &scene.scene_id[..12],
                scene.label,
                state,
                best
            );
        }
    }

    let calls = store.api_calls(None)?;
    if verbose && !calls.is_empty() {
        let failed = calls.iter().filter(|c| c.status != "ok").count();
        println!();
        println!("  Service calls: {} total, {} failed", calls.len(), failed);
    }
    Ok(())
}

/// Print the lineage of one scene, oldest iteration first.
pub fn show_history(store: &SharedStore, key: &str, json: bool) -> anyhow::Result<()> {
    let history = {
        let store = memory::lock(store)?;
        let scene = store
            .find_scene(key)?
            .ok_or_else(|| anyhow::anyhow!("no scene matches '{key}'"))?;
        store
            .scene_history(&scene.scene_id)?
            .ok_or_else(|| anyhow::anyhow!("scene '{key}' disappeared"))?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        print!("{}", render_history(&history));
    }
    Ok(())
}

fn render_history(h: &SceneHistory) -> String {
    let mut out = String::new();
    let s = &h.scene;
    out.push_str(&format!("{} [{}]\n", s.label, s.scene_id));
    out.push_str(&format!("  {}: {}\n", s.title, s.description));
    if let Some(best) = &s.best {
        out.push_str(&format!(
            "  best: iteration {} variant {} score {:.3}\n",
            best.iteration, best.variant_id, best.score
        ));
    }
    for vh in &h.versions {
        let v = &vh.version;
        out.push_str(&format!("\n  iteration {} — {}\n", v.iteration, v.status));
        out.push_str(&format!("    prompt: {}\n", v.prompt_text));
        if let Some(cause) = &v.failure_cause {
            out.push_str(&format!("    cause:  {cause}\n"));
        }
        for (variant, evals) in &vh.variants {
            let latest = evals.last();
            let score = latest
                .map(|e| format!("{:.3}{}", e.adherence, if e.passed { " pass" } else { "" }))
                .unwrap_or_else(|| "unevaluated".into());
            out.push_str(&format!(
                "    v{} {}  {}\n",
                variant.variant_index, score, variant.storage_locator
            ));
        }
    }
    if !h.learnings.is_empty() {
        out.push_str("\n  learnings:\n");
        for l in &h.learnings {
            let terms: Vec<&str> = l
                .patterns
                .failed_terms
                .iter()
                .take(5)
                .map(|t| t.term.as_str())
                .collect();
            out.push_str(&format!(
                "    {} {:<10} missing: {}\n",
                &l.id[..8.min(l.id.len())],
                l.status.as_str(),
                if terms.is_empty() { "-".to_string() } else { terms.join(", ") }
            ));
        }
    }
    out
}

pub fn run_sweep(store: &SharedStore, config: &Config) -> anyhow::Result<()> {
    let window = Duration::from_secs(config.timeouts.stale_after_secs);
    let reverted = sweep_stale_claims(store, window)?;
    println!("Reverted {} stale claim(s)", reverted.len());
    Ok(())
}

pub fn run_requeue(store: &SharedStore, key: &str) -> anyhow::Result<()> {
    let count = requeue_scene(store, key)?;
    println!(
        "Requeued {count} version(s) as {}",
        PromptStatus::Imported.as_str()
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
