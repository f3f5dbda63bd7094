// src/cli/mod.rs — CLI definition (clap derive)

pub mod import;
pub mod run;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "imgrefine", about = "Iterative image refinement pipeline", version)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Lineage database path (defaults to the data directory)
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import prompts from a JSON file
    Import {
        /// File of the form {"model"?: str, "prompts": [{id, title, scene, mood, prompt?, model?}]}.
        /// Missing prompts are written by Gemini from title, scene and mood.
        file: String,
    },
    /// Process eligible prompts until idle (Ctrl-C stops claiming new work)
    Run {
        /// Run a single pass instead of looping until idle
        #[arg(long)]
        once: bool,
        /// Worker id recorded on claims (defaults to host-pid)
        #[arg(long)]
        worker: Option<String>,
        /// Directory for generated images (defaults to the data directory)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Show status counts and scenes
    Status {
        /// List every scene with its best candidate
        #[arg(long)]
        verbose: bool,
    },
    /// Dump the full lineage of one scene
    History {
        /// Scene id, id prefix or label
        scene: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Revert stale in-flight claims to their eligible state
    Sweep,
    /// Send a scene's incomplete versions back to imported
    Requeue {
        /// Scene id, id prefix or label
        scene: String,
    },
}
