// src/main.rs — imgrefine entry point

use clap::Parser;
use std::path::{Path, PathBuf};

use imgrefine::cli::{self, Cli, Commands};
use imgrefine::infra::config::Config;
use imgrefine::infra::{logger, paths};
use imgrefine::memory::LineageDb;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging (respects RUST_LOG)
    logger::init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(Path::new(path))?
    } else {
        Config::load()?
    };

    paths::ensure_dirs()?;
    let db_path = cli.db.map(PathBuf::from).unwrap_or_else(paths::db_path);
    let store = LineageDb::open(&db_path)?.shared();

    match cli.command {
        Commands::Import { file } => {
            cli::import::run_import(&config, &store, Path::new(&file)).await?;
        }
        Commands::Run {
            once,
            worker,
            output,
        } => {
            cli::run::run_pipeline(&config, store, once, worker, output).await?;
        }
        Commands::Status { verbose } => {
            cli::status::show_status(&store, &db_path, verbose)?;
        }
        Commands::History { scene, json } => {
            cli::status::show_history(&store, &scene, json)?;
        }
        Commands::Sweep => {
            cli::status::run_sweep(&store, &config)?;
        }
        Commands::Requeue { scene } => {
            cli::status::run_requeue(&store, &scene)?;
        }
    }
    Ok(())
}
