// src/infra/paths.rs — Path management
//
// All paths respect the IMGREFINE_HOME environment variable for isolation.
// When IMGREFINE_HOME is set, config, database and images live under it.
// When unset, config uses ~/.imgrefine/ and data uses XDG_DATA_HOME/imgrefine.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

fn imgrefine_home() -> Option<PathBuf> {
    std::env::var_os("IMGREFINE_HOME").map(PathBuf::from)
}

/// Home directory, falling back to the working directory on exotic platforms.
pub fn dirs_home() -> PathBuf {
    BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory: $IMGREFINE_HOME/ or ~/.imgrefine/
pub fn config_dir() -> PathBuf {
    if let Some(home) = imgrefine_home() {
        return home;
    }
    dirs_home().join(".imgrefine")
}

/// Data directory: $IMGREFINE_HOME/data/ or ~/.local/share/imgrefine/
pub fn data_dir() -> PathBuf {
    if let Some(home) = imgrefine_home() {
        return home.join("data");
    }
    ProjectDirs::from("", "", "imgrefine")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| config_dir().join("data"))
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Lineage database
pub fn db_path() -> PathBuf {
    data_dir().join("lineage.db")
}

/// Root for generated artifacts; images land in `<root>/images`.
pub fn output_dir() -> PathBuf {
    data_dir().join("outputs")
}

/// Create the data directories if missing.
pub fn ensure_dirs() -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir())?;
    std::fs::create_dir_all(output_dir().join("images"))?;
    Ok(())
}
