// src/infra/logger.rs — Structured logging with tracing

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for `--log-level`: the level applies to this crate,
/// dependencies (reqwest, hyper, rusqlite) stay at `warn`.
fn default_directive(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        // Already a full directive
        level.to_string()
    } else {
        format!("warn,imgrefine={level}")
    }
}

/// Install the global subscriber on stderr, leaving stdout to command output
/// (`history --json` is piped). `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
