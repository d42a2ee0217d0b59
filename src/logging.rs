use tracing_subscriber::{fmt, EnvFilter};

/// Human-readable log output on stderr.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "scan_tracker=debug,warn").
/// Later calls are no-ops.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();
}

/// One JSON object per line on stderr, for log shippers.
pub fn init_logging_json(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    tracing::debug!("json logging initialised");
}
