use crate::transport::registry::{CliPlugin, TrackCliConfig};
use clap::{Arg, ArgMatches, Command};

pub const TOKEN_ENV: &str = "SCAN_TRACKER_TOKEN";

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_base_url")
                .long("base-url")
                .help_heading("HTTP")
                .help("Scan API base URL")
                .default_value("http://127.0.0.1:8000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_token")
                .long("token")
                .help_heading("HTTP")
                .help("Bearer token (falls back to $SCAN_TRACKER_TOKEN)")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value("ScanTracker/0.1")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Per-request timeout in seconds")
                .default_value("30")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("Retries for transient errors (network, 5xx, 429, 408)")
                .default_value("3")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .default_value("1000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_poll_interval_ms")
                .long("poll-interval-ms")
                .help_heading("HTTP")
                .help("Base polling interval in milliseconds")
                .default_value("2000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_max_poll_interval_ms")
                .long("max-poll-interval-ms")
                .help_heading("HTTP")
                .help("Upper bound for the adaptive polling interval")
                .default_value("15000")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("http_results_attempts")
                .long("results-attempts")
                .help_heading("HTTP")
                .help("How many times to re-ask for results while the server answers 202")
                .default_value("10")
                .global(true)
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut TrackCliConfig) -> anyhow::Result<()> {
        let ctx = &mut cfg.client_ctx;
        if let Some(s) = matches.get_one::<String>("http_base_url") {
            ctx.base_url = s.trim_end_matches('/').to_string();
        }
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            ctx.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            ctx.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retries") {
            ctx.retries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retry_backoff_ms") {
            ctx.retry_backoff_ms = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_poll_interval_ms") {
            ctx.poll_interval_ms = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_max_poll_interval_ms") {
            ctx.max_poll_interval_ms = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_results_attempts") {
            ctx.results_attempts = s.parse()?;
        }

        cfg.token = matches
            .get_one::<String>("http_token")
            .cloned()
            .or_else(|| std::env::var(TOKEN_ENV).ok())
            .filter(|t| !t.trim().is_empty());

        Ok(())
    }
}
