use async_trait::async_trait;
use crate::core::error::TrackerError;
use crate::core::model::{FullResults, TaskView};
use clap::{ArgMatches, Command};
use std::time::Duration;

/// Source of the access token. Read-only; nothing here ever writes it back.
pub trait SessionProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl SessionProvider for StaticToken {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn log_error(&self, scope: &str, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn log_error(&self, scope: &str, message: &str) {
        tracing::error!(scope, "{}", message);
    }
}

/// Keeps every reported error in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingDiagnostics {
    entries: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingDiagnostics {
    pub(crate) fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn scopes(&self) -> Vec<String> {
        self.entries().into_iter().map(|(scope, _)| scope).collect()
    }
}

#[cfg(test)]
impl DiagnosticsSink for RecordingDiagnostics {
    fn log_error(&self, scope: &str, message: &str) {
        self.entries.lock().unwrap().push((scope.to_string(), message.to_string()));
    }
}

/// Single-shot snapshot requests. No caching: every call is a round-trip.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskView, TrackerError>;

    /// Fails with `NotReady` while the server still answers 202.
    async fn fetch_results(&self, task_id: &str) -> Result<FullResults, TrackerError>;
}

#[derive(Debug, Clone)]
pub struct ClientContext {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub results_attempts: u32,
    pub prefer_stream: bool,
    pub idle_timeout_secs: u64,
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            user_agent: "ScanTracker/0.1".to_string(),
            timeout_secs: 30,
            retries: 3,
            retry_backoff_ms: 1000,
            poll_interval_ms: 2000,
            max_poll_interval_ms: 15_000,
            results_attempts: 10,
            prefer_stream: true,
            idle_timeout_secs: 60,
            max_reconnects: 3,
            reconnect_delay_ms: 3000,
        }
    }
}

impl ClientContext {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1))
    }

    /// `None` disables the stream idle watchdog.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn retry_options(&self) -> crate::core::retry::RetryOptions {
        crate::core::retry::RetryOptions::new(self.retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackCliConfig {
    pub token: Option<String>,
    pub client_ctx: ClientContext,
}

/// A transport that contributes its own command-line flags.
pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut TrackCliConfig) -> anyhow::Result<()>;
}

pub struct TransportRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl TransportRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::transport::http::cli::HttpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::transport::stream::cli::StreamCliPlugin::new()));
        reg
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.cli_plugins.iter().map(|p| p.name()).collect()
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, cfg: &mut TrackCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, cfg)?;
        }
        Ok(())
    }
}
