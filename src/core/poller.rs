//! Request/response fallback: fetch, deliver, wait, repeat.

use crate::core::error::TrackerError;
use crate::core::gate::DeliveryGate;
use crate::core::model::{FullResults, TaskId, TaskView};
use crate::core::retry::{default_retry_predicate, execute_with_retry, RetryOptions};
use crate::transport::registry::{DiagnosticsSink, SnapshotSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// After a failed fetch the next one waits at least this long.
pub const ERROR_BACKOFF_FLOOR: Duration = Duration::from_millis(3000);

/// What the update callback wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep polling. `Some` replaces the interval; a zero duration stops.
    Continue(Option<Duration>),
    Stop,
}

impl PollOutcome {
    pub fn keep() -> Self {
        Self::Continue(None)
    }
}

type UpdateFn = Box<dyn FnMut(&TaskView) -> PollOutcome + Send>;
type ErrorFn = Box<dyn FnMut(&TrackerError) -> PollOutcome + Send>;

pub struct PollHandle {
    gate: Arc<DeliveryGate>,
    stopped: watch::Receiver<bool>,
}

impl PollHandle {
    /// Idempotent. Cancels the pending fetch; no callback runs once this returns.
    pub async fn stop(&self) {
        self.gate.shut().await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once the loop has exited, for whatever reason.
    pub async fn finished(&self) {
        let mut rx = self.stopped.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Poller<S: SnapshotSource + ?Sized> {
    source: Arc<S>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    retry: RetryOptions,
    on_error: Option<ErrorFn>,
}

impl<S: SnapshotSource + ?Sized + 'static> Poller<S> {
    pub fn new(source: Arc<S>, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self { source, diagnostics, retry: RetryOptions::default(), on_error: None }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Consulted after a fetch has exhausted its retries. Without it the loop
    /// keeps going on every error.
    pub fn on_error(mut self, f: impl FnMut(&TrackerError) -> PollOutcome + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Fetches immediately, then every `initial_interval` (or whatever
    /// `on_update` asks for) until a terminal status, a `Stop`, or `stop()`.
    pub fn start_polling(
        self,
        task_id: impl Into<TaskId>,
        initial_interval: Duration,
        on_update: impl FnMut(&TaskView) -> PollOutcome + Send + 'static,
    ) -> PollHandle {
        let gate = Arc::new(DeliveryGate::new());
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let task_id = task_id.into();
        let gate2 = gate.clone();

        tokio::spawn(async move {
            self.run(&task_id, initial_interval, Box::new(on_update), &gate2).await;
            stopped_tx.send_replace(true);
        });

        PollHandle { gate, stopped: stopped_rx }
    }

    async fn run(mut self, task_id: &str, initial_interval: Duration, mut on_update: UpdateFn, gate: &DeliveryGate) {
        let token = gate.token().clone();
        let mut interval = initial_interval;
        let mut fetches = 0u64;

        loop {
            // at most one fetch in flight: the next is only scheduled after this one resolves
            fetches += 1;
            let source = self.source.clone();
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                r = execute_with_retry(
                    &self.retry,
                    || source.fetch_status(task_id),
                    default_retry_predicate,
                    |attempt, e| tracing::debug!(task_id, attempt, error = %e, "retrying status fetch"),
                ) => r,
            };

            let delay = match fetched {
                Ok(view) => {
                    let terminal = view.status.is_terminal();
                    let Some(outcome) = gate.deliver(|| on_update(&view)).await else {
                        break;
                    };
                    if terminal {
                        tracing::debug!(task_id, status = %view.status, fetches, "terminal status, polling stopped");
                        break;
                    }
                    match outcome {
                        PollOutcome::Stop => break,
                        PollOutcome::Continue(Some(d)) if d.is_zero() => break,
                        PollOutcome::Continue(Some(d)) => {
                            interval = d;
                            d
                        }
                        PollOutcome::Continue(None) => interval,
                    }
                }
                Err(e) => {
                    self.diagnostics.log_error("poll", &format!("task {}: {}", task_id, e));
                    if let Some(f) = self.on_error.as_mut() {
                        match gate.deliver(|| f(&e)).await {
                            None | Some(PollOutcome::Stop) => break,
                            Some(_) => {}
                        }
                    }
                    interval.max(ERROR_BACKOFF_FLOOR)
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Asks for results, waiting `interval` between tries while the server
/// answers 202. Gives up with `NotReady` after `max_attempts` tries.
pub async fn fetch_results_when_ready<S: SnapshotSource + ?Sized>(
    source: &S,
    task_id: &str,
    interval: Duration,
    max_attempts: u32,
) -> Result<FullResults, TrackerError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match source.fetch_results(task_id).await {
            Err(TrackerError::NotReady(_)) if attempt < max_attempts.max(1) => {
                tracing::debug!(task_id, attempt, "results not ready yet");
                sleep(interval).await;
            }
            other => return other,
        }
    }
}
