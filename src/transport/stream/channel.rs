use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, USER_AGENT};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::core::error::{is_retryable_status, TrackerError};
use crate::core::events::StreamEvent;
use crate::core::gate::DeliveryGate;
use crate::core::model::{DonePayload, FullResults, ModuleStatus, ResultChunk, ServerError, StatusUpdate};
use crate::transport::http::client::ScanClient;
use crate::transport::registry::{ClientContext, DiagnosticsSink};
use crate::transport::stream::parser::SseParser;

pub type Handler<T> = Box<dyn FnMut(&T) + Send>;

/// Optional callback per event kind. Events without a handler are dropped.
#[derive(Default)]
pub struct StreamHandlers {
    on_status: Option<Handler<StatusUpdate>>,
    on_module_status: Option<Handler<ModuleStatus>>,
    on_result: Option<Handler<ResultChunk>>,
    on_results: Option<Handler<FullResults>>,
    on_done: Option<Handler<DonePayload>>,
    on_error: Option<Handler<ServerError>>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(mut self, f: impl FnMut(&StatusUpdate) + Send + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn on_module_status(mut self, f: impl FnMut(&ModuleStatus) + Send + 'static) -> Self {
        self.on_module_status = Some(Box::new(f));
        self
    }

    pub fn on_result(mut self, f: impl FnMut(&ResultChunk) + Send + 'static) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn on_results(mut self, f: impl FnMut(&FullResults) + Send + 'static) -> Self {
        self.on_results = Some(Box::new(f));
        self
    }

    pub fn on_done(mut self, f: impl FnMut(&DonePayload) + Send + 'static) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&ServerError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn dispatch(&mut self, ev: &StreamEvent) {
        fn call<T>(h: &mut Option<Handler<T>>, v: &T) {
            if let Some(f) = h.as_mut() {
                f(v);
            }
        }
        match ev {
            StreamEvent::Status(v) => call(&mut self.on_status, v),
            StreamEvent::ModuleStatus(v) => call(&mut self.on_module_status, v),
            StreamEvent::Result(v) => call(&mut self.on_result, v),
            StreamEvent::FullResults(v) => call(&mut self.on_results, v),
            StreamEvent::Done(v) => call(&mut self.on_done, v),
            StreamEvent::Error(v) => call(&mut self.on_error, v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamExit {
    /// A `done` event was delivered.
    Done,
    /// The caller closed the channel.
    Closed,
    /// The channel gave up. The caller should fall back to polling.
    TransportFailed { events_received: u64, error: TrackerError },
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
    pub idle_timeout: Option<Duration>,
}

impl From<&ClientContext> for StreamOptions {
    fn from(ctx: &ClientContext) -> Self {
        Self {
            reconnect_delay: ctx.reconnect_delay(),
            max_reconnects: ctx.max_reconnects,
            idle_timeout: ctx.idle_timeout(),
        }
    }
}

pub struct StreamHandle {
    gate: Arc<DeliveryGate>,
    state: watch::Receiver<ReadyState>,
    exit: watch::Receiver<Option<StreamExit>>,
}

impl StreamHandle {
    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Idempotent. No handler runs once this returns.
    pub async fn close(&self) {
        self.gate.shut().await;
    }

    pub async fn finished(&self) -> StreamExit {
        let mut rx = self.exit.clone();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or(StreamExit::Closed);
            }
        }
    }
}

/// Server-push side of the scan API.
#[derive(Clone)]
pub struct StreamChannel {
    http: reqwest::Client,
    scan: ScanClient,
    options: StreamOptions,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

enum ConnectError {
    Transient(TrackerError),
    Fatal(TrackerError),
}

enum SessionEnd {
    Done,
    Cancelled,
    Failed(TrackerError),
}

impl StreamChannel {
    pub fn new(scan: ScanClient, diagnostics: Arc<dyn DiagnosticsSink>) -> Result<Self, TrackerError> {
        let ctx = scan.context();
        // no overall timeout: the connection is long-lived
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(ctx.timeout_secs.max(1)))
            .build()?;
        let options = StreamOptions::from(ctx);
        Ok(Self { http, scan, options, diagnostics })
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn open_stream(&self, task_id: &str, handlers: StreamHandlers) -> StreamHandle {
        let gate = Arc::new(DeliveryGate::new());
        let (state_tx, state_rx) = watch::channel(ReadyState::Connecting);
        let (exit_tx, exit_rx) = watch::channel(None);

        let channel = self.clone();
        let task_id = task_id.to_string();
        let gate2 = gate.clone();
        tokio::spawn(async move {
            let exit = channel.run(&task_id, handlers, &gate2, &state_tx).await;
            state_tx.send_replace(ReadyState::Closed);
            tracing::debug!(task_id = %task_id, ?exit, "stream finished");
            exit_tx.send_replace(Some(exit));
        });

        StreamHandle { gate, state: state_rx, exit: exit_rx }
    }

    async fn run(
        &self,
        task_id: &str,
        mut handlers: StreamHandlers,
        gate: &DeliveryGate,
        state: &watch::Sender<ReadyState>,
    ) -> StreamExit {
        let token = gate.token().clone();
        let mut parser = SseParser::new();
        let mut events_received = 0u64;
        let mut failures = 0u32;

        // a server that accepts but never answers must not pin us in Connecting
        let connect_limit = self
            .options
            .idle_timeout
            .unwrap_or_else(|| Duration::from_secs(self.scan.context().timeout_secs.max(1)));

        loop {
            state.send_replace(ReadyState::Connecting);
            let connected = tokio::select! {
                _ = token.cancelled() => return StreamExit::Closed,
                r = timeout(connect_limit, self.connect(task_id, parser.last_event_id())) => {
                    r.unwrap_or_else(|_| {
                        Err(ConnectError::Transient(TrackerError::Unreachable {
                            status: None,
                            message: format!("no response within {}s", connect_limit.as_secs_f64()),
                        }))
                    })
                }
            };

            let failure = match connected {
                Ok(resp) => {
                    state.send_replace(ReadyState::Open);
                    tracing::debug!(task_id, "stream open");
                    parser.reset();
                    let mut body = Box::pin(resp.bytes_stream());

                    let end = 'read: loop {
                        let next = tokio::select! {
                            _ = token.cancelled() => break 'read SessionEnd::Cancelled,
                            n = next_chunk(&mut body, self.options.idle_timeout) => n,
                        };
                        let chunk = match next {
                            Ok(Some(chunk)) => chunk,
                            Ok(None) => {
                                break 'read SessionEnd::Failed(TrackerError::Unreachable {
                                    status: None,
                                    message: "stream ended without done".to_string(),
                                })
                            }
                            Err(e) => break 'read SessionEnd::Failed(e),
                        };

                        for frame in parser.feed(&chunk) {
                            let ev = match StreamEvent::decode(&frame.event, &frame.data) {
                                Ok(ev) => ev,
                                Err(e) => {
                                    self.diagnostics.log_error("stream-event", &format!("task {}: {}", task_id, e));
                                    continue;
                                }
                            };
                            events_received += 1;
                            failures = 0;
                            tracing::trace!(task_id, event = ev.kind(), "stream event");
                            let done = matches!(ev, StreamEvent::Done(_));
                            if gate.deliver(|| handlers.dispatch(&ev)).await.is_none() {
                                break 'read SessionEnd::Cancelled;
                            }
                            if done {
                                break 'read SessionEnd::Done;
                            }
                        }
                    };

                    match end {
                        SessionEnd::Done => {
                            // done is the only success-path termination
                            state.send_replace(ReadyState::Closed);
                            return StreamExit::Done;
                        }
                        SessionEnd::Cancelled => return StreamExit::Closed,
                        SessionEnd::Failed(e) => {
                            // logged, but left to the server's own error/done events
                            self.diagnostics.log_error("stream", &format!("task {}: connection lost: {}", task_id, e));
                            e
                        }
                    }
                }
                Err(ConnectError::Fatal(e)) => {
                    return StreamExit::TransportFailed { events_received, error: e };
                }
                Err(ConnectError::Transient(e)) => {
                    tracing::debug!(task_id, error = %e, "stream connect failed");
                    e
                }
            };

            failures += 1;
            if failures > self.options.max_reconnects {
                return StreamExit::TransportFailed { events_received, error: failure };
            }

            let delay = parser.retry().unwrap_or(self.options.reconnect_delay);
            tokio::select! {
                _ = token.cancelled() => return StreamExit::Closed,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn connect(&self, task_id: &str, last_event_id: Option<&str>) -> Result<reqwest::Response, ConnectError> {
        let url = self.scan.stream_url(task_id).map_err(ConnectError::Fatal)?;
        let mut req = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(USER_AGENT, self.scan.context().user_agent.as_str());
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }

        let resp = req.send().await.map_err(|e| ConnectError::Transient(e.into()))?;
        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(resp);
        }
        let err = TrackerError::from_status(status, task_id, false).unwrap_or(TrackerError::Status(status.as_u16()));
        if is_retryable_status(status) {
            Err(ConnectError::Transient(err))
        } else {
            Err(ConnectError::Fatal(err))
        }
    }
}

async fn next_chunk<S>(body: &mut S, idle: Option<Duration>) -> Result<Option<Bytes>, TrackerError>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let item = match idle {
        Some(d) => timeout(d, body.next()).await.map_err(|_| TrackerError::Unreachable {
            status: None,
            message: format!("no data for {}s", d.as_secs_f64()),
        })?,
        None => body.next().await,
    };
    item.transpose().map_err(TrackerError::from)
}
