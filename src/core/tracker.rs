use crate::core::aggregator::{apply_snapshot, apply_status_update, merge_module_update, module_error};
use crate::core::error::TrackerError;
use crate::core::events::{StreamEvent, TrackerEvent, Transport};
use crate::core::gate::DeliveryGate;
use crate::core::model::{Progress, TaskId, TaskStatus, TaskView};
use crate::core::poller::{fetch_results_when_ready, PollOutcome, Poller};
use crate::core::retry::RetryOptions;
use crate::transport::http::client::ScanClient;
use crate::transport::registry::{ClientContext, DiagnosticsSink, SnapshotSource};
use crate::transport::stream::channel::{StreamChannel, StreamExit, StreamHandlers};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TrackOptions {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub retry: RetryOptions,
    pub results_attempts: u32,
}

impl From<&ClientContext> for TrackOptions {
    fn from(ctx: &ClientContext) -> Self {
        Self {
            poll_interval: ctx.poll_interval(),
            max_poll_interval: ctx.max_poll_interval(),
            retry: ctx.retry_options(),
            results_attempts: ctx.results_attempts,
        }
    }
}

/// What has to stay the same for a snapshot to count as "no progress".
#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    status: TaskStatus,
    progress: Progress,
    modules: Vec<(String, TaskStatus, Progress)>,
}

impl Fingerprint {
    fn of(view: &TaskView) -> Self {
        Self {
            status: view.status,
            progress: view.progress,
            modules: view.modules.values().map(|m| (m.name.clone(), m.status, m.progress)).collect(),
        }
    }
}

/// Polling cadence: stretches 1.5x per unchanged snapshot, snaps back to the
/// base interval as soon as the task or any module moves.
#[derive(Debug, Clone)]
pub struct Cadence {
    base: Duration,
    max: Duration,
    current: Duration,
    last: Option<Fingerprint>,
}

impl Cadence {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), current: base, last: None }
    }

    pub fn next(&mut self, view: &TaskView) -> Duration {
        let seen = Fingerprint::of(view);
        self.current = match &self.last {
            Some(prev) if *prev == seen => self.current.mul_f64(1.5).min(self.max),
            _ => self.base,
        };
        self.last = Some(seen);
        self.current
    }
}

/// Owns tracking sessions and fans their events out to subscribers.
#[derive(Clone)]
pub struct Tracker {
    source: Arc<dyn SnapshotSource>,
    stream: Option<StreamChannel>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    options: TrackOptions,
    event_tx: broadcast::Sender<TrackerEvent>,
}

impl Tracker {
    /// Polling only. Add a push channel with [`Tracker::with_stream`].
    pub fn new(source: Arc<dyn SnapshotSource>, diagnostics: Arc<dyn DiagnosticsSink>, options: TrackOptions) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { source, stream: None, diagnostics, options, event_tx }
    }

    pub fn with_stream(mut self, stream: StreamChannel) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Wires both transports to one HTTP client; streaming only when the
    /// context prefers it.
    pub fn from_client(scan: ScanClient, diagnostics: Arc<dyn DiagnosticsSink>) -> Result<Self, TrackerError> {
        let ctx = scan.context().clone();
        let tracker = Self::new(Arc::new(scan.clone()), diagnostics.clone(), TrackOptions::from(&ctx));
        if ctx.prefer_stream {
            Ok(tracker.with_stream(StreamChannel::new(scan, diagnostics)?))
        } else {
            Ok(tracker)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.event_tx.subscribe()
    }

    pub fn track(&self, task_id: impl Into<TaskId>) -> TrackingSession {
        let task_id = task_id.into();
        let session_id = Uuid::new_v4();
        let gate = Arc::new(DeliveryGate::new());
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let session = Session {
            tracker: self.clone(),
            task_id: task_id.clone(),
            gate: gate.clone(),
            view: TaskView::new(task_id.clone(), TaskStatus::Pending),
            results_seen: false,
        };
        let span = tracing::info_span!("track", task_id = %task_id, session = %session_id);
        tokio::spawn(
            async move {
                let outcome = session.drive().await;
                outcome_tx.send_replace(Some(outcome));
            }
            .instrument(span),
        );

        TrackingSession { task_id, session_id, gate, outcome: outcome_rx }
    }
}

pub struct TrackingSession {
    task_id: TaskId,
    session_id: Uuid,
    gate: Arc<DeliveryGate>,
    outcome: watch::Receiver<Option<Result<TaskView, TrackerError>>>,
}

impl TrackingSession {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Idempotent. Nothing more is published for this session once it returns.
    pub async fn cancel(&self) {
        self.gate.shut().await;
    }

    /// Final view, or the one error the session surfaced.
    pub async fn wait(&self) -> Result<TaskView, TrackerError> {
        let mut rx = self.outcome.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or(Err(TrackerError::Cancelled));
            }
        }
    }
}

enum PollMsg {
    Snapshot(TaskView),
    Fatal(TrackerError),
}

struct Session {
    tracker: Tracker,
    task_id: TaskId,
    gate: Arc<DeliveryGate>,
    view: TaskView,
    results_seen: bool,
}

impl Session {
    async fn drive(mut self) -> Result<TaskView, TrackerError> {
        match self.run().await {
            Err(TrackerError::Cancelled) => {
                tracing::debug!(task_id = %self.task_id, "tracking cancelled");
                Err(TrackerError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "tracking failed");
                let _ = self
                    .publish(TrackerEvent::Failed { task_id: self.task_id.clone(), message: e.to_string() })
                    .await;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn run(&mut self) -> Result<TaskView, TrackerError> {
        let streamed = match self.tracker.stream.clone() {
            Some(stream) => self.stream_phase(&stream).await?,
            None => false,
        };
        if !streamed {
            self.poll_phase().await?;
        }
        self.finish().await
    }

    async fn publish(&self, ev: TrackerEvent) -> Result<(), TrackerError> {
        let tx = &self.tracker.event_tx;
        self.gate
            .deliver(|| {
                let _ = tx.send(ev);
            })
            .await
            .ok_or(TrackerError::Cancelled)
    }

    /// `Ok(true)` when the stream carried the task to `done`, `Ok(false)` when
    /// it gave up and polling should take over.
    async fn stream_phase(&mut self, stream: &StreamChannel) -> Result<bool, TrackerError> {
        self.publish(TrackerEvent::TransportSelected { task_id: self.task_id.clone(), transport: Transport::Stream })
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = stream.open_stream(&self.task_id, forwarding_handlers(tx));
        let token = self.gate.token().clone();

        loop {
            let ev = tokio::select! {
                _ = token.cancelled() => {
                    handle.close().await;
                    return Err(TrackerError::Cancelled);
                }
                ev = rx.recv() => ev,
            };
            // handlers are dropped when the channel exits
            let Some(ev) = ev else { break };
            if let Err(e) = self.on_stream_event(ev).await {
                handle.close().await;
                return Err(e);
            }
        }

        match handle.finished().await {
            StreamExit::Done => Ok(true),
            StreamExit::Closed => Err(TrackerError::Cancelled),
            StreamExit::TransportFailed { events_received, error } => {
                tracing::warn!(task_id = %self.task_id, events_received, error = %error, "stream unusable, falling back to polling");
                Ok(false)
            }
        }
    }

    async fn on_stream_event(&mut self, ev: StreamEvent) -> Result<(), TrackerError> {
        match ev {
            StreamEvent::Status(update) => {
                self.view = apply_status_update(std::mem::take(&mut self.view), &update);
                self.publish(TrackerEvent::Updated(self.view.clone())).await
            }
            StreamEvent::ModuleStatus(module) => {
                let name = module.name.clone();
                let previous = self.view.modules.get(&name).and_then(|m| m.error.clone());
                let err = module_error(&module).filter(|e| previous.as_deref() != Some(e.raw.as_str()));
                self.view = merge_module_update(std::mem::take(&mut self.view), &name, module);
                if let Some(err) = err {
                    self.publish(TrackerEvent::ModuleError {
                        task_id: self.task_id.clone(),
                        module: name,
                        category: err.category,
                        raw: err.raw,
                    })
                    .await?;
                }
                self.publish(TrackerEvent::Updated(self.view.clone())).await
            }
            StreamEvent::Result(chunk) => {
                self.publish(TrackerEvent::ResultChunk { task_id: self.task_id.clone(), chunk }).await
            }
            StreamEvent::FullResults(results) => {
                self.results_seen = true;
                self.publish(TrackerEvent::Results(results)).await
            }
            StreamEvent::Done(done) => {
                self.view.status = match done.status {
                    Some(s) => s,
                    None if self.view.status.is_terminal() => self.view.status,
                    None if done.error.is_some() => TaskStatus::Failed,
                    None => TaskStatus::Completed,
                };
                if done.error.is_some() {
                    self.view.error = done.error;
                }
                self.publish(TrackerEvent::Updated(self.view.clone())).await
            }
            StreamEvent::Error(e) => {
                self.publish(TrackerEvent::ServerError { task_id: self.task_id.clone(), message: e.message }).await
            }
        }
    }

    async fn poll_phase(&mut self) -> Result<(), TrackerError> {
        if self.view.status.is_terminal() {
            return Ok(());
        }
        self.publish(TrackerEvent::TransportSelected { task_id: self.task_id.clone(), transport: Transport::Poll })
            .await?;

        let opts = self.tracker.options.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fatal_tx = tx.clone();
        let mut cadence = Cadence::new(opts.poll_interval, opts.max_poll_interval);

        let handle = Poller::new(self.tracker.source.clone(), self.tracker.diagnostics.clone())
            .with_retry(opts.retry)
            .on_error(move |e| match e {
                TrackerError::Forbidden(_) | TrackerError::NotFound(_) => {
                    let _ = fatal_tx.send(PollMsg::Fatal(e.clone()));
                    PollOutcome::Stop
                }
                _ => PollOutcome::keep(),
            })
            .start_polling(self.task_id.clone(), opts.poll_interval, move |view| {
                let next = cadence.next(view);
                let _ = tx.send(PollMsg::Snapshot(view.clone()));
                PollOutcome::Continue(Some(next))
            });
        let token = self.gate.token().clone();

        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    handle.stop().await;
                    return Err(TrackerError::Cancelled);
                }
                msg = rx.recv() => msg,
            };
            match msg {
                Some(PollMsg::Snapshot(snapshot)) => {
                    if let Err(e) = self.on_snapshot(snapshot).await {
                        handle.stop().await;
                        return Err(e);
                    }
                }
                Some(PollMsg::Fatal(e)) => {
                    handle.stop().await;
                    return Err(e);
                }
                None if self.view.status.is_terminal() => return Ok(()),
                None => return Err(TrackerError::Protocol("polling ended before a terminal status".to_string())),
            }
        }
    }

    async fn on_snapshot(&mut self, mut snapshot: TaskView) -> Result<(), TrackerError> {
        if snapshot.id.is_empty() {
            snapshot.id = self.task_id.clone();
        }
        let before: BTreeMap<String, Option<String>> =
            self.view.modules.iter().map(|(k, m)| (k.clone(), m.error.clone())).collect();
        self.view = apply_snapshot(std::mem::take(&mut self.view), snapshot);

        let fresh: Vec<_> = self
            .view
            .modules
            .iter()
            .filter(|(name, m)| before.get(*name).map_or(true, |prev| *prev != m.error))
            .filter_map(|(name, m)| module_error(m).map(|err| (name.clone(), err)))
            .collect();
        for (module, err) in fresh {
            self.publish(TrackerEvent::ModuleError {
                task_id: self.task_id.clone(),
                module,
                category: err.category,
                raw: err.raw,
            })
            .await?;
        }
        self.publish(TrackerEvent::Updated(self.view.clone())).await
    }

    async fn finish(&mut self) -> Result<TaskView, TrackerError> {
        if !self.results_seen {
            let opts = &self.tracker.options;
            let token = self.gate.token().clone();
            let fetched = tokio::select! {
                _ = token.cancelled() => return Err(TrackerError::Cancelled),
                r = fetch_results_when_ready(&*self.tracker.source, &self.task_id, opts.poll_interval, opts.results_attempts) => r,
            };
            match fetched {
                Ok(results) => {
                    self.results_seen = true;
                    self.publish(TrackerEvent::Results(results)).await?;
                }
                Err(e) => self.tracker.diagnostics.log_error("results", &format!("task {}: {}", self.task_id, e)),
            }
        }

        self.publish(TrackerEvent::Finished(self.view.clone())).await?;
        tracing::info!(task_id = %self.task_id, status = %self.view.status, "tracking finished");
        Ok(self.view.clone())
    }
}

fn forwarding_handlers(tx: mpsc::UnboundedSender<StreamEvent>) -> StreamHandlers {
    let (t1, t2, t3, t4, t5, t6) = (tx.clone(), tx.clone(), tx.clone(), tx.clone(), tx.clone(), tx);
    StreamHandlers::new()
        .on_status(move |v| {
            let _ = t1.send(StreamEvent::Status(v.clone()));
        })
        .on_module_status(move |v| {
            let _ = t2.send(StreamEvent::ModuleStatus(v.clone()));
        })
        .on_result(move |v| {
            let _ = t3.send(StreamEvent::Result(v.clone()));
        })
        .on_results(move |v| {
            let _ = t4.send(StreamEvent::FullResults(v.clone()));
        })
        .on_done(move |v| {
            let _ = t5.send(StreamEvent::Done(v.clone()));
        })
        .on_error(move |v| {
            let _ = t6.send(StreamEvent::Error(v.clone()));
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FullResults, ModuleStatus};
    use crate::core::poller::tests::{view, ScriptedSource};
    use crate::transport::registry::{SessionProvider, StaticToken, TracingDiagnostics};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::{sleep, Instant};

    fn options(base_ms: u64, max_ms: u64) -> TrackOptions {
        TrackOptions {
            poll_interval: Duration::from_millis(base_ms),
            max_poll_interval: Duration::from_millis(max_ms),
            retry: RetryOptions::new(0, Duration::from_millis(10)),
            results_attempts: 2,
        }
    }

    fn tracker(source: &Arc<ScriptedSource>, opts: TrackOptions) -> Tracker {
        Tracker::new(source.clone(), Arc::new(TracingDiagnostics), opts)
    }

    fn results() -> FullResults {
        FullResults {
            task_id: "abc".into(),
            status: Some(TaskStatus::Completed),
            results: [("seo".to_string(), json!({"score": 80}))].into_iter().collect(),
            completed_at: None,
        }
    }

    fn with_module(mut v: TaskView, name: &str, status: TaskStatus, error: Option<&str>) -> TaskView {
        let mut m = ModuleStatus::new(name, status);
        m.error = error.map(str::to_string);
        v.modules.insert(name.to_string(), m);
        v
    }

    fn label(ev: &TrackerEvent) -> String {
        match ev {
            TrackerEvent::TransportSelected { transport, .. } => format!("transport:{transport:?}"),
            TrackerEvent::Updated(v) => format!("updated:{}", v.status),
            TrackerEvent::ResultChunk { chunk, .. } => format!("chunk:{}", chunk.module),
            TrackerEvent::ModuleError { module, category, .. } => format!("module-error:{module}:{category:?}"),
            TrackerEvent::ServerError { message, .. } => format!("server-error:{message}"),
            TrackerEvent::Results(_) => "results".to_string(),
            TrackerEvent::Finished(v) => format!("finished:{}", v.status),
            TrackerEvent::Failed { message, .. } => format!("failed:{message}"),
        }
    }

    async fn collect(rx: &mut broadcast::Receiver<TrackerEvent>) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            let ev = rx.recv().await.unwrap();
            let end = matches!(ev, TrackerEvent::Finished(_) | TrackerEvent::Failed { .. });
            out.push(label(&ev));
            if end {
                return out;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_to_completion_and_fetches_results() {
        let source = Arc::new(
            ScriptedSource::new(vec![
                Ok(with_module(view(TaskStatus::Running, 2, 10), "seo", TaskStatus::Running, None)),
                Ok(with_module(view(TaskStatus::Completed, 10, 10), "ssl", TaskStatus::Failed, Some("Insufficient credits"))),
            ])
            .with_results(vec![Ok(results())]),
        );
        let t = tracker(&source, options(1000, 5000));
        let mut rx = t.subscribe();
        let session = t.track("abc");

        assert_eq!(
            collect(&mut rx).await,
            vec![
                "transport:Poll",
                "updated:running",
                "module-error:ssl:AccessDenied",
                "updated:completed",
                "results",
                "finished:completed",
            ]
        );
        let done = session.wait().await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, Progress::new(10, 10));
        assert_eq!(done.modules.keys().collect::<Vec<_>>(), vec!["seo", "ssl"]);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cadence_stretches_while_progress_is_static() {
        let source = Arc::new(
            ScriptedSource::new(vec![
                Ok(view(TaskStatus::Running, 1, 10)),
                Ok(view(TaskStatus::Running, 1, 10)),
                Ok(view(TaskStatus::Running, 1, 10)),
                Ok(view(TaskStatus::Running, 2, 10)),
                Ok(view(TaskStatus::Completed, 10, 10)),
            ])
            .with_results(vec![Ok(results())]),
        );
        let start = Instant::now();
        let session = tracker(&source, options(1000, 2000)).track("abc");
        session.wait().await.unwrap();

        let offsets: Vec<u128> = source.fetch_times.lock().unwrap().iter().map(|t| (*t - start).as_millis()).collect();
        assert_eq!(offsets, vec![0, 1000, 2500, 4500, 5500]);
    }

    #[test]
    fn cadence_resets_on_change() {
        let mut c = Cadence::new(Duration::from_secs(2), Duration::from_secs(5));
        let a = view(TaskStatus::Running, 1, 4);
        assert_eq!(c.next(&a), Duration::from_secs(2));
        assert_eq!(c.next(&a), Duration::from_secs(3));
        assert_eq!(c.next(&a), Duration::from_millis(4500));
        assert_eq!(c.next(&a), Duration::from_secs(5));
        assert_eq!(c.next(&view(TaskStatus::Running, 2, 4)), Duration::from_secs(2));
    }

    #[test]
    fn cadence_resets_when_only_a_module_moves() {
        let mut c = Cadence::new(Duration::from_secs(2), Duration::from_secs(10));
        let mut seo = ModuleStatus::new("seo", TaskStatus::Running);
        seo.progress = Progress::new(1, 5);
        let mut a = view(TaskStatus::Running, 1, 4);
        a.modules.insert("seo".into(), seo.clone());
        assert_eq!(c.next(&a), Duration::from_secs(2));
        assert_eq!(c.next(&a), Duration::from_secs(3));

        seo.progress = Progress::new(3, 5);
        a.modules.insert("seo".into(), seo);
        assert_eq!(c.next(&a), Duration::from_secs(2));

        let a = with_module(a, "ssl", TaskStatus::Pending, None);
        assert_eq!(c.next(&a), Duration::from_secs(2));
        assert_eq!(c.next(&a), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_ends_the_session_once() {
        let source = Arc::new(ScriptedSource::new(vec![Err(TrackerError::Forbidden("abc".into()))]));
        let t = tracker(&source, options(1000, 5000));
        let mut rx = t.subscribe();
        let session = t.track("abc");

        assert_eq!(session.wait().await, Err(TrackerError::Forbidden("abc".into())));
        assert_eq!(collect(&mut rx).await, vec!["transport:Poll", "failed:access to task abc is forbidden"]);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(source.fetches(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_end_the_session() {
        let source = Arc::new(
            ScriptedSource::new(vec![
                Err(TrackerError::Unreachable { status: Some(502), message: "Bad Gateway".into() }),
                Ok(view(TaskStatus::Completed, 1, 1)),
            ])
            .with_results(vec![Ok(results())]),
        );
        let session = tracker(&source, options(1000, 5000)).track("abc");
        assert_eq!(session.wait().await.unwrap().status, TaskStatus::Completed);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_silences_the_session() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(view(TaskStatus::Running, 1, 10))]));
        let t = tracker(&source, options(1000, 5000));
        let mut rx = t.subscribe();
        let session = t.track("abc");

        sleep(Duration::from_millis(3500)).await;
        session.cancel().await;
        session.cancel().await;
        while rx.try_recv().is_ok() {}
        sleep(Duration::from_secs(60)).await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(session.wait().await, Err(TrackerError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn results_not_ready_is_not_a_failure() {
        let source = Arc::new(
            ScriptedSource::new(vec![Ok(view(TaskStatus::Completed, 3, 3))])
                .with_results(vec![Err(TrackerError::NotReady("abc".into()))]),
        );
        let t = tracker(&source, options(1000, 5000));
        let mut rx = t.subscribe();
        let session = t.track("abc");

        assert_eq!(collect(&mut rx).await, vec!["transport:Poll", "updated:completed", "finished:completed"]);
        assert_eq!(session.wait().await.unwrap().status, TaskStatus::Completed);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http_tracker(base: &str) -> Tracker {
        let ctx = ClientContext {
            base_url: base.to_string(),
            poll_interval_ms: 20,
            retries: 0,
            max_reconnects: 0,
            reconnect_delay_ms: 10,
            ..Default::default()
        };
        let session: Arc<dyn SessionProvider> = Arc::new(StaticToken::anonymous());
        Tracker::from_client(ScanClient::new(ctx, session).unwrap(), Arc::new(TracingDiagnostics)).unwrap()
    }

    fn results_route() -> axum::routing::MethodRouter {
        get(|| async { Json(json!({"id": "abc", "status": "completed", "results": {"seo": {"score": 80}}})) })
    }

    #[tokio::test]
    async fn falls_back_to_polling_when_stream_fails() {
        let app = Router::new()
            .route("/api/scans/{id}/stream", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route(
                "/api/scans/{id}",
                get(|| async { Json(json!({"id": "abc", "status": "completed", "progress": {"current": 5, "total": 5}})) }),
            )
            .route("/api/scans/{id}/results", results_route());
        let t = http_tracker(&serve(app).await);
        let mut rx = t.subscribe();
        let session = t.track("abc");

        assert_eq!(
            collect(&mut rx).await,
            vec!["transport:Stream", "transport:Poll", "updated:completed", "results", "finished:completed"]
        );
        assert_eq!(session.wait().await.unwrap().progress, Progress::new(5, 5));
    }

    #[tokio::test]
    async fn stream_carries_the_task_to_done() {
        let app = Router::new()
            .route(
                "/api/scans/{id}/stream",
                get(|| async {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                        "event: status\ndata: {\"status\":\"running\",\"progress\":{\"current\":1,\"total\":2}}\n\n\
                         event: module-status\ndata: {\"name\":\"ssl\",\"status\":\"failed\",\"error\":\"Login required\"}\n\n\
                         event: katana-result\ndata: {\"data\":{\"url\":\"https://example.com\"}}\n\n\
                         event: done\ndata: {\"status\":\"completed\"}\n\n",
                    )
                }),
            )
            .route("/api/scans/{id}/results", results_route());
        let t = http_tracker(&serve(app).await);
        let mut rx = t.subscribe();
        let session = t.track("abc");

        assert_eq!(
            collect(&mut rx).await,
            vec![
                "transport:Stream",
                "updated:running",
                "module-error:ssl:AccessDenied",
                "updated:running",
                "chunk:katana",
                "updated:completed",
                "results",
                "finished:completed",
            ]
        );
        let done = session.wait().await.unwrap();
        assert_eq!(done.modules["ssl"].status, TaskStatus::Failed);
        assert_eq!(done.progress, Progress::new(1, 2));
    }
}
