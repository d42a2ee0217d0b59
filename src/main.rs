use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use scan_tracker::core::aggregator::{display_order, module_error, ModuleError};
use scan_tracker::core::events::TrackerEvent;
use scan_tracker::core::model::{CreateScanRequest, ModuleStatus, TaskStatus, TaskView};
use scan_tracker::core::poller::fetch_results_when_ready;
use scan_tracker::core::tracker::Tracker;
use scan_tracker::logging;
use scan_tracker::transport::http::client::ScanClient;
use scan_tracker::transport::registry::{
    SessionProvider, StaticToken, TracingDiagnostics, TrackCliConfig, TransportRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn build_cli(registry: &TransportRegistry) -> Command {
    let create = Command::new("create")
        .about("Start a scan and follow it to the end")
        .arg(Arg::new("url").help("Site to scan").required(true))
        .arg(
            Arg::new("modules")
                .long("module")
                .short('m')
                .help("Module to run (repeatable, server default when omitted)")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(Arg::new("language").long("language").help("Report language").num_args(1))
        .arg(
            Arg::new("ai_mode")
                .long("ai-mode")
                .help("Ask for AI-assisted analysis")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no_track")
                .long("no-track")
                .help("Print the task id and exit")
                .action(ArgAction::SetTrue),
        );

    let track = Command::new("track")
        .about("Follow an existing scan until it finishes")
        .arg(Arg::new("task_id").help("Task id").required(true));

    let results = Command::new("results")
        .about("Print the results of a finished scan as JSON")
        .arg(Arg::new("task_id").help("Task id").required(true));

    let root = Command::new("scan-tracker")
        .about("Follow website scans over server push, falling back to polling")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .help("Default log filter when RUST_LOG is unset")
                .default_value("warn")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("log_json")
                .long("log-json")
                .help("Emit logs as JSON lines")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(create)
        .subcommand(track)
        .subcommand(results);

    registry.augment_command(root)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = TransportRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();
    let (name, m) = matches.subcommand().context("missing subcommand")?;

    let level = m.get_one::<String>("log_level").map(String::as_str).unwrap_or("warn");
    if m.get_flag("log_json") {
        logging::init_logging_json(level);
    } else {
        logging::init_logging(level);
    }

    let mut cfg = TrackCliConfig::default();
    registry.apply_matches(m, &mut cfg)?;
    let session: Arc<dyn SessionProvider> = Arc::new(StaticToken(cfg.token.clone()));
    let client = ScanClient::new(cfg.client_ctx.clone(), session).context("build scan client")?;

    match name {
        "create" => {
            let req = CreateScanRequest {
                url: m.get_one::<String>("url").cloned().context("missing url")?,
                options: m
                    .get_many::<String>("modules")
                    .map(|v| v.cloned().collect())
                    .unwrap_or_default(),
                language: m.get_one::<String>("language").cloned(),
                ai_mode: m.get_flag("ai_mode").then_some(true),
            };
            let created = client
                .create_scan(&req)
                .await
                .with_context(|| format!("create scan for {}", req.url))?;
            println!("Scan created: {} ({})", created.id, created.status);
            if m.get_flag("no_track") {
                return Ok(());
            }
            track(client, &created.id).await
        }
        "track" => track(client, task_id(m)?).await,
        "results" => {
            let id = task_id(m)?;
            let ctx = client.context().clone();
            let results = fetch_results_when_ready(&client, id, ctx.poll_interval(), ctx.results_attempts)
                .await
                .with_context(|| format!("fetch results for {id}"))?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn task_id(m: &ArgMatches) -> anyhow::Result<&str> {
    m.get_one::<String>("task_id").map(String::as_str).context("missing task id")
}

async fn track(client: ScanClient, task_id: &str) -> anyhow::Result<()> {
    let tracker = Tracker::from_client(client, Arc::new(TracingDiagnostics))?;
    let rx = tracker.subscribe();
    let session = tracker.track(task_id);
    let ui = tokio::spawn(render(rx));

    let outcome = session.wait().await;
    // last sender goes away with the tracker, which ends the ui loop
    drop(tracker);
    let board = ui.await.context("ui task")?;

    let view = outcome.with_context(|| format!("track scan {task_id}"))?;
    board.print_summary(&view);
    if view.status == TaskStatus::Failed {
        anyhow::bail!("scan {} failed: {}", view.id, view.error.as_deref().unwrap_or("no reason given"));
    }
    Ok(())
}

async fn render(mut rx: broadcast::Receiver<TrackerEvent>) -> Board {
    let mut board = Board::new();
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "progress display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let end = matches!(ev, TrackerEvent::Finished(_) | TrackerEvent::Failed { .. });
        board.apply(ev);
        if end {
            break;
        }
    }
    board
}

struct Board {
    mp: MultiProgress,
    overall: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    sty_bar: ProgressStyle,
    sty_spin: ProgressStyle,
    results: Option<usize>,
}

impl Board {
    fn new() -> Self {
        let mp = MultiProgress::new();
        let sty_spin = ProgressStyle::with_template("{spinner:.green} {prefix:<14} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("|/-\\ ");
        let sty_bar = ProgressStyle::with_template("  {prefix:<14} {bar:30.cyan/blue} {pos:>3}/{len:3} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let overall = mp.add(ProgressBar::new_spinner());
        overall.set_style(sty_spin.clone());
        overall.set_prefix("scan");
        overall.enable_steady_tick(Duration::from_millis(120));
        overall.set_message("connecting");

        Self { mp, overall, bars: HashMap::new(), sty_bar, sty_spin, results: None }
    }

    fn apply(&mut self, ev: TrackerEvent) {
        match ev {
            TrackerEvent::TransportSelected { transport, .. } => {
                self.overall.set_message(format!("waiting for updates ({transport:?})").to_lowercase());
            }
            TrackerEvent::Updated(view) => self.show(&view),
            TrackerEvent::ResultChunk { chunk, .. } => {
                if let Some(pb) = self.bars.get(&chunk.module) {
                    pb.set_message("partial results");
                }
            }
            TrackerEvent::ModuleError { module, category, raw, .. } => {
                let err = ModuleError { category, raw };
                let _ = self.mp.println(format!("[{}] {}", module, err.label()));
            }
            TrackerEvent::ServerError { message, .. } => {
                let _ = self.mp.println(format!("[server] {}", message));
            }
            TrackerEvent::Results(results) => self.results = Some(results.results.len()),
            TrackerEvent::Finished(view) => {
                self.show(&view);
                self.overall.finish_with_message(view.status.to_string());
            }
            TrackerEvent::Failed { message, .. } => self.overall.abandon_with_message(message),
        }
    }

    fn show(&mut self, view: &TaskView) {
        match view.progress.percent() {
            Some(p) => self.overall.set_message(format!("{} {}%", view.status, p)),
            None => self.overall.set_message(view.status.to_string()),
        }

        for (i, m) in display_order(view.modules.values()).into_iter().enumerate() {
            let pb = match self.bars.get(&m.name) {
                Some(pb) => pb.clone(),
                None => {
                    // +1 keeps the overall bar on top
                    let pb = self.mp.insert(i + 1, ProgressBar::new(0));
                    pb.set_style(self.sty_spin.clone());
                    pb.set_prefix(m.name.clone());
                    self.bars.insert(m.name.clone(), pb.clone());
                    pb
                }
            };
            if pb.is_finished() {
                continue;
            }
            self.show_module(&pb, m);
        }
    }

    fn show_module(&self, pb: &ProgressBar, m: &ModuleStatus) {
        if m.progress.is_applicable() {
            if pb.length() != Some(m.progress.total) {
                pb.set_style(self.sty_bar.clone());
                pb.set_length(m.progress.total);
            }
            pb.set_position(m.progress.current);
        } else if !m.status.is_terminal() {
            pb.enable_steady_tick(Duration::from_millis(120));
        }

        match (m.status, module_error(m)) {
            (TaskStatus::Failed, Some(err)) => pb.abandon_with_message(err.label().to_string()),
            (TaskStatus::Failed, None) => pb.abandon_with_message("failed"),
            (TaskStatus::Completed, _) => pb.finish_with_message("completed"),
            (status, _) => pb.set_message(status.to_string()),
        }
    }

    fn print_summary(&self, view: &TaskView) {
        println!();
        println!("Scan {}: {}", view.id, view.status);
        for m in display_order(view.modules.values()) {
            match module_error(m) {
                Some(err) => println!("  {:<14} {:<10} {}", m.name, m.status, err.label()),
                None => println!("  {:<14} {}", m.name, m.status),
            }
        }
        if let Some(err) = &view.error {
            println!("  error: {}", err);
        }
        match self.results {
            Some(n) => println!("Results: {} module(s); `scan-tracker results {}` prints them.", n, view.id),
            None => println!("Results not available yet."),
        }
    }
}
