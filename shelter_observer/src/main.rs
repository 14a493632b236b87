//! Shelter Observer - live terminal view of a running shelter simulation
//!
//! Polls the simulation service, merges each settled turn into per-day
//! history and replays the selected agent's decision at a human pace.
//! With the `dashboard` feature (default) the view is a ratatui TUI;
//! `--headless` (or a build without the feature) only logs transitions.

use anyhow::Result;
use clap::Parser;
use shelter_core::{
    LoadStatus, Observer, ObserverCommand, ObserverConfig, ObserverError, ObserverView, SledStateStore,
    StateStore,
};
use shelter_env::{HttpTransport, TokioContext};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type LiveObserver = Observer<TokioContext, HttpTransport>;

/// Log file used by the TUI when `--log-file` is not given.
const DEFAULT_LOG_FILE: &str = "shelter-observer.log";

/// Shelter simulation observer
#[derive(Parser, Debug)]
#[command(name = "shelter-observer")]
#[command(about = "Watch a running shelter simulation turn by turn", long_about = None)]
struct Args {
    /// Base URL of the simulation service API
    #[arg(long, env = "SHELTER_API_URL", default_value = "http://127.0.0.1:8000/api")]
    base_url: String,

    /// Live-state poll interval in milliseconds (overrides the saved preference)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Directory of the persisted observer state
    #[arg(long, default_value = ".shelter-observer")]
    storage: PathBuf,

    /// Show each decision's final state instead of replaying it
    #[arg(long = "static")]
    static_mode: bool,

    /// Start with auto-run enabled
    #[arg(long)]
    auto_run: bool,

    /// Log transitions instead of drawing the dashboard
    #[arg(long)]
    headless: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file (the dashboard always logs to a file)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> ObserverConfig {
        let mut config = ObserverConfig {
            base_url: self.base_url.clone(),
            storage_path: self.storage.clone(),
            ..Default::default()
        };
        if let Some(ms) = self.poll_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }

    fn uses_dashboard(&self) -> bool {
        cfg!(feature = "dashboard") && !self.headless
    }

    fn log_target(&self) -> Option<PathBuf> {
        self.log_file
            .clone()
            .or_else(|| self.uses_dashboard().then(|| PathBuf::from(DEFAULT_LOG_FILE)))
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    };
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_target().as_deref())?;

    let config = args.config();
    info!("Shelter observer v{}", env!("CARGO_PKG_VERSION"));
    info!("service: {} | state: {}", config.base_url, config.storage_path.display());

    let transport = Arc::new(HttpTransport::new(config.base_url.clone())?);
    let store: Arc<dyn StateStore> =
        Arc::new(SledStateStore::open(&config.storage_path).map_err(ObserverError::Store)?);

    let mut observer = Observer::new(TokioContext::shared(), transport, store, config.clone());
    if let Some(ms) = args.poll_ms {
        observer.set_poll_interval(Duration::from_millis(ms));
    }
    observer.set_static_mode(args.static_mode);
    if args.auto_run {
        observer.apply_local(&ObserverCommand::SetAutoRun(true));
    }

    let (commands, command_rx) = mpsc::unbounded_channel();

    #[cfg(feature = "dashboard")]
    {
        if args.uses_dashboard() {
            return run_dashboard(observer, commands, command_rx, config.overlay).await;
        }
    }

    run_headless(observer, commands, command_rx).await
}

#[cfg(feature = "dashboard")]
async fn run_dashboard(
    observer: LiveObserver,
    commands: UnboundedSender<ObserverCommand>,
    command_rx: UnboundedReceiver<ObserverCommand>,
    overlay: shelter_core::OverlayConfig,
) -> Result<()> {
    use shelter_core::dashboard::ObserverDashboard;

    let (view_tx, view_rx) = crossbeam::channel::unbounded::<ObserverView>();
    let ui = tokio::task::spawn_blocking(move || ObserverDashboard::new(view_rx, commands, overlay).run());

    observer
        .run(command_rx, move |view| {
            let _ = view_tx.send(view);
        })
        .await;

    ui.await??;
    info!("dashboard closed");
    Ok(())
}

async fn run_headless(
    observer: LiveObserver,
    commands: UnboundedSender<ObserverCommand>,
    command_rx: UnboundedReceiver<ObserverCommand>,
) -> Result<()> {
    let interrupt = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = interrupt.send(ObserverCommand::Shutdown);
        }
    });

    let mut log = TransitionLog::default();
    observer.run(command_rx, move |view| log.observe(&view)).await;
    drop(commands);
    Ok(())
}

/// Logs what changed between successive views.
#[derive(Debug, Default)]
struct TransitionLog {
    load_status: LoadStatus,
    day: u32,
    glowing: BTreeSet<String>,
    game_over: Option<String>,
    lines: usize,
}

impl TransitionLog {
    fn observe(&mut self, view: &ObserverView) {
        if view.load_status != self.load_status {
            match &view.load_status {
                LoadStatus::Ready => info!("connected; {} agents", view.agents.len()),
                LoadStatus::Failed(reason) => warn!("initial load failed: {}", reason),
                LoadStatus::Loading => info!("loading"),
            }
            self.load_status = view.load_status.clone();
            self.lines += 1;
        }
        if view.system_state.day != self.day {
            self.day = view.system_state.day;
            info!(
                "day {}: {:.0} resources left ({:.1}%), efficiency {}%",
                self.day,
                view.system_state.remaining_resources,
                view.system_state.remaining_percentage(),
                view.system_state.system_efficiency
            );
            self.lines += 1;
        }
        if !view.glowing.is_empty() && view.glowing != self.glowing {
            let names: Vec<&str> = view.glowing.iter().map(String::as_str).collect();
            info!("turn settled for {}", names.join(", "));
            self.lines += 1;
        }
        self.glowing = view.glowing.clone();
        if view.game_over.is_some() && view.game_over != self.game_over {
            warn!("game over: {}", view.game_over.as_deref().unwrap_or_default());
            self.lines += 1;
        }
        self.game_over = view.game_over.clone();
    }
}
