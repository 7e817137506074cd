mod collectors;
mod condition;
mod config;
mod cooldown;
mod dashboard;
mod dispatch;
mod engine;
mod history;
mod http;
mod metrics;
mod openclaw;
mod poller;
mod rules;
mod state;
mod telegram;
mod timefmt;

use axum::serve;
use clap::{Parser, Subcommand};
use collectors::SystemSnapshotProvider;
use config::{Config, ConfigError, Transport};
use cooldown::CooldownTracker;
use dispatch::{ChannelSender, TransportSender};
use history::HistoryStore;
use metrics::Metrics;
use openclaw::OpenclawCli;
use poller::{PollOutcome, Poller};
use rules::{Alert, Severity};
use state::{State, StateSnapshot};
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use telegram::TelegramSender;
use thiserror::Error;
use timefmt::now_millis;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "observd")]
#[command(version, about = "Agent and scheduled job monitor with rule-based alerting")]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Poll continuously and serve the HTTP API
    Run,
    /// Run one pass and print the dashboard
    Check,
    /// Print the dashboard from persisted state
    Status,
    /// Send a test alert through a configured channel
    AlertTest {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Print configuration warnings
    Lint,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialise metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("invalid listen address {listen}: {source}")]
    Listen {
        listen: String,
        #[source]
        source: AddrParseError,
    },
    #[error("http server: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel {0} is not configured or disabled")]
    UnknownChannel(String),
    #[error("test alert was not delivered to {0}")]
    Delivery(String),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Status) {
        Command::Run => run(cfg).await,
        Command::Check => check(cfg).await,
        Command::Status => status(cfg).await,
        Command::AlertTest { channel, message } => alert_test(&cfg, &channel, message).await,
        Command::Lint => {
            lint(&cfg);
            Ok(())
        }
    };
    if let Err(err) = result {
        error!(error = %err, "observd failed");
        std::process::exit(1);
    }
}

/// A missing file falls back to the built-in example configuration.
fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using built-in defaults");
        return Config::from_yaml(Config::example_yaml(), "built-in defaults");
    }
    Config::load_from_file(path)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct Daemon {
    cfg: Config,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<State>>,
    poller: Arc<Poller>,
}

/// Wires the poller to the openclaw collectors and transports, restoring
/// cooldowns and alerts from the state file.
fn build_daemon(cfg: Config) -> Result<Daemon, StartupError> {
    for warning in cfg.lint() {
        warn!(warning = %warning, "configuration warning");
    }

    let metrics = Metrics::new()?;
    let history = HistoryStore::new(&cfg.state_file, cfg.retention());
    let restored = history.load_or_default();

    let mut state = State::new(now_millis());
    state.snapshot = restored.snapshot;
    state.cooldowns = restored.cooldowns.clone();
    state.push_alerts(restored.alerts);
    let state = Arc::new(RwLock::new(state));

    let cli = OpenclawCli::new(&cfg.openclaw);
    let sender = Arc::new(TransportSender::new(cli.clone(), telegram_sender(&cfg)));
    let provider = Arc::new(SystemSnapshotProvider::new(cli).with_metrics(metrics.clone()));
    let poller = Poller::new(provider, sender, state.clone())
        .with_rules(cfg.rules.clone(), cfg.channel_map())
        .with_metrics(metrics.clone())
        .with_cooldowns(CooldownTracker::from_entries(restored.cooldowns))
        .with_history(history);

    Ok(Daemon {
        cfg,
        metrics,
        state,
        poller: Arc::new(poller),
    })
}

fn telegram_sender(cfg: &Config) -> Option<TelegramSender> {
    let needed = cfg
        .channels
        .values()
        .any(|ch| ch.enabled && ch.transport == Transport::Telegram);
    if !needed {
        return None;
    }
    match TelegramSender::from_config(&cfg.telegram) {
        Ok(sender) => Some(sender),
        Err(err) => {
            warn!(error = %err, "telegram channels configured but no bot token, they will fail");
            None
        }
    }
}

async fn run(cfg: Config) -> Result<(), StartupError> {
    let daemon = build_daemon(cfg)?;
    let addr: SocketAddr = daemon
        .cfg
        .listen
        .parse()
        .map_err(|source| StartupError::Listen {
            listen: daemon.cfg.listen.clone(),
            source,
        })?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        listen = %addr,
        poll_interval_secs = daemon.cfg.poll_interval_secs,
        rules = daemon.cfg.rules.len(),
        "starting observd"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app = http::build_router(
            daemon.metrics.clone(),
            daemon.state.clone(),
            daemon.poller.clone(),
        );
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        })
    };

    let poll_task = {
        let poller = daemon.poller.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(daemon.cfg.poll_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("stopping poll loop");
                        break;
                    }
                    _ = ticker.tick() => {
                        poller.poll_once(now_millis()).await;
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = poll_task.await;
    let _ = http_task.await;
    Ok(())
}

async fn check(cfg: Config) -> Result<(), StartupError> {
    let daemon = build_daemon(cfg)?;
    let now = now_millis();
    if let PollOutcome::Completed { alerts, .. } = daemon.poller.poll_once(now).await {
        print_dashboard(&daemon, now).await;
        println!("\n{} alert(s) triggered", alerts.len());
    }
    Ok(())
}

async fn status(cfg: Config) -> Result<(), StartupError> {
    let daemon = build_daemon(cfg)?;
    let now = now_millis();
    if daemon.state.read().await.snapshot.is_none() {
        info!("no persisted snapshot, polling once");
        daemon.poller.poll_once(now).await;
    }
    print_dashboard(&daemon, now).await;
    Ok(())
}

async fn print_dashboard(daemon: &Daemon, now_ms: i64) {
    let state = daemon.state.read().await;
    let snapshot = state
        .snapshot
        .clone()
        .unwrap_or_else(|| StateSnapshot::empty(now_ms));
    let active = dashboard::active_alerts(&state.cooldowns, &daemon.cfg.rules, now_ms);
    println!("{}", dashboard::render(&snapshot, &active, now_ms));
}

async fn alert_test(cfg: &Config, channel_id: &str, message: Option<String>) -> Result<(), StartupError> {
    let channels = cfg.channel_map();
    let channel = channels
        .get(channel_id)
        .ok_or_else(|| StartupError::UnknownChannel(channel_id.to_string()))?;

    let now = now_millis();
    let alert = Alert {
        id: format!("alert_{now}_test"),
        rule_id: "test".to_string(),
        triggered_at: now,
        message: message.unwrap_or_else(|| "Test alert from observd".to_string()),
        severity: Severity::Info,
        resolved: false,
    };
    let sender = TransportSender::new(OpenclawCli::new(&cfg.openclaw), telegram_sender(cfg));
    if sender.send(&alert, channel).await {
        println!("test alert sent to {channel_id}");
        Ok(())
    } else {
        Err(StartupError::Delivery(channel_id.to_string()))
    }
}

fn lint(cfg: &Config) {
    let warnings = cfg.lint();
    if warnings.is_empty() {
        println!("configuration OK ({} rules)", cfg.rules.len());
        return;
    }
    for warning in &warnings {
        println!("warning: {warning}");
    }
}
