//! # deskwire
//!
//! Runs the dashboard's real-time client against a helpdesk server and logs
//! connection lifecycle, dashboard updates, and degradations until Ctrl+C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use deskwire_client::{
    ConnectionConfig, ConnectionManager, ConversationBoard, FeatureFlagStore, FlagChange,
    MonitorConfig, ReloadSignal, UpdateDispatcher, UpdateMonitor, WsChannel,
};
use deskwire_core::{ClientEvent, EventKind};
use deskwire_settings::{DeskwireSettings, INCREMENTAL_UPDATES};
use deskwire_telemetry::{init_telemetry, TelemetryConfig};

/// Helpdesk dashboard real-time client.
#[derive(Parser, Debug)]
#[command(name = "deskwire", about = "Helpdesk dashboard real-time client")]
struct Cli {
    /// Settings file (defaults to ~/.deskwire/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Agent id announced to the server (overrides settings).
    #[arg(long)]
    agent_id: Option<String>,

    /// Start with incremental dashboard updates enabled.
    #[arg(long)]
    incremental: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<DeskwireSettings> {
        let mut settings = match &self.config {
            Some(path) => deskwire_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => deskwire_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(url) = &self.url {
            settings.connection.url = url.clone();
        }
        if let Some(agent_id) = &self.agent_id {
            settings.connection.agent_id = Some(agent_id.clone());
        }
        if self.incremental {
            settings.features.set(INCREMENTAL_UPDATES, true);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        deskwire_settings::validate(&settings)?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let log_level = settings.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        json: settings.logging.json,
        ..Default::default()
    });
    let metrics = telemetry.metrics();

    let config = ConnectionConfig::from(&settings.connection);
    info!(url = %config.url, agent_id = %config.agent_id, "starting deskwire");

    let channel = Arc::new(WsChannel::new());
    let manager = match &metrics {
        Some(recorder) => ConnectionManager::with_metrics(config, channel, Arc::clone(recorder)),
        None => ConnectionManager::new(config, channel),
    };

    let flags = Arc::new(FeatureFlagStore::from_settings(&settings.features));
    let mut monitor = UpdateMonitor::new(MonitorConfig::from(&settings.monitor), Arc::clone(&flags));
    if let Some(recorder) = &metrics {
        monitor = monitor.with_recorder(Arc::clone(recorder));
    }
    let monitor = Arc::new(monitor);

    let board = Arc::new(ConversationBoard::new());
    if flags.is_enabled(INCREMENTAL_UPDATES) {
        warn!(
            "no conversation list source in this binary; incremental updates will fall back \
             to reloads and the flag will degrade once the error rate is reached"
        );
    }
    let reload = Arc::new(ReloadSignal::new());
    let dispatcher = Arc::new(
        UpdateDispatcher::new(Arc::clone(&flags), Arc::clone(&monitor), reload.clone())
            .with_renderer(board.clone()),
    );
    dispatcher.attach(&manager);

    subscribe_lifecycle_logging(&manager);
    let reload_task = tokio::spawn(watch_reloads(
        reload.subscribe(),
        Arc::clone(&reload),
        Arc::clone(&board),
    ));
    let flag_task = tokio::spawn(watch_flags(flags.subscribe()));

    if let Err(e) = manager.connect().await {
        warn!(error = %e, kind = e.error_kind(), "initial connect failed");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("shutting down");

    manager.disconnect();
    reload_task.abort();
    flag_task.abort();

    let status = manager.status();
    info!(
        state = %status.state,
        errors = status.error_count,
        heartbeats = status.heartbeats_sent,
        "final connection status"
    );
    let summary = monitor.summary();
    info!(
        samples = summary.samples,
        error_rate = summary.error_rate,
        degradations = summary.degradations,
        incremental = summary.incremental_enabled,
        "update summary"
    );
    if let Some(recorder) = metrics {
        for sample in recorder.snapshot() {
            info!(metric = %sample.name, value = sample.value, "metric");
        }
    }
    Ok(())
}

fn subscribe_lifecycle_logging(manager: &ConnectionManager) {
    manager.on(EventKind::Reconnect, |event| {
        if let ClientEvent::Reconnected { attempt } = event {
            info!(attempt, "reconnected");
        }
        Ok(())
    });
    manager.on(EventKind::Disconnect, |event| {
        if let ClientEvent::Disconnected { reason } = event {
            info!(?reason, "disconnected");
        }
        Ok(())
    });
    manager.on(EventKind::CircuitBreakerOpen, |event| {
        if let ClientEvent::CircuitBreakerOpen { error_count, last_error } = event {
            error!(
                error_count,
                last_error = last_error.as_ref().map(|e| e.message.as_str()),
                "real-time updates suspended; restart to retry"
            );
        }
        Ok(())
    });
}

/// Stand-in for the dashboard's list refetch.
///
/// Fetching the conversation list is the host's REST layer, which this binary
/// does not have. Each request is logged and acknowledged, and the board keeps
/// whatever a host loaded into it (nothing, here).
async fn watch_reloads(
    mut rx: watch::Receiver<u64>,
    reload: Arc<ReloadSignal>,
    board: Arc<ConversationBoard>,
) {
    while rx.changed().await.is_ok() {
        let generation = *rx.borrow_and_update();
        info!(generation, conversations = board.len(), "dashboard reload requested");
        reload.complete();
    }
}

async fn watch_flags(mut rx: broadcast::Receiver<FlagChange>) {
    loop {
        match rx.recv().await {
            Ok(change) => info!(flag = %change.flag, enabled = change.enabled, "flag changed"),
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "flag change stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
