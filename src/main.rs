//! # relay
//!
//! Event relay binary. Each subcommand runs one independent process of the
//! pipeline: the callback dispatcher with its worker pool, the fact-cache
//! receiver, or the live fan-out server. `token` manages the login tokens
//! the fan-out server admits.

#![deny(unsafe_code)]

mod signals;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::NotificationPacket;
use relay_dispatch::DispatchError;
use relay_settings::RelaySettings;
use relay_store::{Database, TokenRepo};
use relay_telemetry::{init_telemetry, TelemetryConfig};
use relay_transport::{Channel, Publisher, PublisherConfig};

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Job event relay")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Receive callback events, persist them and publish live notifications.
    Dispatch,
    /// Cache host facts published by running jobs.
    Facts,
    /// Serve live notifications to authenticated websocket clients.
    Fanout,
    /// Issue or revoke fan-out login tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum TokenAction {
    /// Print a new token for `user`.
    Issue {
        user: String,
        /// Lifetime in hours.
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
    /// Revoke a token and disconnect its live sessions.
    Revoke { token: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(DispatchError::AllQueuesFull { workers }) = e.downcast_ref::<DispatchError>() {
                error!(workers, "every worker queue is full, exiting");
            } else {
                error!(error = %format!("{e:#}"), "relay exited with error");
            }
            eprintln!("relay: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path),
        None => relay_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(path) = cli.db_path {
        settings.database.path = path;
    }

    init_telemetry(TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json));
    info!(command = ?cli.command, "relay starting");

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    let db = Database::open(&settings.database.path)
        .with_context(|| format!("failed to open database at {}", settings.database.path.display()))?;

    match cli.command {
        Command::Dispatch => run_dispatch(&settings, db, cancel).await,
        Command::Facts => relay_dispatch::run_fact_receiver(&settings, db, cancel)
            .await
            .context("fact receiver failed"),
        Command::Fanout => relay_fanout::run_fanout(&settings, Arc::new(db), cancel)
            .await
            .context("fan-out server failed"),
        Command::Token { action } => run_token(&settings, db, action).await,
    }
}

async fn run_token(settings: &RelaySettings, db: Database, action: TokenAction) -> Result<()> {
    let tokens = TokenRepo::new(db);
    match action {
        TokenAction::Issue { user, ttl_hours } => {
            let key = tokens
                .issue(&user, chrono::Duration::hours(ttl_hours))
                .context("failed to issue token")?;
            println!("{key}");
        }
        TokenAction::Revoke { token } => {
            tokens.revoke(&token).context("failed to revoke token")?;
            let mut publisher = Publisher::new(
                Channel::Notifications,
                Channel::Notifications.endpoint(&settings.endpoints),
                PublisherConfig::from(&settings.transport),
            );
            // Revocation is already durable; a fan-out that is not running has no sessions.
            match publisher.publish(&NotificationPacket::invalidate_sessions(token)).await {
                Ok(()) => info!("live sessions for the token disconnected"),
                Err(e) => warn!(error = %e, "could not reach the fan-out server"),
            }
            publisher.close();
        }
    }
    Ok(())
}

async fn run_dispatch(settings: &RelaySettings, db: Database, cancel: CancellationToken) -> Result<()> {
    match relay_dispatch::run_dispatcher(settings, Arc::new(db), cancel).await {
        Ok(()) => {
            info!("dispatcher stopped");
            Ok(())
        }
        Err(DispatchError::GraceExceeded { grace, stuck }) => {
            warn!(?grace, ?stuck, "workers did not stop within the grace period");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signals::wait_for_shutdown_signal().await {
            Ok(()) => cancel.cancel(),
            Err(e) => error!(error = %e, "failed to install signal handlers"),
        }
    });
}
