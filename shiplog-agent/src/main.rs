//! # shiplog agent
//!
//! Industrial log collection agent. Watches machine log directories for
//! newline-delimited JSON, validates and sanitizes each record, groups
//! records into bounded batches, and uploads them to a remote object
//! store under a device identity.
//!
//! Exit codes: `0` clean shutdown, `1` configuration error, `2` fatal
//! initialization failure, `3` drain-timeout abandonment or an
//! unrecoverable task failure.

/// Operator control surface.
pub mod routes;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shiplog_config::validation;
use shiplog_core::clock::SystemClock;
use shiplog_core::upload::{ConnectionString, HttpObjectStore, SasCredentialProvider};
use shiplog_core::{AgentError, AgentHealth, ShutdownOutcome, Supervisor};

const EXIT_CONFIG: u8 = 1;
const EXIT_INIT: u8 = 2;
const EXIT_ABANDONED: u8 = 3;

/// Command line arguments for the shiplog agent
#[derive(Parser, Debug)]
#[command(name = "shiplog-agent")]
#[command(about = "Collects machine logs and ships them to cloud object storage")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "SHIPLOG_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Control endpoint listen address (overrides config)
    #[arg(long, env = "SHIPLOG_CONTROL_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shiplog_agent=info,shiplog_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(ShutdownOutcome::Clean) => ExitCode::SUCCESS,
        Ok(ShutdownOutcome::Abandoned) | Ok(ShutdownOutcome::Fatal) => {
            ExitCode::from(EXIT_ABANDONED)
        }
        Err(code) => ExitCode::from(code),
    }
}

async fn run(args: Args) -> Result<ShutdownOutcome, u8> {
    let (mut config, source) = shiplog_config::load(args.config.as_deref()).map_err(|error| {
        error!(%error, "failed to load configuration");
        EXIT_CONFIG
    })?;
    if let Some(listen) = args.listen {
        config.agent.control_listen = listen;
    }
    info!(?source, "configuration loaded");

    let warnings = validation::validate(&config).map_err(|error| {
        error!(%error, "configuration rejected");
        EXIT_CONFIG
    })?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    let clock = Arc::new(SystemClock);
    let health = Arc::new(AgentHealth::new());

    let connection = ConnectionString::parse(&config.upload.connection_string).map_err(|error| {
        error!(%error, "invalid connection string");
        EXIT_CONFIG
    })?;
    let endpoint = connection.endpoint.clone();
    let credentials = Arc::new(SasCredentialProvider::new(
        connection,
        config.upload.token_ttl(),
        clock.clone() as Arc<dyn shiplog_core::Clock>,
    ));
    let store = Arc::new(
        HttpObjectStore::new(&endpoint, credentials, config.upload.attempt_timeout()).map_err(
            |error| {
                error!(%error, "failed to build object store client");
                EXIT_INIT
            },
        )?,
    );

    let control_listen = config.agent.control_listen.clone();
    let supervisor = Supervisor::new(
        config,
        clock,
        Arc::clone(&health),
        store,
    );
    let agent = supervisor.start().await.map_err(|error| {
        error!(%error, "agent failed to start");
        match error {
            AgentError::WatchConfig(_) | AgentError::Credential(_) => EXIT_CONFIG,
            _ => EXIT_INIT,
        }
    })?;

    // Control endpoint.
    let listener = tokio::net::TcpListener::bind(&control_listen)
        .await
        .map_err(|error| {
            error!(%error, listen = %control_listen, "failed to bind control endpoint");
            EXIT_INIT
        })?;
    info!(listen = %control_listen, "control endpoint up");
    let server_token = CancellationToken::new();
    let server = {
        let state = routes::AppState {
            health: Arc::clone(&agent.health),
            catalog: Arc::clone(&agent.catalog),
            queue: agent.queue.clone(),
            uploader: Arc::clone(&agent.uploader),
            dead_letter_inventory: agent.dead_letter_inventory,
            started_at: chrono::Utc::now(),
        };
        let token = server_token.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(error) = axum::serve(listener, routes::router(state))
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(%error, "control endpoint failed");
            }
        })
    };

    let fatal = agent.fatal_token();
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = fatal.cancelled() => error!("unrecoverable task failure; draining"),
    }

    let outcome = agent.shutdown().await;
    server_token.cancel();
    if tokio::time::timeout(Duration::from_secs(2), server).await.is_err() {
        warn!("control endpoint did not stop in time");
    }
    Ok(outcome)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_accept_config_path() {
        let args = Args::parse_from(["shiplog-agent", "--config", "/etc/shiplog.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/shiplog.toml")));
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(EXIT_CONFIG, 1);
        assert_eq!(EXIT_INIT, 2);
        assert_eq!(EXIT_ABANDONED, 3);
    }
}
