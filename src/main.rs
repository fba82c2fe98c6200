//! Silo field monitor entry point: startup ordering, signal-driven
//! shutdown, and final flush (spec.md §4.9 "Lifecycle"). Structured like
//! `modsrv/src/main.rs`'s single `#[tokio::main]` wiring function, with
//! CLI args in the `comsrv`/`clap` idiom.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use silod::alerts::AlertEngine;
use silod::bus::BusAdapter;
use silod::config::Config;
use silod::database_reader;
use silod::http::{self, AppState};
use silod::logging;
use silod::persistence::{self, DRAIN_TIMEOUT_SECS, PersistenceWriter};
use silod::scheduler::{run_supervised, PollScheduler};
use silod::state::StateStore;

#[derive(Parser, Debug)]
#[command(
    name = "silod",
    version,
    about = "Field-level polling and data-fusion service for a silo sensor array"
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "silod.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = logging::init(&config.logging);
    info!(config_path = %args.config.display(), "silo field monitor starting");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> silod::error::Result<()> {
    let shutdown = CancellationToken::new();

    let bus = Arc::new(BusAdapter::new(config.modbus.clone()));
    let state = Arc::new(StateStore::new(
        &config.polling.slaves,
        config.history_max_points,
        config.validation.clone(),
    ));
    let alerts = Arc::new(AlertEngine::new(&config.alerts));

    let (persistence_queue, persistence_receiver, persistence_writer) =
        PersistenceWriter::start(config.database.clone()).await?;

    let db_read_pool = if config.database.enabled {
        Some(database_reader::build_pool(&config.database).await?)
    } else {
        None
    };

    alerts.notify_startup().await;

    let writer_handle = persistence::spawn(persistence_writer, persistence_receiver);

    let scheduler = PollScheduler::new(
        bus.clone(),
        state.clone(),
        persistence_queue,
        alerts.clone(),
        config.polling.clone(),
        shutdown.clone(),
    );
    let scheduler_alerts = alerts.clone();
    let scheduler_handle = tokio::spawn(run_supervised(scheduler, scheduler_alerts));

    let app_state = Arc::new(AppState {
        state_store: state.clone(),
        alerts: alerts.clone(),
        config: config.clone(),
        db_pool: db_read_pool,
    });

    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(http::serve(config.flask.clone(), app_state, async move {
        http_shutdown.cancelled().await;
    }));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping service");
    shutdown.cancel();

    let _ = scheduler_handle.await;
    bus.close().await;

    match tokio::time::timeout(Duration::from_secs(DRAIN_TIMEOUT_SECS), writer_handle).await {
        Ok(Ok(())) => info!("persistence writer drained cleanly"),
        Ok(Err(e)) => warn!(error = %e, "persistence writer task join error"),
        Err(_) => warn!("persistence writer did not drain within the shutdown budget"),
    }

    alerts.notify_critical("service shut down gracefully").await;
    let _ = http_handle.await;

    info!("silo field monitor stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                None
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = async {
                match term.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
