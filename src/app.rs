//! Application bootstrap and task wiring.
//!
//! The daemon runs four independent tasks over shared state: the cycle
//! task (the only writer of engine state), the HTTP surface, the
//! webhook intake (inside the HTTP handlers) and the cross-seed
//! forwarder. Shutdown is signalled through a watch channel; the cycle
//! task honors it at a cycle boundary.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use trackcap_configuration::Configuration;
use trackcap_core::allocation::engine::AllocationEngine;
use trackcap_core::dry_run::DryRunStore;
use trackcap_core::qbit::client::QbitClient;
use trackcap_core::rollback::setup::initialize_rollback_store;
use trackcap_core::rollback::RollbackStore;
use trackcap_core::torrent::repository::in_memory::InMemoryTorrentRepository;
use trackcap_core::tracker::matcher::TrackerMatcher;

use crate::servers;
use crate::webhook::cross_seed::CrossSeedForwarder;
use crate::webhook::{self, WebhookEvent, WebhookIntake};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CROSS_SEED_CHANNEL_CAPACITY: usize = 256;

/// Fatal startup failures; the process exits non-zero on any of these.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Invalid tracker configuration: {source}")]
    Tracker {
        #[from]
        source: trackcap_core::tracker::Error,
    },

    #[error("Unable to initialize the rollback journal: {source}")]
    Rollback {
        #[from]
        source: trackcap_core::rollback::error::Error,
    },

    #[error("Unable to initialize the dry-run store: {source}")]
    DryRun {
        #[from]
        source: trackcap_core::dry_run::Error,
    },

    #[error("Unable to initialize the qBittorrent client: {source}")]
    Client {
        #[from]
        source: trackcap_core::qbit::Error,
    },

    #[error("Unable to serve the HTTP surface: {source}")]
    Serve { source: std::io::Error },
}

/// Process-wide shared state, passed explicitly to every handler.
pub struct AppState {
    pub config: std::sync::RwLock<Configuration>,
    pub config_path: PathBuf,
    pub engine: Arc<AllocationEngine>,
    pub matcher: Arc<TrackerMatcher>,
    pub cache: Arc<InMemoryTorrentRepository>,
    pub rollback: Arc<Box<dyn RollbackStore>>,
    pub qbit: Arc<QbitClient>,
    pub intake: Arc<WebhookIntake>,
    pub cross_seed: Option<Arc<CrossSeedForwarder>>,
    pub started_at: Instant,
    pub(crate) ready: AtomicBool,
}

impl AppState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Relaxed);
    }
}

/// The assembled application, ready to run.
pub struct App {
    pub state: Arc<AppState>,
    cross_seed_rx: Option<tokio::sync::mpsc::Receiver<WebhookEvent>>,
}

/// Builds every component from the loaded configuration.
///
/// # Errors
///
/// Returns an [`AppError`] when a component cannot be initialized.
pub fn bootstrap(config: Configuration, config_path: PathBuf) -> Result<App, AppError> {
    let matcher = Arc::new(TrackerMatcher::new(config.trackers.clone())?);
    let rollback = initialize_rollback_store(&config.rollback)?;
    let qbit = Arc::new(QbitClient::new(&config.qbittorrent)?);
    let cache = Arc::new(InMemoryTorrentRepository::default());

    let dry_run_store = if config.global.dry_run {
        tracing::warn!("dry-run mode: limits are simulated, qBittorrent is never written to");
        Some(Arc::new(DryRunStore::open(Path::new(&config.global.dry_run_store_path))?))
    } else {
        None
    };

    let engine = Arc::new(AllocationEngine::new(
        &config.global,
        &qbit,
        &matcher,
        &rollback,
        config.rollback.track_all_changes,
        &cache,
        dry_run_store,
    ));

    let cross_seed = CrossSeedForwarder::from_settings(&config.cross_seed).map(Arc::new);
    let (cross_seed_tx, cross_seed_rx) = if cross_seed.is_some() {
        let (tx, rx) = tokio::sync::mpsc::channel(CROSS_SEED_CHANNEL_CAPACITY);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let intake = Arc::new(WebhookIntake::new(cross_seed_tx));

    let state = Arc::new(AppState {
        config: std::sync::RwLock::new(config),
        config_path,
        engine,
        matcher,
        cache,
        rollback,
        qbit,
        intake,
        cross_seed,
        started_at: Instant::now(),
        ready: AtomicBool::new(false),
    });

    Ok(App {
        state,
        cross_seed_rx,
    })
}

/// Runs the daemon until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an [`AppError`] on fatal startup failure; transient
/// qBittorrent unavailability is retried by the cycle task instead.
pub async fn run(config: Configuration, config_path: PathBuf) -> Result<(), AppError> {
    let (update_interval, bind_addr) = (
        Duration::from_secs(config.global.update_interval),
        format!("{}:{}", config.global.host, config.global.port),
    );

    let mut app = bootstrap(config, config_path)?;
    let state = app.state.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    if let Err(err) = state.qbit.login().await {
        tracing::warn!(%err, "initial qBittorrent login failed, the cycle task will retry");
    }

    if let (Some(forwarder), Some(events)) = (state.cross_seed.clone(), app.cross_seed_rx.take()) {
        tokio::spawn(async move {
            forwarder.run(events).await;
        });
    }

    let cycle_task = tokio::spawn(run_cycle_task(state.clone(), update_interval, shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| AppError::Serve { source })?;
    tracing::info!(address = %bind_addr, version = VERSION, "trackcap HTTP surface listening");

    state.mark_ready();

    let router = servers::http::router(state.clone());
    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .map_err(|source| AppError::Serve { source })?;

    let _ = cycle_task.await;
    tracing::info!("trackcap shut down cleanly");

    Ok(())
}

/// The periodic cycle loop. The queued webhook events are drained just
/// before each cycle so that cycle observes everything enqueued before
/// its start.
async fn run_cycle_task(state: Arc<AppState>, update_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        let events = state.intake.drain();
        webhook::apply_events(&state.engine, events).await;

        // Errors are already counted and logged by the engine; the loop
        // simply waits for the next interval.
        let _ = state.engine.run_cycle().await;

        tokio::select! {
            () = tokio::time::sleep(update_interval) => {}
            _ = shutdown.changed() => {
                tracing::info!("cycle task stopping");
                break;
            }
        }
    }
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "unable to listen for the interrupt signal");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => tracing::error!(%err, "unable to listen for the terminate signal"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }

        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
