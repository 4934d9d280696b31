//! The Trackcap daemon.
//!
//! Trackcap enforces per-tracker aggregate upload caps on a running
//! qBittorrent instance. It periodically inspects the active torrents,
//! classifies each by the tracker it announces to, allocates a share of
//! the tracker's cap to each torrent and writes the new per-torrent
//! limits back through the Web API. Every change is journaled for
//! rollback, and a small HTTP surface exposes statistics and operations.
//!
//! # Usage
//!
//! ```bash
//! trackcap --config config/trackcap.yaml
//! ```
//!
//! Exit codes: 0 on clean shutdown, non-zero on configuration errors or
//! fatal startup failures.
mod app;
mod servers;
mod webhook;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trackcap_configuration::{Configuration, LoggingSettings};

/// Per-tracker aggregate upload caps for qBittorrent.
#[derive(Parser, Debug)]
#[command(name = "trackcap")]
#[command(about = "Per-tracker aggregate upload caps for qBittorrent")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config/trackcap.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Configuration::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            // Logging is configured from the file we just failed to
            // load, so this goes straight to stderr.
            eprintln!("trackcap: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _logging_guard = init_logging(&config.logging);

    match app::run(config, args.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "fatal startup failure");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the tracing subscriber from the logging settings.
///
/// Returns the file writer's flush guard, which must live as long as
/// the process when a log file is configured.
fn init_logging(settings: &LoggingSettings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match &settings.file {
        Some(file) => {
            let path = PathBuf::from(file);
            let directory = path.parent().filter(|parent| !parent.as_os_str().is_empty());
            let file_name = path.file_name().map_or_else(
                || std::ffi::OsString::from("trackcap.log"),
                std::ffi::OsStr::to_os_string,
            );

            if let Some(directory) = directory {
                if let Err(err) = std::fs::create_dir_all(directory) {
                    eprintln!("trackcap: unable to create the log directory, logging to console: {err}");
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    return None;
                }
            }

            let appender = tracing_appender::rolling::never(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
