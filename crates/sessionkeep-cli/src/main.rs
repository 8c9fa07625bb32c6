//! sessionkeep - keep a client session alive from the command line.
//!
//! Stores a bearer token with its expiry, refreshes it before it lapses,
//! answers permission checks, and logs out across every process sharing
//! the same store.

mod app;
mod config;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::{App, Command, USAGE};
use config::Config;

/// Log file name prefix inside `log_dir`
const LOG_FILE_PREFIX: &str = "sessionkeep.log";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, and additionally to a daily rolling file when
/// `log_dir` is configured. The returned guard must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            return Ok(ExitCode::from(2));
        }
    };

    let mut config = Config::load()?;
    let _guard = init_tracing(config.log_dir.as_deref());
    info!("sessionkeep starting");

    let salt_before = config.sealing_salt.clone();
    let app = App::new(&mut config, app::read_passphrase)?;
    if config.sealing_salt != salt_before {
        config.save()?;
    }

    let outcome = app.run(command).await?;
    Ok(outcome.into())
}
