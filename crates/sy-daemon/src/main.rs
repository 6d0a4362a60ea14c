//! switchyard daemon: loads configuration, starts logging, and serves the
//! session gateway until ctrl-c.

use anyhow::{Context, Result};
use sy_core::config::Config;
use sy_daemon::daemon::Daemon;
use sy_telemetry::logging::LogFormat;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let format: LogFormat = config
        .general
        .log_format
        .parse()
        .map_err(anyhow::Error::msg)
        .context("invalid general.log_format")?;
    sy_telemetry::logging::init("sy-daemon", &config.general.log_level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        config = %Config::default_path().display(),
        "switchyard daemon starting"
    );

    let daemon = Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
