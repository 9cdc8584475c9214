use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use arquebus::app::App;
use arquebus::config::{CliArgs, Config};
use arquebus::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = Config::load(&args)?;

    telemetry::init_tracing(&config.logging.level);
    let meter_provider = telemetry::init_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.server.address(),
        database = %config.database.path,
        "Starting arquebus"
    );

    let result = match App::bootstrap(config) {
        Ok(app) => app.run(shutdown_signal()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!("arquebus failed: {:#}", e);
    }

    telemetry::shutdown_metrics(&meter_provider);
    result
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
