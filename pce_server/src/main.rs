//! PCE control-plane server binary.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pce::{PceConfig, PceKernel};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match PceConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    let api_port = config.api_port;
    let sweep_interval = Duration::from_secs(config.approvals.sweep_interval_s.max(1));

    // Kernel construction runs the boot sweep, so expired approvals are
    // terminal before the listener accepts any ingress.
    let kernel = match PceKernel::new(config) {
        Ok(kernel) => Arc::new(kernel),
        Err(err) => {
            error!(error = %err, "failed to initialize kernel");
            std::process::exit(1);
        }
    };

    let sweeper = kernel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            match sweeper.sweep_expired().await {
                Ok(expired) if !expired.is_empty() => {
                    info!(count = expired.len(), "expired stale approvals");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "approval sweep failed"),
            }
        }
    });

    let app = pce_server::router(kernel);
    let listener = match TcpListener::bind(("0.0.0.0", api_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port = api_port, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(port = api_port, "pce_server listening");

    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "server error");
        std::process::exit(1);
    }
}
