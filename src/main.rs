// SPDX-License-Identifier: MPL-2.0

mod atproto;
mod config;
mod ingester;
mod sink;
mod store;
mod subscription;
mod takedown;
mod validator;
mod watcher;

use crate::config::Config;
use crate::ingester::Ingester;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("muncher=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let mut ingester = Ingester::new(config);
    if let Err(e) = ingester.start().await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
    info!("label ingester running");

    wait_for_shutdown().await;

    info!("shutting down");
    ingester.stop().await;
    info!("stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
