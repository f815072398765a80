// (c) Copyright 2023 Helsing GmbH. All rights reserved.

use std::sync::Arc;

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use provider_mirror::{
    config::{Config, LogFormat, StorageKind},
    metrics::Metrics,
    mirror::Mirror,
    server::{self, AppState},
    storage::{AnyStorage, Filesystem, InMemory},
    upstream::UpstreamClient,
};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let config = Config::parse()
        .validate()
        .into_diagnostic()
        .wrap_err("invalid configuration")?;

    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        storage = ?config.storage,
        cache_dir = %config.cache_dir.display(),
        upstream_url = %config.upstream_url,
        base_url = %config.base_url,
        "starting provider mirror"
    );

    let storage: AnyStorage = match config.storage {
        StorageKind::Filesystem => {
            let storage = Filesystem::open(&config.cache_dir)
                .await
                .into_diagnostic()
                .wrap_err("failed to initialize filesystem storage")?;
            tracing::info!(cache_dir = %storage.root().display(), "filesystem storage initialized");
            Arc::new(storage)
        }
        StorageKind::Memory => {
            tracing::info!("in-memory storage initialized");
            Arc::new(InMemory::new())
        }
    };

    let metrics = Metrics::new();

    let upstream = UpstreamClient::new(&config, metrics.clone())
        .into_diagnostic()
        .wrap_err("failed to build upstream client")?;

    let mirror = Arc::new(Mirror::new(
        storage,
        Arc::new(upstream),
        config.base_url.clone(),
        metrics.clone(),
    ));

    let app = server::router(AppState::new(mirror, metrics), &config);

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .into_diagnostic()
        .wrap_err("failed to bind listener")?;
    let addr = listener.local_addr().into_diagnostic()?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_timeout()))
        .await
        .into_diagnostic()
        .wrap_err("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
///
/// Once a signal is seen, in-flight connections get the configured drain
/// window; a watchdog aborts the process with a non-zero exit if they
/// overstay it.
async fn shutdown_signal(grace: std::time::Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::error!("graceful shutdown timed out");
        std::process::exit(1);
    });
}
