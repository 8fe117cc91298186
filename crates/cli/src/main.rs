//! `sbrelay` entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration** from flags and `SBRELAY_*` environment variables.
//! 2. **Wire observability**: `tracing-subscriber` with text or JSON output and,
//!    when an OTLP endpoint is configured, an OpenTelemetry exporter.
//! 3. **Construct infrastructure**: the sled-backed trigger table, the Service
//!    Bus connector and the HTTP callback client, injected into the registry.
//! 4. **Recover, then serve**: every persisted trigger is restarted before the
//!    registration API starts accepting requests.
//! 5. **Shut down**: on Ctrl+C or SIGTERM stop serving, then stop every
//!    listener while leaving durable records in place.

use std::sync::Arc;

use anyhow::{Context, Result};
use callback::HttpCallbackClient;
use clap::Parser;
use relay::{RegistrationService, TriggerRegistry};
use servicebus::ServiceBusConnector;
use table_store::{SledTable, TableTriggerStore};
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod config;
mod telemetry;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let _telemetry = telemetry::init(&config)?;
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let scope = config.scope_policy()?;

    let table = SledTable::open(&config.store_path).with_context(|| {
        format!(
            "failed to open trigger store at {}",
            config.store_path.display()
        )
    })?;
    let connector = ServiceBusConnector::new(config.servicebus_settings())
        .context("failed to create Service Bus connector")?;
    let callback = HttpCallbackClient::new(config.callback_timeout())
        .context("failed to create callback client")?;

    let registry = TriggerRegistry::new(
        Arc::new(TableTriggerStore::new(table)),
        Arc::new(connector),
        Arc::new(callback),
        config.listener_config(),
    );

    let report = registry
        .init()
        .await
        .context("failed to recover persisted triggers")?;
    info!(
        recovered = report.recovered.len(),
        degraded = report.degraded.len(),
        skipped = report.skipped.len(),
        "trigger recovery complete"
    );
    for (workflow_id, reason) in &report.degraded {
        warn!(workflow_id = %workflow_id, reason = %reason, "trigger recovered without a listener");
    }
    for (key, reason) in &report.skipped {
        warn!(key = %key, reason = %reason, "stored trigger row skipped");
    }

    let app = api::router(RegistrationService::new(registry.clone(), scope));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(address = %config.bind, "registration API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    registry.teardown().await;
    info!("sbrelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C; shutting down"),
        _ = terminate => info!("received SIGTERM; shutting down"),
    }
}
