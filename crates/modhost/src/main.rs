//! modhost - main entry point
//!
//! This is the main server that:
//! - Loads the module tree and serves requests through it
//! - Serves the admin API (health, status, reload)
//! - Reloads modules on SIGHUP and unloads them on Ctrl-C

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modhost::config::AppConfig;
use modhost::modules::builtin_catalog;
use modhost::runtime::{FixedEscalation, ModuleRuntime};
use modhost::server::{self, AppState};

/// Reload the modules on every SIGHUP.
#[cfg(unix)]
fn reload_on_hangup(runtime: ModuleRuntime) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGHUP: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading modules");
            if let Err(e) = runtime.reload() {
                tracing::warn!("Reload not started: {}", e);
            }
        }
    });
}

#[cfg(not(unix))]
fn reload_on_hangup(_runtime: ModuleRuntime) {}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,modhost=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting modhost");

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let runtime = ModuleRuntime::builder(&config.modules_dir)
        .config(config.runtime_config())
        .catalog(builtin_catalog())
        .escalation(Arc::new(FixedEscalation(config.on_fatal)))
        .build();

    // A failed initial load leaves the runtime degraded; escalation decides
    // whether the process stays up
    if let Err(e) = runtime.load().await {
        tracing::error!("Initial module load failed: {}", e);
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        runtime: runtime.clone(),
    });

    // Start admin server
    let admin_addr = format!("0.0.0.0:{}", config.admin_port);
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await?;
    tracing::info!("Admin API listening on {}", admin_addr);

    let admin_app = server::create_admin_router(state.clone());
    let mut admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app).await
    });

    // Start gateway server
    let gateway_addr = format!("0.0.0.0:{}", config.gateway_port);
    let gateway_listener = tokio::net::TcpListener::bind(&gateway_addr).await?;
    tracing::info!("Gateway listening on {}", gateway_addr);

    let gateway_app = server::create_gateway_router(state);
    let mut gateway_handle = tokio::spawn(async move {
        axum::serve(gateway_listener, gateway_app).await
    });

    reload_on_hangup(runtime.clone());

    tokio::select! {
        res = &mut admin_handle => tracing::error!("Admin server exited: {:?}", res),
        res = &mut gateway_handle => tracing::error!("Gateway server exited: {:?}", res),
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
        _ = runtime.shutdown_requested() => tracing::warn!("Shutdown requested by the runtime"),
    }

    runtime.shutdown().await?;
    admin_handle.abort();
    gateway_handle.abort();
    tracing::info!("Stopped");
    Ok(())
}
