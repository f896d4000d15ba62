//! Green core controller
//!
//! Samples per-core utilization across the configured compute hosts and puts
//! idle dynamic cores to sleep, waking them when load returns.

use anyhow::{Context, Result};
use greencore::{api, config::ServiceConfig};
use greencore_lib::{create_agents, CoreController, HealthRegistry, StructuredLogger};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "greencore";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from RUST_LOG
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting {}", SERVICE_NAME);

    let config = ServiceConfig::load().context("Failed to load configuration")?;
    let fleet = config.fleet();
    let controller_config = config.controller_config();
    info!(
        hosts = fleet.hosts.len(),
        agent = ?config.agent,
        listen = %config.listen_addr(),
        "Controller configured"
    );

    let health = HealthRegistry::new();
    health
        .register_fleet(fleet.hosts.iter().map(|host| &host.name))
        .await;

    let agents = create_agents(&fleet, config.agent, controller_config.agent_timeout);

    let logger = StructuredLogger::new(SERVICE_NAME);
    logger.log_startup(SERVICE_VERSION, fleet.hosts.len(), fleet.core_count());

    let controller = CoreController::builder()
        .fleet(fleet)
        .agents(agents)
        .config(controller_config)
        .health(health.clone())
        .service_name(SERVICE_NAME)
        .build()
        .context("Failed to build controller")?;

    let app_state = Arc::new(api::AppState::new(controller.clone()));
    let listener = api::bind(&config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind API listener on {}", config.listen_addr()))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut api_handle = tokio::spawn(api::serve(listener, app_state, async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            controller.stop().await;
            return Ok(());
        }
    }

    health.set_ready(false).await;
    controller.stop().await;
    let _ = shutdown_tx.send(());
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }
    info!("Shutting down");

    Ok(())
}
