//! Aviary control service binary.
//!
//! Runs the control plane: HTTP API, deployment lifecycle, coin economy.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aviary_control::api::{self, AppState};
use aviary_control::config::ControlConfig;
use aviary_control::ledger::Ledger;
use aviary_control::mailer::create_mailer;
use aviary_control::paas::create_provider;
use aviary_control::store::{MemoryStore, PlatformStore, PostgresStore};
use aviary_control::DeploymentManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("aviary_control=info".parse()?),
        )
        .init();

    info!("Aviary control service starting");

    // Load configuration
    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen = %config.server.listen,
        database = %config.database.url,
        paas = %config.paas.base_url,
        "configuration loaded"
    );

    // Connect to the database, falling back to the in-memory store so the
    // service still comes up for local development.
    let store: Arc<dyn PlatformStore> = match PostgresStore::new(&config.database).await {
        Ok(store) => {
            info!(url = %config.database.url, "connected to PostgreSQL");
            Arc::new(store)
        }
        Err(e) => {
            warn!(error = %e, "failed to connect to PostgreSQL, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    // External collaborators
    let paas = create_provider(&config.paas)?;
    let mailer = create_mailer(&config.mailer);

    // Core services
    let manager = Arc::new(DeploymentManager::new(
        Arc::clone(&store),
        Arc::clone(&paas),
        config.paas.clone(),
        config.deployment.clone(),
    ));
    let ledger = Arc::new(Ledger::new(Arc::clone(&store), config.economy.clone()));

    let state = AppState {
        manager,
        ledger,
        store,
        paas,
        mailer,
    };

    // Build router and serve
    let app = api::router(state);

    let listener = TcpListener::bind(config.server.listen).await?;
    info!(addr = %config.server.listen, "control API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
