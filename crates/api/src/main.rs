//! Gateway server binary
//!
//! Initialization order is fixed: encryption key → registry → session
//! manager → janitor → bridge. Shutdown reverses it: the HTTP server stops
//! accepting, open channels close with their streams, then the janitor
//! drains every backend session.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use gateway_api::bridge::routes;
use gateway_api::janitor::Janitor;
use gateway_api::{AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    if let Some(email) = &config.initial_admin_email {
        // Seeding the admin account belongs to the user-management
        // collaborator; the gateway only surfaces the setting.
        tracing::info!(email = %email, "INITIAL_ADMIN_EMAIL set; admin seeding is external");
    }

    let pool = gateway_shared::create_pool(&config.database_url, config.database_max_connections)
        .await?;
    gateway_shared::run_migrations(&pool).await?;

    let state = AppState::assemble(config.clone(), pool)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let janitor = Janitor::new(
        Arc::clone(&state.sessions),
        config.session_cleanup_interval,
    )
    .spawn(shutdown_rx);

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Janitor runs the final drain of every backend session
    let _ = shutdown_tx.send(true);
    let _ = janitor.await;

    Ok(())
}
