//! Optional admin listener: plugin status, the live route table, metrics
//! and a reload trigger.

use std::sync::Arc;
use warp::Filter;

use crate::error::{ConfigError, HostError, Result};
use crate::state::AppState;

pub mod api;

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.admin_addr();

    tracing::info!("Starting admin API on {}", addr);

    // Create routes
    let routes = create_routes(state.clone());

    // Parse address
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| HostError::Config(ConfigError::Parse(format!("Invalid admin address: {e}"))))?;

    // Start server with graceful shutdown
    let (_, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = state.shutdown_tx.subscribe().recv().await;
        })
        .map_err(|e| HostError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    server.await;

    tracing::info!("Admin API stopped");
    Ok(())
}

fn create_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_routes = api::routes(state);

    // Health check
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "oasis-plugin-host"
        }))
    });

    api_routes
        .or(health)
        .with(warp::trace::request())
}
