use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

use switchboard_bridge::{start_server, BridgeState};
use switchboard_core::{Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoordinatorConfig::load();
    let mut coordinator = Coordinator::with_http_transport(config)?;
    coordinator.start().await?;

    let addr: SocketAddr = std::env::var("SWITCHBOARD_BRIDGE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()?;

    let state = BridgeState::from_coordinator(&coordinator);
    let server_result = start_server(addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await;

    // Persist pending deliveries even if the server failed.
    coordinator.shutdown().await?;
    server_result.map_err(|e| e.into())
}
