//! Relay binary: read config from the environment, open the database,
//! serve.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use agentmesh_relay::email::LogCodeSender;
use agentmesh_relay::{router, AppState, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(?addr, db = %config.db_path.display(), "Starting agentmesh relay");

    let state = AppState::new(config, Arc::new(LogCodeSender))?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
