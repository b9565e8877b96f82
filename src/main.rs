//! Causal key-value store node — binds configuration, the node state
//! machine, and the HTTP transport together, then serves forever.

use tower_http::cors::CorsLayer;

use causal_kv::{app_state::AppState, config::Config, transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let app_state = AppState::new(&config);
    app_state.node.spawn_gossip();

    // This service has no browser-facing UI, but CORS is on by default
    // throughout this codebase's services and nothing here asks for an
    // exception.
    let app = transport::router(app_state).layer(CorsLayer::permissive());

    let addr = config.server_address();
    tracing::info!(%addr, "causal key-value node listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
