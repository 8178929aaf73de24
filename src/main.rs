/**
 * coedit Server Entry Point
 *
 * Loads configuration from the environment, initializes tracing, wires the
 * services and serves the WebSocket acceptor until interrupted. On Ctrl+C
 * every broker is asked to stop so open documents get a final save pass
 * before the process exits.
 */

use coedit::server::{create_app, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = Config::from_env()?;
    let addr = config.socket_addr_string();
    tracing::info!("Starting coedit server on {}", addr);

    let (app, registry) = create_app(config).await;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop every broker and give them a moment to flush saves and kits.
    registry.shutdown_all("recycling").await;
    let mut remaining = 50;
    while registry.broker_count().await > 0 && remaining > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        remaining -= 1;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
    }
    tracing::info!("Shutdown requested");
}
