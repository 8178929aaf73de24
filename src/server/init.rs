/**
 * Server Initialization
 *
 * Builds the process-wide services (kit pool, token ledger, telemetry),
 * creates the broker registry, starts the kit spawner, and assembles the
 * Axum router.
 *
 * # Initialization Process
 *
 * 1. Open the token ledger when a database path is configured
 * 2. Create the kit pool and, when a kit command is configured, the
 *    spawner task keeping it prewarmed
 * 3. Create the broker registry over the shared services
 * 4. Build the router: the WebSocket endpoint and the stats snapshot
 */

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::broker::kit::{KitPool, KitProcess};
use crate::broker::registry::{BrokerRegistry, Services};
use crate::server::config::Config;
use crate::server::ws::ws_handler;
use crate::storage::TokenLedger;
use crate::telemetry::Telemetry;

/// Create the application: router plus the registry handle the caller
/// needs for shutdown.
pub async fn create_app(config: Config) -> (Router, Arc<BrokerRegistry>) {
    tracing::info!("Initializing coedit server");

    let config = Arc::new(config);

    let token_ledger = match &config.tokendb_path {
        Some(path) => match TokenLedger::open(path).await {
            Ok(ledger) => {
                tracing::info!("Token ledger open at [{}]", path.display());
                Some(ledger)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to open token ledger [{}]: {}. Token replay checks disabled.",
                    path.display(),
                    e
                );
                None
            }
        },
        None => {
            tracing::warn!("COEDIT_TOKENDB_PATH not set. Token replay checks disabled.");
            None
        }
    };

    let kit_pool = Arc::new(KitPool::new());
    if let Some(command) = config.kit_command.clone() {
        spawn_kit_feeder(kit_pool.clone(), command, config.kit_prewarm);
    } else {
        tracing::warn!("COEDIT_KIT_COMMAND not set. Kits must be supplied externally.");
    }

    let services = Services {
        config: config.clone(),
        kit_pool,
        token_ledger,
        telemetry: Arc::new(Telemetry::new()),
    };

    let registry = BrokerRegistry::new(services);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/stats", get(stats_handler))
        .with_state(registry.clone());

    tracing::info!("Router configured");
    (app, registry)
}

/// Keep the kit pool topped up with prewarmed children.
fn spawn_kit_feeder(pool: Arc<KitPool>, command: String, target: usize) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(250));
        loop {
            interval.tick().await;
            while pool.available() < target {
                match KitProcess::spawn(&command) {
                    Ok(kit) => {
                        tracing::info!("Prewarmed kit [{}]", kit.pid());
                        pool.supply(kit);
                    }
                    Err(e) => {
                        tracing::error!("Failed to spawn kit via [{}]: {}", command, e);
                        break;
                    }
                }
            }
        }
    });
}

/// `GET /stats`: per-document telemetry snapshot.
async fn stats_handler(State(registry): State<Arc<BrokerRegistry>>) -> Json<serde_json::Value> {
    let docs = registry.services().telemetry.snapshot();
    Json(serde_json::json!({
        "document_count": docs.len(),
        "documents": docs,
    }))
}
