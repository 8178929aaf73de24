/**
 * Broker Registry
 *
 * Process-global map from document key to live broker. Find-or-create is
 * serialized by the registry lock so two clients opening the same document
 * land on one broker; everything downstream of admission is single-task per
 * document. The registry is also the escalation point for messages that
 * must reach every session of every document.
 *
 * Process-wide services (config, kit pool, token ledger, telemetry) are
 * constructed once and passed into brokers through the registry; nothing
 * here is a hidden singleton, which keeps tests hermetic.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::document::{BrokerHandle, DocumentBroker};
use crate::broker::kit::KitPool;
use crate::error::DocError;
use crate::protocol::uri;
use crate::server::config::Config;
use crate::storage::TokenLedger;
use crate::telemetry::Telemetry;

/// Everything a broker needs from the process around it.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub kit_pool: Arc<KitPool>,
    pub token_ledger: Option<TokenLedger>,
    pub telemetry: Arc<Telemetry>,
}

/// How long find-or-create waits for a broker marked to destroy to
/// unregister before giving up.
const DESTROY_WAIT_SLICE: Duration = Duration::from_millis(50);
const DESTROY_WAIT_ATTEMPTS: u32 = 100;

pub struct BrokerRegistry {
    services: Services,
    brokers: tokio::sync::Mutex<HashMap<String, BrokerHandle>>,
}

impl BrokerRegistry {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self {
            services,
            brokers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Find the broker for a raw public URI, creating one when absent.
    ///
    /// A broker marked to destroy refuses sessions; the caller is held
    /// (bounded) until the dying broker unregisters and a fresh one can
    /// take its key.
    pub async fn find_or_create(self: &Arc<Self>, raw_uri: &str) -> Result<BrokerHandle, DocError> {
        let uri_public = uri::sanitize_uri(raw_uri)?;
        let doc_key = uri::doc_key(&uri_public);

        let mut attempts = 0u32;
        loop {
            {
                let mut brokers = self.brokers.lock().await;
                if let Some(handle) = brokers.get(&doc_key) {
                    if handle.is_alive() && !handle.is_marked_to_destroy() {
                        tracing::debug!("Found DocumentBroker with docKey [{}]", doc_key);
                        return Ok(handle.clone());
                    }
                    if !handle.is_alive() {
                        tracing::warn!(
                            "Removing dead broker entry for docKey [{}]",
                            doc_key
                        );
                        brokers.remove(&doc_key);
                    }
                }

                if !brokers.contains_key(&doc_key) {
                    tracing::debug!("Creating DocumentBroker for docKey [{}]", doc_key);
                    let handle = DocumentBroker::start(
                        uri_public.clone(),
                        doc_key.clone(),
                        self.services.clone(),
                        Arc::clone(self),
                    );
                    brokers.insert(doc_key.clone(), handle.clone());
                    return Ok(handle);
                }
            }

            // Marked to destroy: wait for the teardown to unregister it.
            attempts += 1;
            if attempts > DESTROY_WAIT_ATTEMPTS {
                tracing::error!(
                    "Timed out waiting for dying broker [{}] to unregister",
                    doc_key
                );
                return Err(DocError::MarkedToDestroy);
            }
            tokio::time::sleep(DESTROY_WAIT_SLICE).await;
        }
    }

    /// Look up a live broker without creating one.
    pub async fn find(&self, doc_key: &str) -> Option<BrokerHandle> {
        let brokers = self.brokers.lock().await;
        brokers.get(doc_key).filter(|h| h.is_alive()).cloned()
    }

    /// Called by a broker as its last act before its task exits.
    pub async fn remove(&self, doc_key: &str) {
        let mut brokers = self.brokers.lock().await;
        if brokers.remove(doc_key).is_some() {
            tracing::info!("Unregistered DocumentBroker for docKey [{}]", doc_key);
        }
    }

    pub async fn broker_count(&self) -> usize {
        self.brokers.lock().await.len()
    }

    /// Escalate an error to every session of every document.
    pub async fn alert_all_users(&self, cmd: &str, kind: &str) {
        let message = format!("error: cmd={} kind={}", cmd, kind);
        tracing::warn!("Alerting all users: {}", message);

        let handles: Vec<BrokerHandle> = self.brokers.lock().await.values().cloned().collect();
        for handle in handles {
            let message = message.clone();
            handle.queue_callback(Box::new(move |broker| {
                broker.alert_all_sessions(&message);
            }));
        }
    }

    /// Ask every broker to stop, e.g. at process shutdown.
    pub async fn shutdown_all(&self, reason: &str) {
        let handles: Vec<BrokerHandle> = self.brokers.lock().await.values().cloned().collect();
        tracing::info!("Stopping {} document brokers: {}", handles.len(), reason);
        for handle in handles {
            handle.stop(reason);
        }
    }
}
