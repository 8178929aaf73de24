/**
 * WebSocket Acceptor Glue
 *
 * Adapts one client WebSocket to a broker session: the upgrade handler
 * resolves the document broker through the registry, admits a session, and
 * then pumps frames both ways. Inbound text becomes broker client commands;
 * the session's outbound queue is drained to the socket by a writer task.
 *
 * The glue holds no document state. Its only references are the broker
 * handle and the outbound receiver, so a dropped connection cleans up by
 * asking the broker to remove the session.
 */

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broker::session::{next_session_id, ClientSession, OutboundMessage};
use crate::broker::BrokerRegistry;
use crate::protocol::{uri, CLOSE_ENDPOINT_GOING_AWAY};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Public document URI, url-encoded
    pub uri: String,
}

/// `GET /ws?uri=…` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(registry): State<Arc<BrokerRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry, query.uri))
}

async fn handle_socket(socket: WebSocket, registry: Arc<BrokerRegistry>, raw_uri: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let broker = match registry.find_or_create(&raw_uri).await {
        Ok(broker) => broker,
        Err(e) => {
            tracing::warn!("Refusing connection for [{}]: {}", raw_uri, e);
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_ENDPOINT_GOING_AWAY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let public_uri = match uri::sanitize_uri(&raw_uri) {
        Ok(public_uri) => public_uri,
        Err(e) => {
            tracing::warn!("Unparseable URI [{}]: {}", raw_uri, e);
            return;
        }
    };

    let session_id = next_session_id();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let session = ClientSession::new(session_id.clone(), public_uri, outbound_tx);

    match broker.add_session(session).await {
        Ok(count) => {
            tracing::info!(
                "Session [{}] added to docKey [{}] ({} sessions)",
                session_id,
                broker.doc_key(),
                count
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to add session [{}] to docKey [{}]: {}",
                session_id,
                broker.doc_key(),
                e
            );
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_ENDPOINT_GOING_AWAY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    }

    // Drain the session's outbound queue to the wire. Ends when the broker
    // drops the session (receiver closes) or the socket dies.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let result = match message {
                OutboundMessage::Text(text) => ws_tx.send(Message::Text(text)).await,
                OutboundMessage::Binary(data) => ws_tx.send(Message::Binary(data.to_vec())).await,
                OutboundMessage::Shutdown { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                tracing::debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => broker.client_command(&session_id, text),
            Ok(Message::Close(_)) => {
                tracing::debug!("Session [{}] sent close frame", session_id);
                let id = session_id.clone();
                broker.queue_callback(Box::new(move |b| b.mark_session_close_frame(&id)));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket error on session [{}]: {}", session_id, e);
                break;
            }
        }
    }

    broker.remove_session(&session_id, true);
    // Let the writer flush whatever the broker still queues (a deferred
    // last-editor save may keep the session alive briefly).
    let _ = writer.await;
    tracing::info!("Session [{}] connection closed", session_id);
}
