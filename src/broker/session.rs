/**
 * Client Session
 *
 * Per-WebSocket state owned by a document broker: identity, permissions and
 * the outbound queue. The session never talks to the socket directly; the
 * WebSocket glue task holds the receiving end of the queue and drains it to
 * the wire, so a slow client backs up its own queue and nothing else.
 *
 * Sessions hold no reference back to their broker. The glue task reaches the
 * broker through the handle it got from the registry, which keeps ownership
 * acyclic: broker owns session, nothing owns the broker but its own task.
 */

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use url::Url;

use crate::protocol::uri;
use crate::storage::SessionInfo;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Server-generated session id, short hex like the doc id.
pub fn next_session_id() -> String {
    format!("{:04x}", NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// A frame queued for delivery to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Text WebSocket frame
    Text(String),
    /// Binary WebSocket frame (tile header + PNG bytes)
    Binary(Bytes),
    /// Close the socket with the given code and reason
    Shutdown {
        code: u16,
        reason: String,
    },
}

/// Sending half of a session's outbound queue.
pub type SessionSender = mpsc::UnboundedSender<OutboundMessage>;

#[derive(Debug)]
pub struct ClientSession {
    id: String,
    public_uri: Url,
    sender: SessionSender,
    read_only: bool,
    document_owner: bool,
    attached: bool,
    view_loaded: bool,
    close_frame_seen: bool,
    user_id: String,
    username: String,
}

impl ClientSession {
    pub fn new(id: String, public_uri: Url, sender: SessionSender) -> Self {
        Self {
            id,
            public_uri,
            sender,
            read_only: false,
            document_owner: false,
            attached: false,
            view_loaded: false,
            close_frame_seen: false,
            user_id: String::new(),
            username: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_uri(&self) -> &Url {
        &self.public_uri
    }

    /// Decoded access token from the session's own URI.
    pub fn access_token(&self) -> Option<String> {
        uri::access_token(&self.public_uri)
    }

    /// Whether this session bypasses the token ledger.
    pub fn has_doc_pass(&self) -> bool {
        uri::has_doc_pass(&self.public_uri)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn is_document_owner(&self) -> bool {
        self.document_owner
    }

    pub fn set_document_owner(&mut self, owner: bool) {
        self.document_owner = owner;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn set_attached(&mut self) {
        self.attached = true;
    }

    pub fn is_view_loaded(&self) -> bool {
        self.view_loaded
    }

    pub fn set_view_loaded(&mut self) {
        self.view_loaded = true;
    }

    /// The client sent a close frame; the WS glue marks this so the broker
    /// knows a pending save confirmation is keeping the session alive.
    pub fn mark_close_frame(&mut self) {
        self.close_frame_seen = true;
    }

    pub fn is_close_frame(&self) -> bool {
        self.close_frame_seen
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Adopt identity and permissions from the storage file-info call.
    pub fn apply_session_info(&mut self, info: &SessionInfo) {
        self.user_id = info.user_id.clone();
        self.username = info.username.clone();
        if !info.user_can_write {
            tracing::debug!("Setting session [{}] read-only", self.id);
            self.read_only = true;
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Clone of the outbound sender, for tile-render subscriptions.
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Queue a text frame. Delivery failure means the glue task is gone;
    /// the disconnect path will remove the session shortly.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.sender.send(OutboundMessage::Text(text.into())).is_ok()
    }

    /// Queue a binary frame.
    pub fn send_binary(&self, bytes: Bytes) -> bool {
        self.sender.send(OutboundMessage::Binary(bytes)).is_ok()
    }

    /// Queue a close handshake.
    pub fn shutdown(&self, code: u16, reason: impl Into<String>) {
        let _ = self.sender.send(OutboundMessage::Shutdown {
            code,
            reason: reason.into(),
        });
    }
}
