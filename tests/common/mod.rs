//! Shared fixtures for integration tests
//!
//! Builds hermetic service stacks (temp jails, temp cache, in-memory kits)
//! and a kit harness that plays the child's side of the framed stream.

#![allow(dead_code)]

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use coedit::broker::kit::{KitPool, KitProcess};
use coedit::broker::registry::{BrokerRegistry, Services};
use coedit::broker::session::{next_session_id, ClientSession, OutboundMessage};
use coedit::protocol::frame;
use coedit::protocol::uri::sanitize_uri;
use coedit::server::Config;
use coedit::storage::TokenLedger;
use coedit::telemetry::Telemetry;

/// How long tests wait for any single expected event.
pub const WAIT: Duration = Duration::from_secs(5);

/// A config pointed at temp directories, with timers tightened so tests
/// run in milliseconds and the autosave tick pushed out of the way.
pub fn test_config(tmp: &Path) -> Config {
    Config {
        child_root: tmp.join("jails"),
        cache_root: tmp.join("cache"),
        poll_timeout: Duration::from_millis(50),
        command_timeout: Duration::from_secs(2),
        autosave_interval: Duration::from_secs(3600),
        idle_timeout: Duration::from_secs(3600),
        ..Config::default()
    }
}

pub fn test_services(config: Config, token_ledger: Option<TokenLedger>) -> Services {
    Services {
        config: Arc::new(config),
        kit_pool: Arc::new(KitPool::new()),
        token_ledger,
        telemetry: Arc::new(Telemetry::new()),
    }
}

/// The kit's end of a framed stream to one broker.
pub struct KitHarness {
    /// Reads frames the broker sent
    from_broker: tokio::io::DuplexStream,
    /// Writes frames to the broker
    to_broker: tokio::io::DuplexStream,
}

impl KitHarness {
    /// Wait for the next frame from the broker, as text.
    pub async fn expect_frame(&mut self) -> String {
        let payload = tokio::time::timeout(WAIT, frame::read_frame(&mut self.from_broker))
            .await
            .expect("timed out waiting for a kit frame")
            .expect("kit stream failed")
            .expect("kit stream closed");
        String::from_utf8_lossy(&payload).into_owned()
    }

    /// Assert no frame arrives within `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        let result =
            tokio::time::timeout(quiet, frame::read_frame(&mut self.from_broker)).await;
        assert!(result.is_err(), "expected no kit frame, got one");
    }

    /// Send a text frame to the broker.
    pub async fn send(&mut self, text: &str) {
        frame::write_frame(&mut self.to_broker, text.as_bytes())
            .await
            .expect("kit write failed");
    }

    /// Send a frame with a binary tail (tile responses).
    pub async fn send_raw(&mut self, payload: &[u8]) {
        frame::write_frame(&mut self.to_broker, payload)
            .await
            .expect("kit write failed");
    }
}

/// Put one in-memory kit into the pool and return its harness.
pub fn supply_kit(services: &Services, pid: u32) -> KitHarness {
    let (broker_reader, kit_writer) = tokio::io::duplex(1 << 20);
    let (kit_reader, broker_writer) = tokio::io::duplex(1 << 20);
    let kit = KitProcess::new(pid, format!("jail{}", pid), broker_reader, broker_writer);
    services.kit_pool.supply(kit);
    KitHarness {
        from_broker: kit_reader,
        to_broker: kit_writer,
    }
}

/// A client session plus the receiving end of its outbound queue.
pub fn make_session(uri: &str) -> (ClientSession, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let public_uri = sanitize_uri(uri).expect("test URI must sanitize");
    (ClientSession::new(next_session_id(), public_uri, tx), rx)
}

/// Wait for the next outbound text frame on a session queue.
pub async fn recv_text(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> String {
    loop {
        let message = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a session frame")
            .expect("session queue closed");
        match message {
            OutboundMessage::Text(text) => return text,
            // Skip binary frames while hunting for text.
            OutboundMessage::Binary(_) => continue,
            OutboundMessage::Shutdown { code, reason } => {
                panic!("unexpected shutdown ({}, {})", code, reason)
            }
        }
    }
}

/// Wait for the next outbound binary frame on a session queue.
pub async fn recv_binary(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Bytes {
    loop {
        let message = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a session frame")
            .expect("session queue closed");
        match message {
            OutboundMessage::Binary(data) => return data,
            OutboundMessage::Text(_) => continue,
            OutboundMessage::Shutdown { code, reason } => {
                panic!("unexpected shutdown ({}, {})", code, reason)
            }
        }
    }
}

/// Poll until `check` passes or the wait budget runs out.
pub async fn eventually<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held: {}", what);
}

/// Registry over the given services.
pub fn make_registry(services: Services) -> Arc<BrokerRegistry> {
    BrokerRegistry::new(services)
}
