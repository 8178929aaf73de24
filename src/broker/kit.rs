/**
 * Kit Process Handle
 *
 * The kit is the per-document renderer child process. The broker owns its
 * handle: a pid, a jail id, and a framed duplex byte stream (the child's
 * stdio here). Two small tasks pump the stream: a writer draining the
 * outbound frame queue, and a reader pushing inbound frames into a channel
 * the broker's event loop selects on. When either side of the stream dies
 * the channels close and the broker observes kit death as end-of-stream.
 *
 * Kits are borrowed from a process-wide prewarmed pool; a spawner outside
 * the broker keeps the pool topped up.
 */

use bytes::Bytes;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::frame;

#[derive(Debug)]
pub struct KitProcess {
    pid: u32,
    jail_id: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    /// Cleared by the pump tasks when the stream dies, before the broker
    /// observes end-of-stream.
    alive: Arc<AtomicBool>,
    child: Option<Arc<Mutex<tokio::process::Child>>>,
}

impl KitProcess {
    /// Wrap an already-connected framed stream. Used by the pool spawner
    /// with child stdio, and by tests with in-memory duplex pipes.
    pub fn new<R, W>(pid: u32, jail_id: String, mut reader: R, mut writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Bytes>();
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                if let Err(e) = frame::write_frame(&mut writer, &payload).await {
                    tracing::warn!("Kit [{}] write failed: {}", pid, e);
                    writer_alive.store(false, Ordering::Release);
                    break;
                }
            }
        });

        let reader_alive = alive.clone();
        tokio::spawn(async move {
            loop {
                match frame::read_frame(&mut reader).await {
                    Ok(Some(payload)) => {
                        if inbound_tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Kit [{}] closed its socket", pid);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Kit [{}] read failed: {}", pid, e);
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::Release);
        });

        Self {
            pid,
            jail_id,
            outbound,
            inbound: Some(inbound),
            alive,
            child: None,
        }
    }

    /// Spawn the kit command and frame over its stdio.
    pub fn spawn(command: &str) -> std::io::Result<Self> {
        let jail_id = Uuid::new_v4().simple().to_string();
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty kit command")
        })?;

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .env("COEDIT_JAIL_ID", &jail_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "kit stdin not piped")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "kit stdout not piped")
        })?;
        let pid = child.id().unwrap_or_default();

        let mut kit = Self::new(pid, jail_id, stdout, stdin);
        kit.child = Some(Arc::new(Mutex::new(child)));
        Ok(kit)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn jail_id(&self) -> &str {
        &self.jail_id
    }

    /// Whether the kit's socket is still up.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queue a text frame for the kit.
    pub fn send_text(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        tracing::trace!("To kit [{}]: {}", self.pid, message);
        self.outbound.send(Bytes::from(message)).is_ok()
    }

    /// Take the inbound frame channel; the broker loop selects on it.
    /// Yields frames until the kit dies, then closes.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.take()
    }

    /// Terminate the kit. A graceful close sends `exit` and gives the
    /// child a moment to quit; a rude close kills immediately.
    pub async fn close(&mut self, rude: bool) {
        if !rude && self.is_alive() && self.send_text("exit") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.alive.store(false, Ordering::Release);
        if let Some(child) = &self.child {
            let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = child.start_kill() {
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    tracing::warn!("Failed to kill kit [{}]: {}", self.pid, e);
                }
            }
        }
    }
}

/// Process-wide pool of prewarmed kit processes.
///
/// `supply` is called by the spawner task; brokers `acquire` with a
/// deadline. The available count steers the spawner's top-up loop.
#[derive(Debug)]
pub struct KitPool {
    supply_tx: mpsc::UnboundedSender<KitProcess>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<KitProcess>>,
    available: AtomicUsize,
}

impl KitPool {
    pub fn new() -> Self {
        let (supply_tx, queue) = mpsc::unbounded_channel();
        Self {
            supply_tx,
            queue: tokio::sync::Mutex::new(queue),
            available: AtomicUsize::new(0),
        }
    }

    /// Add a prewarmed kit to the pool.
    pub fn supply(&self, kit: KitProcess) {
        if self.supply_tx.send(kit).is_ok() {
            self.available.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Kits currently waiting to be borrowed.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Borrow a kit, waiting up to `deadline`. Dead kits in the queue are
    /// skipped. `None` when the deadline passes with nothing usable.
    pub async fn acquire(&self, deadline: Duration) -> Option<KitProcess> {
        let mut queue = self.queue.lock().await;
        let give_up = tokio::time::Instant::now() + deadline;

        loop {
            let remaining = give_up.checked_duration_since(tokio::time::Instant::now())?;
            match tokio::time::timeout(remaining, queue.recv()).await {
                Ok(Some(kit)) => {
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    if kit.is_alive() {
                        return Some(kit);
                    }
                    tracing::warn!("Discarding dead pooled kit [{}]", kit.pid());
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

impl Default for KitPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A kit backed by in-memory pipes; the returned ends imitate the
    /// child's side of the stream.
    pub(crate) fn test_kit(
        pid: u32,
    ) -> (
        KitProcess,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (server_reader, kit_writer) = tokio::io::duplex(1 << 20);
        let (kit_reader, server_writer) = tokio::io::duplex(1 << 20);
        let kit = KitProcess::new(pid, format!("jail-{}", pid), server_reader, server_writer);
        (kit, kit_reader, kit_writer)
    }

    #[tokio::test]
    async fn test_send_and_receive_frames() {
        let (mut kit, mut kit_reader, mut kit_writer) = test_kit(7);
        let mut inbound = kit.take_inbound().unwrap();

        assert!(kit.send_text("session 0001 /doc 001"));
        let frame = frame::read_frame(&mut kit_reader).await.unwrap().unwrap();
        assert_eq!(&frame[..], b"session 0001 /doc 001");

        frame::write_frame(&mut kit_writer, b"client-0001 status: ready")
            .await
            .unwrap();
        let received = inbound.recv().await.unwrap();
        assert_eq!(&received[..], b"client-0001 status: ready");
    }

    #[tokio::test]
    async fn test_inbound_closes_on_kit_death() {
        let (mut kit, kit_reader, kit_writer) = test_kit(8);
        let mut inbound = kit.take_inbound().unwrap();
        assert!(kit.is_alive());

        drop(kit_reader);
        drop(kit_writer);

        // The reader clears liveness before the channel closes, so by the
        // time the broker sees end-of-stream the probe already agrees.
        assert!(inbound.recv().await.is_none());
        assert!(!kit.is_alive());
    }

    #[tokio::test]
    async fn test_pool_acquire_and_timeout() {
        let pool = KitPool::new();
        assert!(pool.acquire(Duration::from_millis(10)).await.is_none());

        let (kit, _r, _w) = test_kit(9);
        pool.supply(kit);
        assert_eq!(pool.available(), 1);

        let kit = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(kit.pid(), 9);
        assert_eq!(pool.available(), 0);
    }
}
