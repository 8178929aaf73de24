/**
 * Tile Cache
 *
 * Content-addressed store of rendered PNG tiles for one document, plus the
 * render subscription machinery: while a render is in flight the cache holds
 * the subscriber list, so concurrent requests for an equivalent tile cost a
 * single kit render and every waiter gets the bytes when they arrive.
 *
 * Entries live on disk under the document's cache directory (one file per
 * tile, named by the descriptor key) so a persistent cache survives broker
 * restarts. A `modtime` stamp beside the tiles ties the cache to the
 * document revision it was rendered from; a stamp mismatch at open time
 * drops the whole cache.
 */

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::broker::session::{OutboundMessage, SessionSender};
use crate::protocol::{TileDesc, TileKey};

const MODTIME_FILE: &str = "modtime";

/// A session waiting on an in-flight render.
#[derive(Debug)]
pub struct TileSubscriber {
    pub session_id: String,
    pub sender: SessionSender,
}

#[derive(Debug, Default)]
struct PendingRender {
    /// Version of the render request actually issued to the kit. Later
    /// subscriptions coalesce without bumping it; only one render is ever
    /// in flight per entry.
    version: i32,
    subscribers: Vec<TileSubscriber>,
}

#[derive(Debug)]
pub struct TileCache {
    cache_dir: PathBuf,
    /// Keys with a tile file on disk
    entries: HashSet<TileKey>,
    /// Renders in flight, keyed like the disk entries
    pending: HashMap<TileKey, PendingRender>,
    unsaved_changes: bool,
}

impl TileCache {
    /// Open the cache directory for a document revision.
    ///
    /// `modified_time` is the storage-reported document mtime; when it does
    /// not match the stamp left by a previous run, stale tiles are removed.
    pub async fn open(
        modified_time: Option<DateTime<Utc>>,
        cache_dir: PathBuf,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&cache_dir).await?;

        let stamp_path = cache_dir.join(MODTIME_FILE);
        let stamp = match modified_time {
            Some(t) => t.timestamp().to_string(),
            None => String::new(),
        };

        let previous = tokio::fs::read_to_string(&stamp_path).await.unwrap_or_default();
        if previous != stamp {
            if !previous.is_empty() {
                tracing::info!(
                    "Document revision changed ({} -> {}), dropping cached tiles in [{}]",
                    previous,
                    stamp,
                    cache_dir.display()
                );
            }
            Self::clear_dir(&cache_dir).await?;
            tokio::fs::write(&stamp_path, &stamp).await?;
        }

        let mut entries = HashSet::new();
        let mut dir = tokio::fs::read_dir(&cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(key) = TileKey::from_cache_name(&entry.file_name().to_string_lossy()) {
                entries.insert(key);
            }
        }

        Ok(Self {
            cache_dir,
            entries,
            pending: HashMap::new(),
            unsaved_changes: false,
        })
    }

    async fn clear_dir(dir: &PathBuf) -> std::io::Result<()> {
        let mut listing = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }

    fn tile_path(&self, key: &TileKey) -> PathBuf {
        self.cache_dir.join(key.cache_name())
    }

    /// Cached bytes for a tile, or `None` when it needs rendering.
    pub async fn lookup(&mut self, desc: &TileDesc) -> Option<Bytes> {
        let key = desc.key();
        if !self.entries.contains(&key) {
            return None;
        }
        match tokio::fs::read(self.tile_path(&key)).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                tracing::warn!("Cached tile [{}] unreadable: {}", key.cache_name(), e);
                self.entries.remove(&key);
                None
            }
        }
    }

    /// Subscribe a session to the render of `desc`.
    ///
    /// Returns `true` when this is the first subscriber and the caller must
    /// forward a render request to the kit; later equivalent subscriptions
    /// coalesce onto the pending entry.
    pub fn subscribe(&mut self, desc: &TileDesc, subscriber: TileSubscriber) -> bool {
        let key = desc.key();
        match self.pending.get_mut(&key) {
            Some(pending) => {
                if pending
                    .subscribers
                    .iter()
                    .all(|s| s.session_id != subscriber.session_id)
                {
                    pending.subscribers.push(subscriber);
                }
                false
            }
            None => {
                self.pending.insert(
                    key,
                    PendingRender {
                        version: desc.ver,
                        subscribers: vec![subscriber],
                    },
                );
                true
            }
        }
    }

    /// Persist a rendered tile and notify its subscribers.
    ///
    /// A response older than the latest request for the same tile is
    /// discarded: the newer render is still on its way and will satisfy the
    /// remaining subscribers. Returns the number of sessions notified.
    pub async fn save_and_notify(&mut self, desc: &TileDesc, data: &[u8]) -> usize {
        let key = desc.key();

        if let Some(pending) = self.pending.get(&key) {
            if desc.ver >= 0 && desc.ver < pending.version {
                tracing::debug!(
                    "Dropping stale tile response ver={} (current ver={}) for [{}]",
                    desc.ver,
                    pending.version,
                    key.cache_name()
                );
                return 0;
            }
        }

        if let Err(e) = tokio::fs::write(self.tile_path(&key), data).await {
            tracing::error!("Failed to persist tile [{}]: {}", key.cache_name(), e);
        } else {
            self.entries.insert(key);
        }

        let Some(pending) = self.pending.remove(&key) else {
            return 0;
        };

        let mut response = desc.clone();
        response.img_size = 0;
        response.broadcast = false;
        let header = response.serialize("tile:");
        let mut frame = Vec::with_capacity(header.len() + 1 + data.len());
        frame.extend_from_slice(header.as_bytes());
        frame.push(b'\n');
        frame.extend_from_slice(data);
        let frame = Bytes::from(frame);

        let mut notified = 0;
        for subscriber in pending.subscribers {
            if subscriber
                .sender
                .send(OutboundMessage::Binary(frame.clone()))
                .is_ok()
            {
                notified += 1;
            }
        }
        notified
    }

    /// Remove cached entries matching an invalidation spec.
    ///
    /// The spec is the remainder of an `invalidatetiles:` message: `EMPTY`
    /// drops everything, otherwise `part=… x=… y=… width=… height=…`
    /// describes the dirtied rectangle. Pending renders stay; their stale
    /// responses are discarded by version when they land.
    pub async fn invalidate(&mut self, spec: &str) {
        let spec = spec.trim();
        let victims: Vec<TileKey> = if spec.starts_with("EMPTY") {
            self.entries.iter().copied().collect()
        } else {
            let part = crate::protocol::tokens::token_int(spec, "part").unwrap_or(-1) as i32;
            let x = crate::protocol::tokens::token_int(spec, "x").unwrap_or(0) as i32;
            let y = crate::protocol::tokens::token_int(spec, "y").unwrap_or(0) as i32;
            let w = crate::protocol::tokens::token_int(spec, "width").unwrap_or(-1) as i32;
            let h = crate::protocol::tokens::token_int(spec, "height").unwrap_or(-1) as i32;
            self.entries
                .iter()
                .copied()
                .filter(|k| k.intersects(part, x, y, w, h))
                .collect()
        };

        for key in victims {
            self.entries.remove(&key);
            let _ = tokio::fs::remove_file(self.tile_path(&key)).await;
        }
    }

    /// Drop a session from every subscriber list.
    ///
    /// Returns the `canceltiles` command for the kit when some renders are
    /// left with no subscriber at all, `None` when nothing needs cancelling.
    pub fn cancel_tiles(&mut self, session_id: &str) -> Option<String> {
        let mut orphaned = Vec::new();
        self.pending.retain(|key, pending| {
            pending.subscribers.retain(|s| s.session_id != session_id);
            if pending.subscribers.is_empty() {
                orphaned.push(format!("{},{},{}", key.part, key.tile_pos_x, key.tile_pos_y));
                false
            } else {
                true
            }
        });

        if orphaned.is_empty() {
            None
        } else {
            orphaned.sort();
            Some(format!("canceltiles {}", orphaned.join(" ")))
        }
    }

    /// Whether the document has edits not yet saved to storage.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved_changes
    }

    pub fn set_unsaved_changes(&mut self, value: bool) {
        self.unsaved_changes = value;
    }

    /// Stamp the cache with the document mtime it was rendered from.
    pub async fn save_last_modified(&self, modified_time: Option<DateTime<Utc>>) {
        let stamp = match modified_time {
            Some(t) => t.timestamp().to_string(),
            None => String::new(),
        };
        if let Err(e) = tokio::fs::write(self.cache_dir.join(MODTIME_FILE), stamp).await {
            tracing::warn!("Failed to stamp tile cache: {}", e);
        }
    }

    /// Remove every on-disk artifact of this document's cache.
    pub async fn complete_cleanup(&mut self) {
        self.entries.clear();
        self.pending.clear();
        if let Err(e) = tokio::fs::remove_dir_all(&self.cache_dir).await {
            tracing::warn!(
                "Failed to remove tile cache dir [{}]: {}",
                self.cache_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn desc(x: i32, ver: i32) -> TileDesc {
        TileDesc {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: x,
            tile_pos_y: 0,
            tile_width: 3840,
            tile_height: 3840,
            ver,
            img_size: 0,
            broadcast: false,
        }
    }

    fn subscriber(id: &str) -> (TileSubscriber, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TileSubscriber {
                session_id: id.to_string(),
                sender: tx,
            },
            rx,
        )
    }

    async fn open_cache() -> (TileCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::open(None, dir.path().join("doc")).await.unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn test_subscribe_coalesces() {
        let (mut cache, _dir) = open_cache().await;
        let (s1, mut rx1) = subscriber("a");
        let (s2, mut rx2) = subscriber("b");

        assert!(cache.subscribe(&desc(0, 1), s1));
        assert!(!cache.subscribe(&desc(0, 1), s2));

        let notified = cache.save_and_notify(&desc(0, 1), b"PNGDATA").await;
        assert_eq!(notified, 2);

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                OutboundMessage::Binary(frame) => {
                    let text = crate::protocol::tokens::first_line(&frame);
                    assert!(text.starts_with("tile: part=0"));
                    assert_eq!(crate::protocol::tokens::binary_tail(&frame), b"PNGDATA");
                }
                other => panic!("Expected binary frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_lookup_after_save() {
        let (mut cache, _dir) = open_cache().await;
        let (s1, _rx) = subscriber("a");
        cache.subscribe(&desc(0, 1), s1);
        cache.save_and_notify(&desc(0, 1), b"BYTES").await;

        let hit = cache.lookup(&desc(0, 99)).await;
        assert_eq!(hit.as_deref(), Some(&b"BYTES"[..]));
        assert!(cache.lookup(&desc(3840, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_response_dropped() {
        let (mut cache, _dir) = open_cache().await;
        let (s1, mut rx1) = subscriber("a");

        // The render in flight is ver=5; a late ver=1 response (from before
        // an invalidation) must not satisfy it.
        assert!(cache.subscribe(&desc(0, 5), s1));
        assert_eq!(cache.save_and_notify(&desc(0, 1), b"OLD").await, 0);
        assert!(rx1.try_recv().is_err());

        assert_eq!(cache.save_and_notify(&desc(0, 5), b"NEW").await, 1);
        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_coalesced_subscribers_all_notified() {
        let (mut cache, _dir) = open_cache().await;
        let (s1, mut rx1) = subscriber("a");
        let (s2, mut rx2) = subscriber("b");

        // S1's request issued the render at ver=1; S2 arrives later with a
        // newer version but coalesces onto the same render.
        assert!(cache.subscribe(&desc(0, 1), s1));
        assert!(!cache.subscribe(&desc(0, 2), s2));

        assert_eq!(cache.save_and_notify(&desc(0, 1), b"PNG").await, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_tiles() {
        let (mut cache, _dir) = open_cache().await;
        let (s1, _rx1) = subscriber("a");
        let (s2, _rx2) = subscriber("b");

        cache.subscribe(&desc(0, 1), s1);
        let (s1b, _rx1b) = subscriber("a");
        cache.subscribe(&desc(3840, 1), s1b);
        cache.subscribe(&desc(3840, 1), s2);

        let cancel = cache.cancel_tiles("a").unwrap();
        // The 3840 tile still has a subscriber, only the first is orphaned.
        assert_eq!(cancel, "canceltiles 0,0,0");
        assert!(cache.cancel_tiles("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_rectangle() {
        let (mut cache, _dir) = open_cache().await;
        for x in [0, 3840] {
            let (s, _rx) = subscriber("a");
            cache.subscribe(&desc(x, 1), s);
            cache.save_and_notify(&desc(x, 1), b"T").await;
        }

        cache.invalidate("part=0 x=0 y=0 width=3840 height=3840").await;
        assert!(cache.lookup(&desc(0, 1)).await.is_none());
        assert!(cache.lookup(&desc(3840, 1)).await.is_some());

        cache.invalidate("EMPTY").await;
        assert!(cache.lookup(&desc(3840, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_revision_change_drops_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc");
        let t1 = Some(Utc::now());

        let mut cache = TileCache::open(t1, path.clone()).await.unwrap();
        let (s, _rx) = subscriber("a");
        cache.subscribe(&desc(0, 1), s);
        cache.save_and_notify(&desc(0, 1), b"T").await;
        drop(cache);

        // Same revision: entry survives.
        let mut cache = TileCache::open(t1, path.clone()).await.unwrap();
        assert!(cache.lookup(&desc(0, 1)).await.is_some());
        drop(cache);

        // New revision: cache dropped.
        let t2 = Some(Utc::now() + chrono::Duration::seconds(90));
        let mut cache = TileCache::open(t2, path).await.unwrap();
        assert!(cache.lookup(&desc(0, 1)).await.is_none());
    }
}
