/**
 * Document Broker
 *
 * The per-document coordination engine. One broker owns one document: its
 * kit child process, its client sessions, its tile cache and its storage
 * binding. The broker runs as a single spawned task; everything else talks
 * to it through the event channel on its handle, so broker state is only
 * ever touched from the broker's own loop.
 *
 * Lifecycle: Starting (kit acquisition) -> Loading (first session triggers
 * the storage download) -> Active <-> Saving (autosave / explicit saves) ->
 * Draining (stop set) -> Terminated (kit closed, registry entry removed).
 */

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::broker::kit::KitProcess;
use crate::broker::registry::{BrokerRegistry, Services};
use crate::broker::session::ClientSession;
use crate::error::{DocError, StorageError};
use crate::protocol::{self, tokens, TileCombined, TileDesc};
use crate::storage::{SaveResult, SessionInfo, Storage};
use crate::tilecache::{TileCache, TileSubscriber};

/// How long a save may stay unanswered before it counts as failed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Loop tick; timers are evaluated at this cadence regardless of traffic.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Inactivity threshold for the non-forced autosave path.
const IDLE_SAVE: Duration = Duration::from_secs(30);

/// Time-since-last-save threshold for the non-forced autosave path.
const AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(300);

static NEXT_DOC_ID: AtomicU32 = AtomicU32::new(1);

/// Closure queued onto a broker's loop by another task.
pub type BrokerCallback = Box<dyn FnOnce(&mut DocumentBroker) + Send>;

/// Events a broker's loop consumes.
pub enum BrokerEvent {
    /// Admit a session; the reply carries the session count or the load error.
    AddSession {
        session: ClientSession,
        reply: oneshot::Sender<Result<usize, DocError>>,
    },
    /// Remove a session, optionally starting teardown if it was the last.
    RemoveSession {
        id: String,
        destroy_if_last: bool,
    },
    /// A text command from a client session.
    ClientCommand {
        id: String,
        command: String,
    },
    /// Run a closure on the broker task.
    Callback(BrokerCallback),
    /// Ask the loop to exit.
    Stop {
        reason: String,
    },
}

/// Shareable reference to a live broker. Cheap to clone; sending on a
/// handle whose broker has exited returns an error to the caller.
#[derive(Clone)]
pub struct BrokerHandle {
    doc_key: String,
    doc_id: String,
    tx: mpsc::UnboundedSender<BrokerEvent>,
    marked_to_destroy: Arc<AtomicBool>,
}

impl BrokerHandle {
    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Whether the broker task is still draining its channel.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether the broker is tearing down and refuses new sessions.
    pub fn is_marked_to_destroy(&self) -> bool {
        self.marked_to_destroy.load(Ordering::Acquire)
    }

    /// Admit a session and wait for the load outcome.
    pub async fn add_session(&self, session: ClientSession) -> Result<usize, DocError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerEvent::AddSession { session, reply })
            .map_err(|_| DocError::BrokerGone)?;
        rx.await.map_err(|_| DocError::BrokerGone)?
    }

    pub fn remove_session(&self, id: &str, destroy_if_last: bool) {
        let _ = self.tx.send(BrokerEvent::RemoveSession {
            id: id.to_string(),
            destroy_if_last,
        });
    }

    pub fn client_command(&self, id: &str, command: impl Into<String>) {
        let _ = self.tx.send(BrokerEvent::ClientCommand {
            id: id.to_string(),
            command: command.into(),
        });
    }

    /// Queue a closure onto the broker loop. The only way code outside the
    /// loop may touch broker state.
    pub fn queue_callback(&self, callback: BrokerCallback) {
        let _ = self.tx.send(BrokerEvent::Callback(callback));
    }

    pub fn stop(&self, reason: &str) {
        let _ = self.tx.send(BrokerEvent::Stop {
            reason: reason.to_string(),
        });
    }
}

pub struct DocumentBroker {
    doc_key: String,
    doc_id: String,
    uri_public: Url,
    uri_jailed: Option<String>,
    filename: String,
    jail_id: String,

    services: Services,
    registry: Arc<BrokerRegistry>,

    child: Option<KitProcess>,
    storage: Option<Storage>,
    tile_cache: Option<TileCache>,
    sessions: HashMap<String, ClientSession>,

    rx: mpsc::UnboundedReceiver<BrokerEvent>,

    task_start: Instant,
    last_save_time: Instant,
    /// `Some` while a save is in flight
    save_requested_at: Option<Instant>,
    last_autosave_check: Instant,
    last_activity_time: Instant,
    /// Jailed file mtime at last persist; `None` forces the next upload
    last_file_modified: Option<SystemTime>,
    /// Storage-reported document mtime
    document_last_modified: Option<chrono::DateTime<chrono::Utc>>,
    load_duration: Option<Duration>,

    is_loaded: bool,
    is_modified: bool,
    marked_to_destroy: bool,
    marked_flag: Arc<AtomicBool>,
    last_editable_session: bool,
    stop: bool,
    close_reason: String,
    /// Latched when storage reports an mtime we did not write; uploads are
    /// refused from then on rather than overwriting the foreign revision.
    storage_conflict: bool,

    tile_version: i32,
    rendered_tile_count: u64,
    cursor: (i32, i32, i32, i32),
}

impl DocumentBroker {
    /// Construct a broker for `uri` and spawn its loop task.
    pub fn start(
        uri_public: Url,
        doc_key: String,
        services: Services,
        registry: Arc<BrokerRegistry>,
    ) -> BrokerHandle {
        let doc_id = format!("{:03x}", NEXT_DOC_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let marked_flag = Arc::new(AtomicBool::new(false));

        let handle = BrokerHandle {
            doc_key: doc_key.clone(),
            doc_id: doc_id.clone(),
            tx,
            marked_to_destroy: marked_flag.clone(),
        };

        let now = Instant::now();
        let broker = DocumentBroker {
            doc_key: doc_key.clone(),
            doc_id,
            uri_public,
            uri_jailed: None,
            filename: String::new(),
            jail_id: String::new(),
            services,
            registry,
            child: None,
            storage: None,
            tile_cache: None,
            sessions: HashMap::new(),
            rx,
            task_start: now,
            last_save_time: now,
            save_requested_at: None,
            last_autosave_check: now,
            last_activity_time: now,
            last_file_modified: None,
            document_last_modified: None,
            load_duration: None,
            is_loaded: false,
            is_modified: false,
            marked_to_destroy: false,
            marked_flag,
            last_editable_session: false,
            stop: false,
            close_reason: "stopped".to_string(),
            storage_conflict: false,
            tile_version: 0,
            rendered_tile_count: 0,
            cursor: (0, 0, 0, 0),
        };

        tracing::info!(
            "DocumentBroker [{}] created with docKey [{}]",
            broker.uri_public,
            doc_key
        );

        tokio::spawn(broker.run());
        handle
    }

    /// The broker loop: acquire a kit, then weave socket traffic, queued
    /// events and periodic timers until stop, then drain and unregister.
    async fn run(mut self) {
        tracing::info!("Starting broker loop for docKey [{}]", self.doc_key);

        let Some(mut kit_rx) = self.acquire_kit().await else {
            self.fail_pending_sessions();
            self.registry.remove(&self.doc_key).await;
            tracing::info!("Finished broker loop for docKey [{}] (no kit)", self.doc_key);
            return;
        };

        let mut kit_open = true;
        let mut ticker = tokio::time::interval(self.services.config.poll_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.stop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        // Registry holds a handle until removal, so this is
                        // only reachable in teardown races.
                        self.close_reason = "abandoned".to_string();
                        self.stop = true;
                    }
                },
                frame = kit_rx.recv(), if kit_open => match frame {
                    Some(payload) => self.handle_kit_message(&payload).await,
                    None => {
                        kit_open = false;
                        self.child_socket_terminated().await;
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        tracing::info!(
            "Finished polling doc [{}]. closeReason: {}",
            self.doc_key,
            self.close_reason
        );

        // Give session glue tasks a moment to flush their outbound queues.
        tokio::time::sleep(self.services.config.poll_timeout * 2).await;

        let reason = self.close_reason.clone();
        self.terminate_child(&reason, false).await;

        self.registry.remove(&self.doc_key).await;
        self.services.telemetry.remove_doc(&self.doc_key);

        if let Some(cache) = &mut self.tile_cache {
            if !self.services.config.tile_cache_persistent {
                cache.complete_cleanup().await;
            }
        }

        tracing::info!("Finished broker loop for docKey [{}]", self.doc_key);
    }

    /// Borrow a kit from the pool, retrying with a short backoff. Gives up
    /// after five command timeouts.
    async fn acquire_kit(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        let deadline = self.services.config.command_timeout * 5;
        let poll = self.services.config.poll_timeout;

        while !self.stop && self.task_start.elapsed() < deadline {
            match self.services.kit_pool.acquire(poll).await {
                Some(mut kit) => {
                    self.jail_id = kit.jail_id().to_string();
                    let inbound = kit.take_inbound();
                    tracing::info!(
                        "Doc [{}] attached to child [{}]",
                        self.doc_key,
                        kit.pid()
                    );
                    self.services
                        .telemetry
                        .upsert(&self.doc_key, |stats| stats.pid = kit.pid());
                    self.child = Some(kit);
                    return inbound;
                }
                None => {
                    tokio::time::sleep(poll / 5).await;
                }
            }
        }

        tracing::error!("Failed to get new child for docKey [{}]", self.doc_key);
        None
    }

    /// Answer queued admission requests after kit acquisition failed.
    fn fail_pending_sessions(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            if let BrokerEvent::AddSession { reply, .. } = event {
                let _ = reply.send(Err(DocError::KitUnavailable));
            }
        }
    }

    async fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::AddSession { session, reply } => {
                let result = self.add_session(session).await;
                let _ = reply.send(result);
            }
            BrokerEvent::RemoveSession { id, destroy_if_last } => {
                self.remove_session(&id, destroy_if_last).await;
            }
            BrokerEvent::ClientCommand { id, command } => {
                self.handle_client_command(&id, &command).await;
            }
            BrokerEvent::Callback(callback) => callback(self),
            BrokerEvent::Stop { reason } => {
                self.close_reason = reason;
                self.stop = true;
            }
        }
    }

    /// Periodic duties: the save-in-progress gate, the forced autosave tick
    /// and idle teardown, in that order.
    async fn on_tick(&mut self) {
        if let Some(requested) = self.save_requested_at {
            if requested.elapsed() <= self.services.config.command_timeout {
                // A save is in flight; wait for it before anything drastic.
                return;
            }
            tracing::warn!(
                "Save on docKey [{}] timed out after {:?}; treating as failed",
                self.doc_key,
                requested.elapsed()
            );
            self.save_requested_at = None;
            self.last_save_time = Instant::now();
        }

        if self.last_autosave_check.elapsed() >= self.services.config.autosave_interval {
            tracing::trace!("Triggering an autosave for [{}]", self.doc_key);
            self.autosave(true).await;
            self.last_autosave_check = Instant::now();
        }

        let idle = self.last_activity_time.elapsed() >= self.services.config.idle_timeout;
        if (self.is_loaded || self.marked_to_destroy) && (self.sessions.is_empty() || idle) {
            tracing::info!(
                "Terminating {} DocumentBroker for docKey [{}]",
                if idle { "idle" } else { "dead" },
                self.doc_key
            );
            self.close_reason = if idle { "idle" } else { "dead" }.to_string();
            self.stop = true;
        }
    }

    // ---- session admission ---------------------------------------------

    async fn add_session(&mut self, mut session: ClientSession) -> Result<usize, DocError> {
        let id = session.id().to_string();

        if let Err(e) = self.load(&mut session).await {
            tracing::error!(
                "Failed to add session [{}] to [{}]: {}",
                id,
                self.doc_key,
                e
            );
            if is_disk_full(&e) {
                // Same alert as for the server's own partitions; it only
                // goes to this document's sessions.
                self.alert_all_sessions("error: cmd=internal kind=diskfull");
            }
            if self.sessions.is_empty() {
                tracing::info!(
                    "Doc [{}] has no more sessions. Marking to destroy.",
                    self.doc_key
                );
                self.set_marked_to_destroy(true);
            }
            return Err(e);
        }

        // Admitting a session revives a cooling broker.
        self.last_editable_session = false;
        self.set_marked_to_destroy(false);
        self.stop = false;

        if let Some(kit) = &self.child {
            kit.send_text(format!("session {} {} {}", id, self.doc_key, self.doc_id));
        }

        session.set_attached();
        let read_only = session.is_read_only();
        self.sessions.insert(id.clone(), session);
        let count = self.sessions.len();

        self.services.telemetry.upsert(&self.doc_key, |stats| {
            stats.session_count = count;
            stats.filename = self.filename.clone();
        });

        tracing::debug!(
            "Added {} session [{}] to docKey [{}] to have {} sessions",
            if read_only { "readonly" } else { "non-readonly" },
            id,
            self.doc_key,
            count
        );
        Ok(count)
    }

    async fn remove_session(&mut self, id: &str, destroy_if_last: bool) -> usize {
        if destroy_if_last {
            self.destroy_if_last_editor(id);
        }

        tracing::info!(
            "Removing session [{}] on docKey [{}]. Have {} sessions. markToDestroy: {}, lastEditableSession: {}",
            id,
            self.doc_key,
            self.sessions.len(),
            self.marked_to_destroy,
            self.last_editable_session
        );

        // When the last editor leaves, force a save first; the save
        // completion path re-enters removal.
        if !self.last_editable_session || !self.autosave(true).await {
            return self.remove_session_internal(id).await;
        }
        self.sessions.len()
    }

    async fn remove_session_internal(&mut self, id: &str) -> usize {
        match self.sessions.remove(id) {
            Some(session) => {
                let count = self.sessions.len();
                tracing::debug!(
                    "Removed {} session [{}] from docKey [{}] to have {} sessions",
                    if session.is_read_only() { "readonly" } else { "non-readonly" },
                    id,
                    self.doc_key,
                    count
                );
                if let Some(kit) = &self.child {
                    kit.send_text(format!("child-{} disconnect", id));
                }
                self.services
                    .telemetry
                    .upsert(&self.doc_key, |stats| stats.session_count = count);
                count
            }
            None => {
                tracing::debug!(
                    "Session [{}] not found to remove from docKey [{}]",
                    id,
                    self.doc_key
                );
                self.sessions.len()
            }
        }
    }

    /// Decide whether `id` is the last editor and whether its departure
    /// empties the broker.
    fn destroy_if_last_editor(&mut self, id: &str) {
        let Some(current) = self.sessions.get(id) else {
            // A socket can disconnect before its session was ever added.
            return;
        };

        let mut last_editable = !current.is_read_only();
        if last_editable {
            let another_editor = self.sessions.values().any(|s| {
                s.id() != id && s.is_view_loaded() && !s.is_read_only()
            });
            if another_editor {
                last_editable = false;
            }
        }

        self.last_editable_session = last_editable;
        let marked = self.sessions.len() <= 1;
        self.set_marked_to_destroy(marked);
        tracing::debug!(
            "startDestroy on session [{}] on docKey [{}], sessions: {}, markToDestroy: {}, lastEditableSession: {}",
            id,
            self.doc_key,
            self.sessions.len(),
            marked,
            last_editable
        );
    }

    fn set_marked_to_destroy(&mut self, value: bool) {
        self.marked_to_destroy = value;
        self.marked_flag.store(value, Ordering::Release);
    }

    // ---- load -----------------------------------------------------------

    /// Load the document for `session`. The download happens once per
    /// broker; file-info (and the token check) run for every session so
    /// each client's own credentials are validated.
    async fn load(&mut self, session: &mut ClientSession) -> Result<(), DocError> {
        let session_id = session.id().to_string();
        tracing::info!(
            "Loading [{}] for session [{}] in jail [{}]",
            self.doc_key,
            session_id,
            self.jail_id
        );

        if self.marked_to_destroy {
            tracing::warn!(
                "Will not load document marked to destroy. DocKey: [{}]",
                self.doc_key
            );
            return Err(DocError::MarkedToDestroy);
        }

        let first_instance = self.storage.is_none();
        if first_instance {
            let jail_root = self.services.config.child_root.join(&self.jail_id);
            let jail_rel = Path::new("user/doc").join(&self.jail_id);
            self.storage = Some(Storage::create(session.public_uri(), &jail_root, &jail_rel)?);
        }

        let is_wopi = matches!(self.storage, Some(Storage::Wopi(_)));
        let token = session.access_token();

        if is_wopi {
            self.check_token_ledger(session).await?;
        }

        let storage = self.storage.as_mut().ok_or_else(|| {
            DocError::load_failed("storage binding missing after creation")
        })?;

        let info = storage.fetch_info(token.as_deref()).await.map_err(DocError::from)?;
        session.apply_session_info(&info);

        let file_info = storage.file_info().clone();
        if !file_info.is_valid() {
            tracing::error!("Invalid fileinfo for URI [{}]", session.public_uri());
            return Err(DocError::load_failed(format!(
                "invalid file info for [{}]",
                self.doc_key
            )));
        }

        if is_wopi {
            self.send_wopi_info(session, &info, &file_info.filename);
            if !session.user_id().is_empty() && session.user_id() == file_info.owner_id {
                tracing::debug!("Session [{}] is the document owner", session_id);
                session.set_document_owner(true);
            }
        }

        if first_instance {
            self.document_last_modified = file_info.modified_time;
            tracing::debug!(
                "Document timestamp: {:?}",
                self.document_last_modified
            );
        } else if let (Some(ours), Some(theirs)) =
            (self.document_last_modified, file_info.modified_time)
        {
            if ours != theirs {
                tracing::error!(
                    "Document [{}] has been modified behind our back; refusing further uploads",
                    self.doc_key
                );
                self.storage_conflict = true;
            }
        }

        let storage = self.storage.as_mut().ok_or_else(|| {
            DocError::load_failed("storage binding missing after creation")
        })?;
        if !storage.is_downloaded() {
            let local_path = storage.download(token.as_deref()).await.map_err(DocError::from)?;

            match tokio::fs::read(&local_path).await {
                Ok(contents) => tracing::info!(
                    "SHA1 for DocKey [{}] of [{}]: {}",
                    self.doc_key,
                    local_path.display(),
                    protocol::uri::sha1_hex(&contents)
                ),
                Err(e) => tracing::warn!(
                    "Cannot digest downloaded file [{}]: {}",
                    local_path.display(),
                    e
                ),
            }

            self.filename = file_info.filename.clone();
            self.uri_jailed = Some(format!(
                "file://{}",
                protocol::uri::encode_jailed_path(&local_path.to_string_lossy())
            ));
            self.last_file_modified = tokio::fs::metadata(&local_path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());

            let cache_dir = protocol::uri::cache_path(
                &self.services.config.cache_root,
                &storage.uri_string(),
            );
            let cache = TileCache::open(self.document_last_modified, cache_dir)
                .await
                .map_err(|e| DocError::load_failed(format!("tile cache: {}", e)))?;
            self.tile_cache = Some(cache);
        }

        if is_wopi {
            let storage = self.storage.as_ref().ok_or_else(|| {
                DocError::load_failed("storage binding missing after creation")
            })?;
            let total = storage.load_duration() + info.call_duration;
            session.send_text(format!("stats: wopiloadduration {}", total.as_secs_f64()));
        }

        Ok(())
    }

    /// Refuse replayed WOPI access tokens via the persistent ledger.
    async fn check_token_ledger(&self, session: &ClientSession) -> Result<(), DocError> {
        let Some(ledger) = &self.services.token_ledger else {
            return Ok(());
        };
        if session.has_doc_pass() {
            return Ok(());
        }
        let token = session
            .access_token()
            .ok_or_else(|| StorageError::unauthorized("no access token in URI"))?;
        let fresh = ledger
            .first_use(&token)
            .await
            .map_err(StorageError::from)?;
        if !fresh {
            return Err(StorageError::unauthorized("access token already used").into());
        }
        Ok(())
    }

    /// Send the `wopi:` info frame. Sent immediately, not queued behind
    /// other traffic, so the client can reach its parent frame even when
    /// the load subsequently fails.
    fn send_wopi_info(&self, session: &ClientSession, info: &SessionInfo, filename: &str) {
        let mut origin = info.post_message_origin.clone();
        if let Some(o) = &mut origin {
            let tls = self.services.config.ssl_enabled || self.services.config.ssl_termination;
            if tls && o.starts_with("http://") {
                o.replace_range(0..4, "https");
                tracing::debug!("Updated PostMessageOrigin scheme to HTTPS: [{}]", o);
            }
        }

        let mut wopi_info = serde_json::Map::new();
        if let Some(o) = origin {
            wopi_info.insert("PostMessageOrigin".to_string(), o.into());
        }
        wopi_info.insert("HidePrintOption".to_string(), info.hide_print_option.into());
        wopi_info.insert("HideSaveOption".to_string(), info.hide_save_option.into());
        wopi_info.insert("HideExportOption".to_string(), info.hide_export_option.into());
        wopi_info.insert("DisablePrint".to_string(), info.disable_print.into());
        wopi_info.insert("DisableExport".to_string(), info.disable_export.into());
        wopi_info.insert("DisableCopy".to_string(), info.disable_copy.into());
        wopi_info.insert("title".to_string(), filename.into());

        session.send_text(format!(
            "wopi: {}",
            serde_json::Value::Object(wopi_info)
        ));
    }

    /// Record that the kit acknowledged the document load.
    fn set_loaded(&mut self) {
        if !self.is_loaded {
            self.is_loaded = true;
            let elapsed = self.task_start.elapsed();
            self.load_duration = Some(elapsed);
            self.services.telemetry.upsert(&self.doc_key, |stats| {
                stats.loaded = true;
                stats.load_duration_ms = Some(elapsed.as_millis() as u64);
            });
            tracing::debug!("Document [{}] loaded in {:?}", self.doc_key, elapsed);
        }
    }

    // ---- autosave and storage ------------------------------------------

    /// Maybe send a save command to the kit. Returns whether one was sent.
    async fn autosave(&mut self, force: bool) -> bool {
        let child_alive = self.child.as_ref().map(|k| k.is_alive()).unwrap_or(false);
        if self.sessions.is_empty()
            || self.storage.is_none()
            || !self.is_loaded
            || !child_alive
            || (!self.is_modified && !force)
        {
            tracing::trace!("Nothing to autosave [{}]", self.doc_key);
            return false;
        }

        // Attribute the save to a document owner when one is present,
        // otherwise any session will do.
        let mut saving_session = String::new();
        for session in self.sessions.values() {
            if saving_session.is_empty() {
                saving_session = session.id().to_string();
            }
            if session.is_document_owner() {
                saving_session = session.id().to_string();
                break;
            }
        }

        if force {
            tracing::trace!("Sending forced save command for [{}]", self.doc_key);
            return self.send_uno_save(&saving_session, true, true);
        }

        if self.is_modified {
            let inactivity = self.last_activity_time.elapsed();
            let since_last_save = self.last_save_time.elapsed();
            if inactivity >= IDLE_SAVE || since_last_save >= AUTO_SAVE_INTERVAL {
                tracing::trace!("Sending timed save command for [{}]", self.doc_key);
                return self.send_uno_save(&saving_session, true, true);
            }
        }

        false
    }

    /// Forward `uno .uno:Save` through the given session and stamp the
    /// request time.
    fn send_uno_save(
        &mut self,
        session_id: &str,
        dont_terminate_edit: bool,
        dont_save_if_unmodified: bool,
    ) -> bool {
        if !self.sessions.contains_key(session_id) {
            tracing::error!("Failed to save doc [{}]: no valid sessions", self.doc_key);
            return false;
        }

        tracing::info!("Saving doc [{}]", self.doc_key);

        // Invalidate the jailed-file timestamp so the coming persist is
        // never skipped as a no-op.
        self.last_file_modified = None;

        let mut args = serde_json::Map::new();
        if dont_terminate_edit {
            args.insert(
                "DontTerminateEdit".to_string(),
                serde_json::json!({ "type": "boolean", "value": true }),
            );
        }
        if dont_save_if_unmodified {
            args.insert(
                "DontSaveIfUnmodified".to_string(),
                serde_json::json!({ "type": "boolean", "value": true }),
            );
        }

        let command = format!("uno .uno:Save {}", serde_json::Value::Object(args));
        self.forward_to_child(session_id, &command);
        self.save_requested_at = Some(Instant::now());
        true
    }

    /// Kit reported save completion; persist to storage and finish any
    /// deferred teardown.
    async fn save_to_storage(&mut self, session_id: &str, success: bool, result: &str) -> bool {
        let res = self.save_to_storage_internal(session_id, success, result).await;

        let closing = self
            .sessions
            .get(session_id)
            .map(|s| s.is_close_frame())
            .unwrap_or(false);
        if self.marked_to_destroy || closing {
            self.remove_session_internal(session_id).await;
        }

        if self.marked_to_destroy || self.sessions.is_empty() {
            self.close_reason = "dead".to_string();
            self.stop = true;
        }

        res
    }

    async fn save_to_storage_internal(
        &mut self,
        session_id: &str,
        success: bool,
        result: &str,
    ) -> bool {
        tracing::debug!(
            "Saving to storage docKey [{}] for session [{}]. Success: {}, result: {}",
            self.doc_key,
            session_id,
            success,
            result
        );

        if !success && result == "unmodified" {
            tracing::debug!("Save skipped as document [{}] was not modified", self.doc_key);
            self.last_save_time = Instant::now();
            self.save_requested_at = None;
            return true;
        }

        let Some(session) = self.sessions.get(session_id) else {
            tracing::error!(
                "Session [{}] not found while saving docKey [{}]",
                session_id,
                self.doc_key
            );
            return false;
        };
        let token = session.access_token();
        let uri = session.public_uri().to_string();

        let root_path = self
            .storage
            .as_ref()
            .and_then(|s| s.root_file_path())
            .map(|p| p.to_path_buf());
        let new_file_modified = match &root_path {
            Some(path) => tokio::fs::metadata(path).await.ok().and_then(|m| m.modified().ok()),
            None => None,
        };

        // Not the last editor and the kit wrote nothing new: skip the
        // upload entirely.
        if !self.last_editable_session
            && new_file_modified.is_some()
            && new_file_modified == self.last_file_modified
        {
            tracing::debug!(
                "Skipping unnecessary saving to URI [{}] with docKey [{}]",
                uri,
                self.doc_key
            );
            self.last_save_time = Instant::now();
            self.save_requested_at = None;
            return true;
        }

        if self.storage_conflict {
            tracing::error!(
                "Refusing to upload docKey [{}]: storage was modified behind our back",
                self.doc_key
            );
            if let Some(session) = self.sessions.get(session_id) {
                session.send_text("error: cmd=storage kind=savefailed");
            }
            return false;
        }

        tracing::debug!("Persisting [{}] to URI [{}]", self.doc_key, uri);
        let timestamp = self.document_last_modified;
        let outcome = match self.storage.as_mut() {
            Some(storage) => storage.upload(token.as_deref(), timestamp).await,
            None => {
                tracing::error!("No storage to save docKey [{}]", self.doc_key);
                return false;
            }
        };

        match outcome {
            SaveResult::Ok => {
                self.is_modified = false;
                if let Some(cache) = &mut self.tile_cache {
                    cache.set_unsaved_changes(false);
                }
                self.last_file_modified = new_file_modified;
                self.last_save_time = Instant::now();
                self.save_requested_at = None;
                self.services
                    .telemetry
                    .upsert(&self.doc_key, |stats| stats.modified = false);

                // Re-fetch file info for the timestamp the storage actually
                // persisted; that is the revision the tile cache now shows.
                if let Some(storage) = self.storage.as_mut() {
                    if storage.fetch_info(token.as_deref()).await.is_ok() {
                        self.document_last_modified = storage.file_info().modified_time;
                    }
                }
                if let Some(cache) = &self.tile_cache {
                    cache.save_last_modified(self.document_last_modified).await;
                }

                tracing::debug!(
                    "Saved docKey [{}] to URI [{}]; storage timestamp {:?}",
                    self.doc_key,
                    uri,
                    self.document_last_modified
                );
                true
            }
            SaveResult::DiskFull => {
                tracing::warn!(
                    "Disk full while saving docKey [{}] to URI [{}]. Making all sessions read-only",
                    self.doc_key,
                    uri
                );
                for session in self.sessions.values_mut() {
                    session.set_read_only();
                    session.send_text("error: cmd=storage kind=savediskfull");
                }
                false
            }
            SaveResult::Unauthorized => {
                tracing::error!(
                    "Cannot save docKey [{}]: invalid or expired access token",
                    self.doc_key
                );
                if let Some(session) = self.sessions.get(session_id) {
                    session.send_text("error: cmd=storage kind=saveunauthorized");
                }
                false
            }
            SaveResult::Failed => {
                tracing::error!("Failed to save docKey [{}] to URI [{}]", self.doc_key, uri);
                if let Some(session) = self.sessions.get(session_id) {
                    session.send_text("error: cmd=storage kind=savefailed");
                }
                false
            }
        }
    }

    /// Couple the modified flag with the tile cache's unsaved-changes latch.
    fn set_modified(&mut self, value: bool) {
        self.is_modified = value;
        if let Some(cache) = &mut self.tile_cache {
            cache.set_unsaved_changes(value);
        }
        self.services
            .telemetry
            .upsert(&self.doc_key, |stats| stats.modified = value);
    }

    // ---- client commands -----------------------------------------------

    async fn handle_client_command(&mut self, session_id: &str, command: &str) {
        self.update_last_activity();

        match tokens::first_token(command) {
            "tile" => match TileDesc::parse(command) {
                Ok(desc) => self.handle_tile_request(desc, session_id).await,
                Err(e) => tracing::warn!("Bad tile request from [{}]: {}", session_id, e),
            },
            "tilecombine" => match TileCombined::parse(command) {
                Ok(combined) => self.handle_tile_combined_request(combined, session_id).await,
                Err(e) => tracing::warn!("Bad tilecombine request from [{}]: {}", session_id, e),
            },
            "canceltiles" => self.cancel_tile_requests(session_id),
            "save" => {
                let dont_terminate_edit =
                    tokens::token_int(command, "dontTerminateEdit").unwrap_or(1) != 0;
                let dont_save_if_unmodified =
                    tokens::token_int(command, "dontSaveIfUnmodified").unwrap_or(1) != 0;
                self.send_uno_save(session_id, dont_terminate_edit, dont_save_if_unmodified);
            }
            "setmodified" => {
                let value = match tokens::tokenize(command).get(1).copied() {
                    Some("true") => true,
                    Some("false") => false,
                    _ => !self.is_modified,
                };
                self.set_modified(value);
            }
            _ => {
                self.forward_to_child(session_id, command);
            }
        }
    }

    /// Prefix a client command with `child-<id>` and pass it to the kit.
    /// `load` commands get the jailed URI appended so the kit can open the
    /// staged file.
    fn forward_to_child(&mut self, session_id: &str, message: &str) -> bool {
        if !self.sessions.contains_key(session_id) {
            tracing::warn!(
                "Child session [{}] not found to forward message: {}",
                session_id,
                message
            );
            return false;
        }

        let mut msg = format!("child-{} {}", session_id, message);
        let parts = tokens::tokenize(&msg);
        if parts.len() > 2 && parts[1] == "load" {
            let jailed = self.uri_jailed.clone().unwrap_or_default();
            let mut rewritten = format!("{} {} {}", parts[0], parts[1], parts[2]);
            rewritten.push_str(&format!(" jail={}", jailed));
            for part in &parts[3..] {
                rewritten.push(' ');
                rewritten.push_str(part);
            }
            msg = rewritten;
        }

        tracing::trace!("Forwarding payload to child: {}", tokens::abbr(msg.as_bytes()));
        match &self.child {
            Some(kit) => kit.send_text(msg),
            None => false,
        }
    }

    /// The WebSocket glue saw the client's close frame; a save confirmation
    /// may still be keeping this session in the map.
    pub fn mark_session_close_frame(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.mark_close_frame();
        }
    }

    fn update_last_activity(&mut self) {
        self.last_activity_time = Instant::now();
        self.services.telemetry.touch(&self.doc_key);
    }

    // ---- tiles ----------------------------------------------------------

    async fn handle_tile_request(&mut self, mut tile: TileDesc, session_id: &str) {
        self.tile_version += 1;
        tile.ver = self.tile_version;
        tracing::trace!("Tile request for {}", tile.serialize("tile"));

        let Some(cache) = self.tile_cache.as_mut() else {
            tracing::warn!("Tile request before load on [{}]", self.doc_key);
            return;
        };

        if let Some(data) = cache.lookup(&tile).await {
            if let Some(session) = self.sessions.get(session_id) {
                let header = tile.serialize("tile:");
                let mut frame = Vec::with_capacity(header.len() + 1 + data.len());
                frame.extend_from_slice(header.as_bytes());
                frame.push(b'\n');
                frame.extend_from_slice(&data);
                session.send_binary(Bytes::from(frame));
            }
            return;
        }

        let mut needs_render = false;
        if tile.broadcast {
            for session in self.sessions.values() {
                needs_render |= cache.subscribe(
                    &tile,
                    TileSubscriber {
                        session_id: session.id().to_string(),
                        sender: session.sender(),
                    },
                );
            }
        } else if let Some(session) = self.sessions.get(session_id) {
            needs_render = cache.subscribe(
                &tile,
                TileSubscriber {
                    session_id: session_id.to_string(),
                    sender: session.sender(),
                },
            );
        } else {
            return;
        }

        if needs_render {
            tracing::debug!(
                "Sending render request for tile ({},{},{})",
                tile.part,
                tile.tile_pos_x,
                tile.tile_pos_y
            );
            self.rendered_tile_count += 1;
            if let Some(kit) = &self.child {
                kit.send_text(tile.serialize("tile"));
            }
        }
    }

    async fn handle_tile_combined_request(&mut self, combined: TileCombined, session_id: &str) {
        tracing::trace!("TileCombined request for {}", combined.serialize("tilecombine"));

        if self.tile_cache.is_none() || !self.sessions.contains_key(session_id) {
            return;
        }

        let mut residual: Vec<TileDesc> = Vec::new();
        for mut tile in combined.tiles() {
            // Satisfy as many tiles from the cache as possible.
            let cached = match self.tile_cache.as_mut() {
                Some(cache) => cache.lookup(&tile).await,
                None => None,
            };
            match cached {
                Some(data) => {
                    if let Some(session) = self.sessions.get(session_id) {
                        let header = tile.serialize("tile:");
                        let mut frame = Vec::with_capacity(header.len() + 1 + data.len());
                        frame.extend_from_slice(header.as_bytes());
                        frame.push(b'\n');
                        frame.extend_from_slice(&data);
                        session.send_binary(Bytes::from(frame));
                    }
                }
                None => {
                    self.tile_version += 1;
                    tile.ver = self.tile_version;
                    let sender = match self.sessions.get(session_id) {
                        Some(session) => session.sender(),
                        None => return,
                    };
                    let needs_render = self.tile_cache.as_mut().map(|cache| {
                        cache.subscribe(
                            &tile,
                            TileSubscriber {
                                session_id: session_id.to_string(),
                                sender,
                            },
                        )
                    });
                    if needs_render.unwrap_or(false) {
                        self.rendered_tile_count += 1;
                        residual.push(tile);
                    }
                }
            }
        }

        if let Some(request) = TileCombined::from_tiles(&residual) {
            let req = request.serialize("tilecombine");
            tracing::debug!("Sending residual tilecombine: {}", req);
            if let Some(kit) = &self.child {
                kit.send_text(req);
            }
        }
    }

    fn cancel_tile_requests(&mut self, session_id: &str) {
        let cancel = self
            .tile_cache
            .as_mut()
            .and_then(|cache| cache.cancel_tiles(session_id));
        if let Some(message) = cancel {
            tracing::debug!("Forwarding canceltiles request: {}", message);
            if let Some(kit) = &self.child {
                kit.send_text(message);
            }
        }
    }

    async fn handle_tile_response(&mut self, payload: &[u8]) {
        let first_line = tokens::first_line(payload);
        tracing::trace!("Handling tile: {}", first_line);

        let data = tokens::binary_tail(payload);
        if data.is_empty() {
            // They will get re-issued if we do not forget them.
            tracing::warn!("Dropping empty tile response: {}", first_line);
            return;
        }

        match TileDesc::parse(first_line) {
            Ok(tile) => {
                if let Some(cache) = self.tile_cache.as_mut() {
                    cache.save_and_notify(&tile, data).await;
                }
            }
            Err(e) => tracing::error!("Failed to process tile response [{}]: {}", first_line, e),
        }
    }

    async fn handle_tile_combined_response(&mut self, payload: &[u8]) {
        let first_line = tokens::first_line(payload);
        tracing::trace!("Handling tile combined: {}", first_line);

        let data = tokens::binary_tail(payload);
        if data.is_empty() {
            tracing::warn!("Dropping empty tilecombine response: {}", first_line);
            return;
        }

        match TileCombined::parse(first_line) {
            Ok(combined) => {
                let mut offset = 0usize;
                for tile in combined.tiles() {
                    let size = tile.img_size;
                    if size == 0 || offset + size > data.len() {
                        tracing::error!(
                            "Tilecombine response sizes disagree with payload: {}",
                            first_line
                        );
                        break;
                    }
                    if let Some(cache) = self.tile_cache.as_mut() {
                        cache.save_and_notify(&tile, &data[offset..offset + size]).await;
                    }
                    offset += size;
                }
            }
            Err(e) => tracing::error!(
                "Failed to process tilecombine response [{}]: {}",
                first_line,
                e
            ),
        }
    }

    // ---- kit messages ---------------------------------------------------

    /// Classify and dispatch one framed message from the kit.
    async fn handle_kit_message(&mut self, payload: &Bytes) {
        let first_line = tokens::first_line(payload);
        let command = tokens::first_token(first_line);
        tracing::trace!("Broker handling child message: [{}]", tokens::abbr(payload));

        if let Some(("client", session_id)) = tokens::split_prefix(command) {
            let session_id = session_id.to_string();
            self.forward_to_client(&session_id, payload).await;
            return;
        }

        match command {
            "tile:" => self.handle_tile_response(payload).await,
            "tilecombine:" => self.handle_tile_combined_response(payload).await,
            "errortoall:" => {
                let cmd = tokens::token_value(first_line, "cmd").unwrap_or_default().to_string();
                let kind = tokens::token_value(first_line, "kind").unwrap_or_default().to_string();
                if cmd.is_empty() || kind.is_empty() {
                    tracing::error!("Malformed errortoall message: [{}]", first_line);
                    return;
                }
                self.registry.alert_all_users(&cmd, &kind).await;
            }
            "procmemstats:" => {
                if let Some(dirty) = tokens::token_int(first_line, "dirty") {
                    self.services
                        .telemetry
                        .upsert(&self.doc_key, |stats| stats.memory_dirty_kb = dirty);
                }
            }
            _ => {
                tracing::error!("Unexpected message: [{}]", tokens::abbr(payload));
            }
        }
    }

    /// Route a `client-<sid>` payload to its session (or all of them),
    /// inspecting it on the way for state the broker tracks.
    async fn forward_to_client(&mut self, session_id: &str, payload: &Bytes) {
        let first_line = tokens::first_line(payload);
        tracing::trace!("Forwarding payload to [{}]: {}", session_id, tokens::abbr(payload));

        // The body is everything after the routing prefix.
        let body_start = match payload.iter().position(|&b| b == b' ') {
            Some(idx) => idx + 1,
            None => {
                tracing::error!("Forward-to-client message without body: [{}]", first_line);
                return;
            }
        };
        let body = payload.slice(body_start..);
        let body_line = tokens::first_line(&body).to_string();

        self.inspect_kit_payload(session_id, &body_line).await;

        if session_id == "all" {
            // Delivery may remove sessions; iterate over a snapshot.
            let sessions: Vec<String> = self.sessions.keys().cloned().collect();
            for id in sessions {
                if let Some(session) = self.sessions.get(&id) {
                    deliver(session, &body, &body_line);
                }
            }
        } else if let Some(session) = self.sessions.get(session_id) {
            deliver(session, &body, &body_line);
        } else {
            tracing::warn!(
                "Client session [{}] not found to forward message: {}",
                session_id,
                body_line
            );
        }
    }

    /// State the broker mirrors out of kit-to-client traffic: load
    /// acknowledgement, save results, tile invalidations, the cursor hint.
    async fn inspect_kit_payload(&mut self, session_id: &str, body_line: &str) {
        if body_line.starts_with("status:") {
            self.set_loaded();
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.set_view_loaded();
            }
        } else if let Some(rest) = body_line.strip_prefix("invalidatetiles:") {
            let spec = rest.to_string();
            if let Some(cache) = self.tile_cache.as_mut() {
                cache.invalidate(&spec).await;
            }
        } else if let Some(rest) = body_line.strip_prefix("invalidatecursor:") {
            let fields: Vec<i32> = rest
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|f| !f.is_empty())
                .filter_map(|f| f.parse().ok())
                .collect();
            if let [x, y, w, h] = fields[..] {
                self.cursor = (x, y, w, h);
            }
        } else if body_line.starts_with("unocommandresult:") {
            let cmd = tokens::token_value(body_line, "cmd");
            if cmd == Some("save") {
                let success = tokens::token_value(body_line, "success") == Some("true");
                let result = tokens::token_value(body_line, "result").unwrap_or_default().to_string();
                self.save_to_storage(session_id, success, &result).await;
            }
        }
    }

    // ---- teardown -------------------------------------------------------

    /// Queue a text frame to every session of this document.
    pub fn alert_all_sessions(&self, message: &str) {
        tracing::debug!("Alerting all users of [{}]: {}", self.doc_key, message);
        for session in self.sessions.values() {
            session.send_text(message);
        }
    }

    /// Close every client with a going-away handshake and remove it.
    async fn shutdown_clients(&mut self, reason: &str) {
        tracing::info!(
            "Terminating {} clients of doc [{}]",
            self.sessions.len(),
            self.doc_key
        );

        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            if let Some(session) = self.sessions.get(&id) {
                session.shutdown(protocol::CLOSE_ENDPOINT_GOING_AWAY, reason);
            }
            self.remove_session(&id, true).await;
        }
    }

    /// The kit's socket went away underneath us.
    async fn child_socket_terminated(&mut self) {
        let alive = self.child.as_ref().map(|k| k.is_alive()).unwrap_or(false);
        if !alive {
            tracing::error!("Child for doc [{}] terminated prematurely", self.doc_key);
        }
        self.shutdown_clients("terminated").await;
        if self.sessions.is_empty() {
            self.close_reason = "terminated".to_string();
            self.stop = true;
        }
    }

    /// Terminate the kit, gracefully unless `rude`.
    async fn terminate_child(&mut self, close_reason: &str, rude: bool) {
        tracing::info!("Terminating doc [{}] with reason: {}", self.doc_key, close_reason);

        if !rude {
            self.shutdown_clients(close_reason).await;
        }

        if let Some(mut kit) = self.child.take() {
            tracing::info!(
                "Terminating child [{}] of doc [{}]",
                kit.pid(),
                self.doc_key
            );
            kit.close(rude).await;
        }

        self.stop = true;
    }

    /// Rude teardown requested from outside (admin action, recycle).
    pub async fn close_document(&mut self, reason: &str) {
        tracing::debug!(
            "Closing DocumentBroker for docKey [{}] with reason: {}",
            self.doc_key,
            reason
        );
        self.close_reason = reason.to_string();
        self.terminate_child(reason, true).await;
    }

    /// Debug snapshot, surfaced through the stats endpoint.
    pub fn dump_state(&self) -> String {
        format!(
            "Broker: {} docKey: {} docId: {} sessions: {} loaded: {} modified: {} markedToDestroy: {} cursor: {:?}",
            self.filename,
            self.doc_key,
            self.doc_id,
            self.sessions.len(),
            self.is_loaded,
            self.is_modified,
            self.marked_to_destroy,
            self.cursor
        )
    }
}

/// Deliver a kit payload to one session, as text when it has no binary tail.
fn deliver(session: &ClientSession, body: &Bytes, body_line: &str) {
    if body_line.len() == body.len() {
        session.send_text(body_line.to_string());
    } else {
        session.send_binary(body.clone());
    }
}

/// Quota errors arrive either classified or as a raw ENOSPC.
fn is_disk_full(e: &DocError) -> bool {
    match e {
        DocError::Storage(StorageError::DiskFull { .. }) => true,
        DocError::Storage(StorageError::Io(io)) => io.raw_os_error() == Some(28),
        _ => false,
    }
}
