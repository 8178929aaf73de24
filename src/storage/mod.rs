/**
 * Storage Binding
 *
 * Abstraction over where a document lives: a local filesystem path or a WOPI
 * host. The broker downloads the file into the kit's jail at load time and
 * uploads it back on save. Kind dispatch is a tagged enum; call sites never
 * test the concrete kind, and kind-specific telemetry (the WOPI fetch
 * duration) travels in the common structs.
 */

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::StorageError;

pub mod local;
pub mod tokens;
pub mod wopi;

pub use local::LocalStorage;
pub use tokens::TokenLedger;
pub use wopi::WopiStorage;

/// Basic file information, refreshed by `fetch_info`.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Document file name as the storage reports it
    pub filename: String,
    /// Owner identity, used for document-owner detection
    pub owner_id: String,
    /// File size in bytes
    pub size: u64,
    /// Storage-reported modification time
    pub modified_time: Option<DateTime<Utc>>,
}

impl FileInfo {
    /// A file info is usable once it names the file.
    pub fn is_valid(&self) -> bool {
        !self.filename.is_empty()
    }
}

/// Per-session data produced by `fetch_info`: the caller's identity and the
/// UI feature flags the host wants applied, plus how long the call took.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub user_id: String,
    pub username: String,
    pub user_can_write: bool,
    pub post_message_origin: Option<String>,
    pub hide_print_option: bool,
    pub hide_save_option: bool,
    pub hide_export_option: bool,
    pub disable_print: bool,
    pub disable_export: bool,
    pub disable_copy: bool,
    /// Time spent fetching the file info, zero for local storage
    pub call_duration: Duration,
}

/// Outcome of uploading the document back to storage.
///
/// Not an error type: each variant demands different session handling, so the
/// broker matches on the outcome rather than unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    /// Uploaded and persisted
    Ok,
    /// Storage is out of space; sessions go read-only
    DiskFull,
    /// Access token invalid or expired
    Unauthorized,
    /// Transient or unclassified failure
    Failed,
}

/// A document's storage binding.
#[derive(Debug)]
pub enum Storage {
    /// Local filesystem path
    Local(LocalStorage),
    /// WOPI host over HTTP
    Wopi(WopiStorage),
}

impl Storage {
    /// Construct the binding matching the public URI scheme.
    ///
    /// `jail_root` is `<child_root>/<jailId>`; the document is staged at
    /// `<jail_root>/<jail_rel>/<filename>` where the kit can reach it.
    pub fn create(uri: &Url, jail_root: &Path, jail_rel: &Path) -> Result<Self, StorageError> {
        match uri.scheme() {
            "http" | "https" => Ok(Storage::Wopi(WopiStorage::new(uri.clone(), jail_root, jail_rel))),
            "file" => Ok(Storage::Local(LocalStorage::new(uri.clone(), jail_root, jail_rel))),
            other => Err(StorageError::BadFileInfo {
                message: format!("unsupported storage scheme '{}'", other),
            }),
        }
    }

    /// Fetch file info and the caller's session info.
    ///
    /// Refreshes [`Storage::file_info`] as a side effect; the broker re-calls
    /// this after a successful upload to learn the new storage timestamp.
    pub async fn fetch_info(&mut self, access_token: Option<&str>) -> Result<SessionInfo, StorageError> {
        match self {
            Storage::Local(s) => s.fetch_info().await,
            Storage::Wopi(s) => s.fetch_info(access_token).await,
        }
    }

    /// The last fetched file info.
    pub fn file_info(&self) -> &FileInfo {
        match self {
            Storage::Local(s) => s.file_info(),
            Storage::Wopi(s) => s.file_info(),
        }
    }

    /// Download the document into the jail. Idempotent per binding.
    pub async fn download(&mut self, access_token: Option<&str>) -> Result<PathBuf, StorageError> {
        match self {
            Storage::Local(s) => s.download().await,
            Storage::Wopi(s) => s.download(access_token).await,
        }
    }

    /// Whether the document has been downloaded already.
    pub fn is_downloaded(&self) -> bool {
        match self {
            Storage::Local(s) => s.is_downloaded(),
            Storage::Wopi(s) => s.is_downloaded(),
        }
    }

    /// Jail-local path of the downloaded document.
    pub fn root_file_path(&self) -> Option<&Path> {
        match self {
            Storage::Local(s) => s.root_file_path(),
            Storage::Wopi(s) => s.root_file_path(),
        }
    }

    /// Upload the jailed document back to storage.
    ///
    /// `wopi_timestamp` is the storage mtime the broker last observed; WOPI
    /// hosts use it to detect conflicting writes.
    pub async fn upload(
        &mut self,
        access_token: Option<&str>,
        wopi_timestamp: Option<DateTime<Utc>>,
    ) -> SaveResult {
        match self {
            Storage::Local(s) => s.upload().await,
            Storage::Wopi(s) => s.upload(access_token, wopi_timestamp).await,
        }
    }

    /// Public URI string, the tile-cache key component.
    pub fn uri_string(&self) -> String {
        match self {
            Storage::Local(s) => s.uri_string(),
            Storage::Wopi(s) => s.uri_string(),
        }
    }

    /// Time spent downloading the document, zero for local storage.
    pub fn load_duration(&self) -> Duration {
        match self {
            Storage::Local(_) => Duration::ZERO,
            Storage::Wopi(s) => s.load_duration(),
        }
    }
}
