//! Local filesystem storage
//!
//! Reads the document from a `file:` URI, reports the file's native mtime,
//! and copies the jailed file back over the original on save. Identity is
//! the local user; there is no token handshake.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::{FileInfo, SaveResult, SessionInfo};
use crate::error::StorageError;

#[derive(Debug)]
pub struct LocalStorage {
    uri: url::Url,
    source_path: PathBuf,
    jail_root: PathBuf,
    jail_rel: PathBuf,
    file_info: FileInfo,
    root_file_path: Option<PathBuf>,
}

impl LocalStorage {
    pub fn new(uri: url::Url, jail_root: &Path, jail_rel: &Path) -> Self {
        let source_path = PathBuf::from(uri.path());
        Self {
            uri,
            source_path,
            jail_root: jail_root.to_path_buf(),
            jail_rel: jail_rel.to_path_buf(),
            file_info: FileInfo::default(),
            root_file_path: None,
        }
    }

    pub async fn fetch_info(&mut self) -> Result<SessionInfo, StorageError> {
        let meta = tokio::fs::metadata(&self.source_path).await.map_err(|e| {
            StorageError::connection(format!(
                "cannot stat local file [{}]: {}",
                self.source_path.display(),
                e
            ))
        })?;

        let filename = self
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.file_info = FileInfo {
            filename,
            owner_id: "localhost".to_string(),
            size: meta.len(),
            modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
        };

        let username = std::env::var("USER").unwrap_or_else(|_| "Local User".to_string());
        Ok(SessionInfo {
            user_id: "localhost".to_string(),
            username,
            user_can_write: !meta.permissions().readonly(),
            ..SessionInfo::default()
        })
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub async fn download(&mut self) -> Result<PathBuf, StorageError> {
        if let Some(path) = &self.root_file_path {
            return Ok(path.clone());
        }

        let dir = self.jail_root.join(&self.jail_rel);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&self.file_info.filename);
        tokio::fs::copy(&self.source_path, &target).await?;

        tracing::info!(
            "Copied local document [{}] into jail at [{}]",
            self.source_path.display(),
            target.display()
        );
        self.root_file_path = Some(target.clone());
        Ok(target)
    }

    pub fn is_downloaded(&self) -> bool {
        self.root_file_path.is_some()
    }

    pub fn root_file_path(&self) -> Option<&Path> {
        self.root_file_path.as_deref()
    }

    pub async fn upload(&mut self) -> SaveResult {
        let Some(jailed) = self.root_file_path.clone() else {
            tracing::error!("Upload requested before download for [{}]", self.uri);
            return SaveResult::Failed;
        };

        match tokio::fs::copy(&jailed, &self.source_path).await {
            Ok(_) => SaveResult::Ok,
            // ENOSPC
            Err(e) if e.raw_os_error() == Some(28) => {
                tracing::warn!("Disk full writing [{}]", self.source_path.display());
                SaveResult::DiskFull
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => SaveResult::Unauthorized,
            Err(e) => {
                tracing::error!("Failed to write [{}]: {}", self.source_path.display(), e);
                SaveResult::Failed
            }
        }
    }

    pub fn uri_string(&self) -> String {
        self.uri.to_string()
    }
}
