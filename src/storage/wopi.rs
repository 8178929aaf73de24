/**
 * WOPI Storage
 *
 * HTTP binding to an Office-compatible host:
 *
 * - `GET  <fileUri>?access_token=…`           CheckFileInfo (JSON)
 * - `GET  <fileUri>/contents?access_token=…`  GetFile (bytes)
 * - `POST <fileUri>/contents?access_token=…`  PutFile, with
 *   `X-LOOL-WOPI-Timestamp` carrying the last storage mtime we observed
 *
 * Call durations are measured; the broker reports the combined load time to
 * the client as `stats: wopiloadduration <secs>`.
 */

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use url::Url;

use super::{FileInfo, SaveResult, SessionInfo};
use crate::error::StorageError;

/// CheckFileInfo response fields the server consumes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WopiCheckFileInfo {
    base_file_name: String,
    size: u64,
    owner_id: String,
    user_id: String,
    user_friendly_name: String,
    user_can_write: bool,
    last_modified_time: Option<String>,
    post_message_origin: Option<String>,
    hide_print_option: bool,
    hide_save_option: bool,
    hide_export_option: bool,
    disable_print: bool,
    disable_export: bool,
    disable_copy: bool,
}

#[derive(Debug)]
pub struct WopiStorage {
    uri: Url,
    client: reqwest::Client,
    jail_root: PathBuf,
    jail_rel: PathBuf,
    file_info: FileInfo,
    root_file_path: Option<PathBuf>,
    load_duration: Duration,
}

impl WopiStorage {
    pub fn new(uri: Url, jail_root: &Path, jail_rel: &Path) -> Self {
        Self {
            uri,
            client: reqwest::Client::new(),
            jail_root: jail_root.to_path_buf(),
            jail_rel: jail_rel.to_path_buf(),
            file_info: FileInfo::default(),
            root_file_path: None,
            load_duration: Duration::ZERO,
        }
    }

    /// Endpoint URL with only the access token as query.
    fn endpoint(&self, contents: bool, access_token: Option<&str>) -> Url {
        let mut url = self.uri.clone();
        if contents {
            url.set_path(&format!("{}/contents", self.uri.path()));
        }
        url.set_query(None);
        if let Some(token) = access_token {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        url
    }

    pub async fn fetch_info(&mut self, access_token: Option<&str>) -> Result<SessionInfo, StorageError> {
        let url = self.endpoint(false, access_token);
        let started = Instant::now();

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| StorageError::connection(format!("CheckFileInfo failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(StorageError::unauthorized(format!(
                "CheckFileInfo returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(StorageError::connection(format!(
                "CheckFileInfo returned {}",
                status
            )));
        }

        let info: WopiCheckFileInfo = response
            .json()
            .await
            .map_err(|e| StorageError::BadFileInfo {
                message: format!("CheckFileInfo body: {}", e),
            })?;
        let call_duration = started.elapsed();

        let modified_time = match &info.last_modified_time {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| StorageError::BadFileInfo {
                        message: format!("LastModifiedTime [{}]: {}", raw, e),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        self.file_info = FileInfo {
            filename: info.base_file_name.clone(),
            owner_id: info.owner_id.clone(),
            size: info.size,
            modified_time,
        };

        tracing::debug!(
            "WOPI::CheckFileInfo for [{}] took {:?}",
            self.uri,
            call_duration
        );

        Ok(SessionInfo {
            user_id: info.user_id,
            username: info.user_friendly_name,
            user_can_write: info.user_can_write,
            post_message_origin: info.post_message_origin,
            hide_print_option: info.hide_print_option,
            hide_save_option: info.hide_save_option,
            hide_export_option: info.hide_export_option,
            disable_print: info.disable_print,
            disable_export: info.disable_export,
            disable_copy: info.disable_copy,
            call_duration,
        })
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub async fn download(&mut self, access_token: Option<&str>) -> Result<PathBuf, StorageError> {
        if let Some(path) = &self.root_file_path {
            return Ok(path.clone());
        }

        let url = self.endpoint(true, access_token);
        let started = Instant::now();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::connection(format!("GetFile failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(StorageError::connection(format!(
                "GetFile returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StorageError::connection(format!("GetFile body: {}", e)))?;

        let dir = self.jail_root.join(&self.jail_rel);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&self.file_info.filename);
        tokio::fs::write(&target, &body).await?;

        self.load_duration = started.elapsed();
        tracing::info!(
            "WOPI::GetFile [{}]: {} bytes in {:?} -> [{}]",
            self.uri,
            body.len(),
            self.load_duration,
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

    pub async fn upload(
        &mut self,
        access_token: Option<&str>,
        wopi_timestamp: Option<DateTime<Utc>>,
    ) -> SaveResult {
        let Some(jailed) = self.root_file_path.clone() else {
            tracing::error!("PutFile requested before GetFile for [{}]", self.uri);
            return SaveResult::Failed;
        };

        let body = match tokio::fs::read(&jailed).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Cannot read jailed file [{}]: {}", jailed.display(), e);
                return SaveResult::Failed;
            }
        };

        let mut request = self
            .client
            .post(self.endpoint(true, access_token))
            .header("X-WOPI-Override", "PUT")
            .body(body);
        if let Some(ts) = wopi_timestamp {
            request = request.header(
                "X-LOOL-WOPI-Timestamp",
                ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            );
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("WOPI::PutFile [{}] failed: {}", self.uri, e);
                return SaveResult::Failed;
            }
        };

        let status = response.status();
        if status.is_success() {
            SaveResult::Ok
        } else if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE
            || status == reqwest::StatusCode::INSUFFICIENT_STORAGE
        {
            SaveResult::DiskFull
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::NOT_FOUND
        {
            SaveResult::Unauthorized
        } else {
            tracing::error!("WOPI::PutFile [{}] returned {}", self.uri, status);
            SaveResult::Failed
        }
    }

    pub fn uri_string(&self) -> String {
        self.uri.to_string()
    }

    /// Time spent in GetFile, reported to the client after load.
    pub fn load_duration(&self) -> Duration {
        self.load_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_file_info_parsing() {
        let json = r#"{
            "BaseFileName": "budget.ods",
            "Size": 4096,
            "OwnerId": "alice",
            "UserId": "bob",
            "UserFriendlyName": "Bob",
            "UserCanWrite": true,
            "LastModifiedTime": "2024-01-01T00:00:00Z",
            "PostMessageOrigin": "http://host.example",
            "HidePrintOption": true
        }"#;
        let info: WopiCheckFileInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.base_file_name, "budget.ods");
        assert_eq!(info.owner_id, "alice");
        assert!(info.user_can_write);
        assert!(info.hide_print_option);
        assert!(!info.hide_save_option);
        assert_eq!(
            info.last_modified_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_endpoint_urls() {
        let uri = Url::parse("https://host/wopi/files/42?access_token=old&perm=edit").unwrap();
        let storage = WopiStorage::new(uri, Path::new("/jail"), Path::new("user/doc/j1"));

        let info = storage.endpoint(false, Some("tok"));
        assert_eq!(info.as_str(), "https://host/wopi/files/42?access_token=tok");

        let contents = storage.endpoint(true, Some("tok"));
        assert_eq!(
            contents.as_str(),
            "https://host/wopi/files/42/contents?access_token=tok"
        );
    }
}
