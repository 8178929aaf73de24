//! Per-document telemetry
//!
//! Brokers publish a small stats record here as state changes; the stats
//! endpoint serves a snapshot. The kit's `procmemstats:` messages land in
//! `memory_dirty_kb`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocStats {
    pub pid: u32,
    pub filename: String,
    pub session_count: usize,
    pub loaded: bool,
    pub modified: bool,
    pub memory_dirty_kb: i64,
    pub load_duration_ms: Option<u64>,
    /// Seconds since the Unix epoch of the last client activity
    pub last_activity_epoch: i64,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    docs: Mutex<HashMap<String, DocStats>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update (creating if absent) the record for a document.
    pub fn upsert(&self, doc_key: &str, update: impl FnOnce(&mut DocStats)) {
        let mut docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        update(docs.entry(doc_key.to_string()).or_default());
    }

    /// Stamp last-activity for a document.
    pub fn touch(&self, doc_key: &str) {
        self.upsert(doc_key, |stats| {
            stats.last_activity_epoch = chrono::Utc::now().timestamp();
        });
    }

    pub fn remove_doc(&self, doc_key: &str) {
        let mut docs = self.docs.lock().unwrap_or_else(|p| p.into_inner());
        docs.remove(doc_key);
    }

    pub fn snapshot(&self) -> HashMap<String, DocStats> {
        self.docs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
