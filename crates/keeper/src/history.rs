//! Append-only, size-limited log of recent keeper actions per subpool.
//!
//! A log per pool key keeps history for quiet pools even when other pools
//! are busy. The ring overwrites its oldest entry on overflow.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use lighthouse_core::job::Pull;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Trigger,
    TriggerBatch,
    Merge,
    MergeBatch,
    Poison,
    Wait,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Trigger => "TRIGGER",
            Action::TriggerBatch => "TRIGGER_BATCH",
            Action::Merge => "MERGE",
            Action::MergeBatch => "MERGE_BATCH",
            Action::Poison => "POISON",
            Action::Wait => "WAIT",
        }
    }
}

/// One action the keeper took for a subpool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Record {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub action: Action,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_sha: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<Pull>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

/// Best-effort persistence for history snapshots.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Placeholder store used until an object-store client is wired in.
pub struct NoopBlobStore;

#[async_trait]
impl BlobStore for NoopBlobStore {
    async fn read(&self, _path: &str) -> Result<Vec<u8>> { Ok(Vec::new()) }

    async fn write(&self, _path: &str, _bytes: Vec<u8>) -> Result<()> { Ok(()) }
}

pub struct History {
    logs: Mutex<HashMap<String, RecordLog>>,
    limit: usize,
    path: String,
    blob: Arc<dyn BlobStore>,
}

impl History {
    pub fn new(limit: usize) -> History {
        History::with_blob_store(limit, "", Arc::new(NoopBlobStore))
    }

    /// `path` empty disables flush and load.
    pub fn with_blob_store(limit: usize, path: &str, blob: Arc<dyn BlobStore>) -> History {
        History {
            logs: Mutex::new(HashMap::new()),
            limit: limit.max(1),
            path: path.to_string(),
            blob,
        }
    }

    /// Load a previously flushed snapshot. Failures are logged, never fatal.
    pub async fn load(&self) {
        if self.path.is_empty() {
            return;
        }
        let bytes = match self.blob.read(&self.path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(path = %self.path, "Failed to read action history: {e:?}");
                return;
            }
        };
        let records: BTreeMap<String, Vec<Record>> = match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(path = %self.path, "Failed to decode action history: {e}");
                return;
            }
        };
        let mut logs = self.lock();
        for (key, entries) in records {
            let log = logs.entry(key).or_insert_with(|| RecordLog::new(self.limit));
            // Snapshots are newest-first; re-append oldest-first.
            for record in entries.into_iter().rev() {
                log.add(record);
            }
        }
    }

    pub fn record(
        &self,
        pool_key: &str,
        action: Action,
        base_sha: &str,
        mut targets: Vec<Pull>,
        err: Option<String>,
    ) {
        targets.sort_by_key(|p| p.number);
        let record = Record {
            time: OffsetDateTime::now_utc(),
            action,
            base_sha: base_sha.to_string(),
            target: targets,
            err: err.unwrap_or_default(),
        };
        let mut logs = self.lock();
        logs.entry(pool_key.to_string()).or_insert_with(|| RecordLog::new(self.limit)).add(record);
    }

    /// Pool key -> records, newest first. Serializable as the history
    /// endpoint's JSON body.
    pub fn all_records(&self) -> BTreeMap<String, Vec<Record>> {
        let mut logs = self.lock();
        logs.iter_mut().map(|(key, log)| (key.clone(), log.to_vec())).collect()
    }

    /// Flush the current snapshot to the blob store, best effort.
    pub async fn flush(&self) {
        if self.path.is_empty() {
            return;
        }
        let records = self.all_records();
        let bytes = match serde_json::to_vec(&records) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode action history: {e}");
                return;
            }
        };
        if let Err(e) = self.blob.write(&self.path, bytes).await {
            tracing::error!(path = %self.path, "Failed to flush action history: {e:?}");
        } else {
            tracing::debug!(path = %self.path, pools = records.len(), "Flushed action history");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecordLog>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Space-efficient, limited-size, append-only ring.
struct RecordLog {
    buff: Vec<Record>,
    head: usize,
    limit: usize,
    /// Cached newest-first snapshot; most pools do not change between syncs.
    cached: Option<Vec<Record>>,
}

impl RecordLog {
    fn new(limit: usize) -> RecordLog {
        RecordLog { buff: Vec::new(), head: 0, limit, cached: None }
    }

    fn add(&mut self, record: Record) {
        self.cached = None;
        if self.buff.len() < self.limit {
            self.buff.push(record);
            self.head = self.buff.len() - 1;
        } else {
            self.head = (self.head + 1) % self.limit;
            self.buff[self.head] = record;
        }
    }

    fn to_vec(&mut self) -> Vec<Record> {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let mut out = Vec::with_capacity(self.buff.len());
        for i in 0..self.buff.len() {
            let index = (self.limit + self.head - i) % self.limit;
            out.push(self.buff[index].clone());
        }
        self.cached = Some(out.clone());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(number: u64) -> Pull { Pull { number, ..Pull::default() } }

    #[test]
    fn test_ring_overflow() {
        let history = History::new(3);
        for i in 0..5u64 {
            history.record("org/repo:master", Action::Trigger, &format!("sha{i}"), vec![pull(i)], None);
        }
        let records = history.all_records();
        let entries = &records["org/repo:master"];
        // Capacity respected, newest first, oldest overwritten.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].base_sha, "sha4");
        assert_eq!(entries[1].base_sha, "sha3");
        assert_eq!(entries[2].base_sha, "sha2");
    }

    #[test]
    fn test_targets_sorted_by_number() {
        let history = History::new(10);
        history.record("k", Action::MergeBatch, "d0", vec![pull(3), pull(1), pull(2)], None);
        let records = history.all_records();
        let numbers: Vec<u64> = records["k"][0].target.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_per_key_isolation() {
        let history = History::new(2);
        history.record("a", Action::Merge, "s1", vec![], None);
        history.record("b", Action::Trigger, "s2", vec![], Some("boom".to_string()));
        let records = history.all_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records["b"][0].err, "boom");
    }

    #[tokio::test]
    async fn test_flush_and_load_round_trip() {
        struct MemBlob(Mutex<Vec<u8>>);

        #[async_trait]
        impl BlobStore for MemBlob {
            async fn read(&self, _path: &str) -> Result<Vec<u8>> {
                Ok(self.0.lock().unwrap().clone())
            }

            async fn write(&self, _path: &str, bytes: Vec<u8>) -> Result<()> {
                *self.0.lock().unwrap() = bytes;
                Ok(())
            }
        }

        let blob = Arc::new(MemBlob(Mutex::new(Vec::new())));
        let history = History::with_blob_store(10, "history.json", blob.clone());
        history.record("k", Action::Merge, "s1", vec![pull(1)], None);
        history.record("k", Action::Trigger, "s2", vec![pull(2)], None);
        history.flush().await;

        let restored = History::with_blob_store(10, "history.json", blob);
        restored.load().await;
        assert_eq!(restored.all_records(), history.all_records());
    }
}
