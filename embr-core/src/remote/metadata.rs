//! `sets/<set>/metadata.json`, the remote copy of a set's history
//!
//! ```json
//! {
//!   "timestamp": 1700000000,
//!   "size": 2048,
//!   "set": "main",
//!   "head": "main",
//!   "objects": [{"hash": "...", "path": "...", "created": 1700000000, "model": "m1"}],
//!   "index": [{"hash": "...", "path": "..."}],
//!   "refs": {"m1": "..."}
//! }
//! ```
//!
//! `objects` is the set's log in order, so a fresh clone can rebuild the
//! log, index, and per-model refs byte for byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::hash::ObjectHash;
use crate::refs::{self, LogEntry, RefEntry};
use crate::repository::{Repository, Rewrite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub hash: ObjectHash,
    pub path: String,
    pub created: i64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIndexEntry {
    pub hash: ObjectHash,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub timestamp: i64,
    /// Bytes of object data referenced by `objects`
    pub size: u64,
    pub set: String,
    pub head: String,
    #[serde(default)]
    pub objects: Vec<RemoteObject>,
    #[serde(default)]
    pub index: Vec<RemoteIndexEntry>,
    /// Newest hash per model
    #[serde(default)]
    pub refs: BTreeMap<String, ObjectHash>,
}

impl RemoteMetadata {
    /// Snapshot of `set` from its log, index, and HEAD
    pub fn build(repo: &Repository, set: &str) -> Result<Self> {
        let log = repo.log_entries(set)?;
        let index = repo.index(set)?;

        let mut refs = BTreeMap::new();
        for entry in &log {
            refs.insert(entry.model_or_unknown().to_string(), entry.hash);
        }

        let mut size = 0;
        let mut counted = std::collections::HashSet::new();
        for entry in &log {
            if counted.insert(entry.hash) {
                size += std::fs::metadata(repo.store().raw_path(&entry.hash))
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
        }

        Ok(Self {
            timestamp: chrono::Utc::now().timestamp(),
            size,
            set: set.to_string(),
            head: repo.current_set()?,
            objects: log
                .iter()
                .map(|e| RemoteObject {
                    hash: e.hash,
                    path: e.path.clone(),
                    created: e.timestamp,
                    model: e.model_or_unknown().to_string(),
                })
                .collect(),
            index: index
                .iter()
                .map(|e| RemoteIndexEntry {
                    hash: e.hash,
                    path: e.path.clone(),
                })
                .collect(),
            refs,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Model of the newest `objects` entry binding `hash` to `path`
    pub fn model_of(&self, hash: &ObjectHash, path: &str) -> Option<&str> {
        self.objects
            .iter()
            .rev()
            .find(|o| o.hash == *hash && o.path == path)
            .map(|o| o.model.as_str())
    }

    /// Newest `objects` entry for `hash`
    pub fn object(&self, hash: &ObjectHash) -> Option<&RemoteObject> {
        self.objects.iter().rev().find(|o| o.hash == *hash)
    }

    /// Write `set`'s log, index, and model refs from this snapshot.
    ///
    /// Callers hold the repository lock (the pull transaction does).
    pub(crate) fn rebuild(&self, repo: &Repository, set: &str) -> Result<()> {
        let layout = repo.layout();
        let created = !layout.set_dir(set).is_dir();

        let log: Vec<LogEntry> = self
            .objects
            .iter()
            .map(|o| LogEntry::new(o.created, o.hash, o.path.as_str(), o.model.as_str()))
            .collect();
        let index: Vec<RefEntry> = self
            .index
            .iter()
            .map(|e| RefEntry::new(e.hash, e.path.as_str()))
            .collect();
        let mut by_model: BTreeMap<&str, Vec<RefEntry>> = BTreeMap::new();
        for entry in &index {
            let model = self
                .model_of(&entry.hash, &entry.path)
                .unwrap_or(refs::UNKNOWN_MODEL);
            by_model.entry(model).or_default().push(entry.clone());
        }

        let mut files = vec![layout.set_log(set), layout.set_index(set)];
        files.extend(by_model.keys().map(|m| layout.model_ref(set, m)));
        let rewrite = Rewrite::capture(&files)?;
        let result: Result<()> = (|| {
            repo.create_set_files(set)?;
            refs::write_log(&layout.set_log(set), &log)?;
            refs::write_ref_entries(&layout.set_index(set), &index)?;
            for (model, entries) in &by_model {
                refs::write_ref_entries(&layout.model_ref(set, model), entries)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            if created {
                if let Err(err) = std::fs::remove_dir_all(layout.set_dir(set)) {
                    warn!("failed to remove partial set '{}': {}", set, err);
                }
            } else {
                rewrite.restore();
            }
            return Err(e);
        }

        info!(
            "rebuilt set '{}' from remote metadata: {} log entries, {} index entries, {} models",
            set,
            log.len(),
            index.len(),
            by_model.len()
        );
        Ok(())
    }
}
