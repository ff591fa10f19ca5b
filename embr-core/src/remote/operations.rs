//! Persisted transfer progress
//!
//! Each push or pull keeps an [`OperationRecord`] with the bytes sent so far.
//! The table is saved to `.embr/operations.state` as JSON after every batch
//! and on shutdown, so an interrupted push can resume where it stopped.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::refs::atomic_write;

/// Records kept before the oldest completed one is replaced
pub const MAX_OPERATIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_type: OperationType,
    pub remote: String,
    pub path: String,
    pub total: u64,
    pub transferred: u64,
    pub start_ts: i64,
    pub last_update: i64,
    /// DJB checksum of the payload, hex
    pub checksum: String,
    pub completed: bool,
}

impl OperationRecord {
    fn matches(&self, op_type: OperationType, remote: &str, path: &str) -> bool {
        self.op_type == op_type && self.remote == remote && self.path == path
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    operations: Vec<OperationRecord>,
}

/// Operation records guarded by a mutex
#[derive(Debug)]
pub struct OperationTable {
    path: PathBuf,
    records: Mutex<Vec<OperationRecord>>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl OperationTable {
    /// Load `path`; a missing or unreadable state file starts an empty table
    pub fn load(path: &Path) -> Result<Self> {
        let records = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<StateFile>(&bytes) {
                Ok(state) => state.operations,
                Err(e) => {
                    warn!("ignoring corrupt operation state {:?}: {}", path, e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("loaded {} operation records", records.len());
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OperationRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save(&self) -> Result<()> {
        let state = StateFile {
            operations: self.lock().clone(),
        };
        atomic_write(&self.path, &serde_json::to_vec_pretty(&state)?)
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.lock().clone()
    }

    pub fn get(&self, op_type: OperationType, remote: &str, path: &str) -> Option<OperationRecord> {
        self.lock()
            .iter()
            .find(|r| r.matches(op_type, remote, path))
            .cloned()
    }

    /// Begin tracking a transfer.
    ///
    /// An unfinished record for the same payload (same size and checksum) is
    /// kept with its progress; any other record for the target is reset.
    pub fn start(&self, op_type: OperationType, remote: &str, path: &str, total: u64, checksum: &str) -> OperationRecord {
        let mut records = self.lock();
        let ts = now();
        if let Some(existing) = records.iter_mut().find(|r| r.matches(op_type, remote, path)) {
            if !existing.completed && existing.total == total && existing.checksum == checksum {
                existing.last_update = ts;
                return existing.clone();
            }
            *existing = OperationRecord {
                op_type,
                remote: remote.to_string(),
                path: path.to_string(),
                total,
                transferred: 0,
                start_ts: ts,
                last_update: ts,
                checksum: checksum.to_string(),
                completed: false,
            };
            return existing.clone();
        }

        let record = OperationRecord {
            op_type,
            remote: remote.to_string(),
            path: path.to_string(),
            total,
            transferred: 0,
            start_ts: ts,
            last_update: ts,
            checksum: checksum.to_string(),
            completed: false,
        };
        if records.len() < MAX_OPERATIONS {
            records.push(record.clone());
        } else {
            // Oldest completed record first, else the least recently updated
            let victim = records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.completed)
                .min_by_key(|(_, r)| r.last_update)
                .or_else(|| records.iter().enumerate().min_by_key(|(_, r)| r.last_update))
                .map(|(i, _)| i)
                .unwrap_or(0);
            records[victim] = record.clone();
        }
        record
    }

    pub fn update(&self, op_type: OperationType, remote: &str, path: &str, transferred: u64) {
        if let Some(r) = self.lock().iter_mut().find(|r| r.matches(op_type, remote, path)) {
            r.transferred = transferred.min(r.total);
            r.last_update = now();
        }
    }

    pub fn complete(&self, op_type: OperationType, remote: &str, path: &str) {
        if let Some(r) = self.lock().iter_mut().find(|r| r.matches(op_type, remote, path)) {
            r.transferred = r.total;
            r.completed = true;
            r.last_update = now();
        }
    }

    /// Offset to resume a push of this exact payload from, 0 when there is nothing to resume
    pub fn resume_position(&self, remote: &str, path: &str, total: u64, checksum: &str) -> u64 {
        match self.get(OperationType::Push, remote, path) {
            Some(r) if !r.completed && r.total == total && r.checksum == checksum => r.transferred,
            _ => 0,
        }
    }
}
