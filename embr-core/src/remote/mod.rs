//! Remote synchronisation
//!
//! [`RemoteSession`] pushes a set's objects and history to a remote and pulls
//! them back. Each push or pull is one journaled [`Transaction`]: on any
//! error the transaction is aborted with the error's kind, and the canonical
//! `REMOTE_HEAD` only changes on commit.
//!
//! Remote layout, under the URL's prefix:
//!
//! ```text
//! sets/<set>/documents/<hash>.parquet   one object per file
//! sets/<set>/documents/<hash>.json      text objects, verbatim
//! sets/<set>/metadata.json              log, index and refs snapshot
//! ```

pub mod config;
pub mod journal;
pub mod metadata;
pub mod operations;
pub mod transfer;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use config::{RemoteConfig, RemoteOptions, Remotes};
pub use journal::{recover, Journal, JournalRecord, Recovery, TempRef, Transaction};
pub use metadata::RemoteMetadata;
pub use operations::{OperationRecord, OperationTable, OperationType};
pub use transfer::{ProgressEvent, ProgressFn, TransferSettings, BATCH_SIZE};

use crate::error::{EmbrError, Result};
use crate::hash::{djb_checksum_hex, ObjectHash};
use crate::meta::{self, Metadata};
use crate::parquet::{transformer_for, Transformed, Transformer};
use crate::paths;
use crate::repository::Repository;
use crate::transport::{self, RetryPolicy, Transport};

/// `sets/<set>`
pub fn set_prefix(set: &str) -> String {
    paths::join_key(&["sets", set])
}

/// `sets/<set>/documents/`
pub fn documents_prefix(set: &str) -> String {
    format!("{}/", paths::join_key(&["sets", set, "documents"]))
}

/// `sets/<set>/documents/<hash>.<ext>`
pub fn document_key(set: &str, hash: &ObjectHash, extension: &str) -> String {
    format!("{}{}.{}", documents_prefix(set), hash, extension)
}

/// `sets/<set>/metadata.json`
pub fn metadata_key(set: &str) -> String {
    paths::join_key(&["sets", set, "metadata.json"])
}

/// Hash named by a document key: the file name up to its first `.`.
/// Staged batch parts name no document.
pub fn document_hash(key: &str) -> Option<ObjectHash> {
    let name = key.rsplit('/').next()?;
    if name.contains(".part-") {
        return None;
    }
    let stem = name.split('.').next()?;
    ObjectHash::from_hex(stem).ok()
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Defaults to the current set
    pub set: Option<String>,
    /// Delete remote documents whose hash is not in the local log
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub set: String,
    pub uploaded: usize,
    /// Already on the remote
    pub skipped: usize,
    /// In the log but missing from the local store
    pub missing: usize,
    /// Removed from the remote by `force`
    pub deleted: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub set: Option<String>,
    /// Report local objects absent from the remote
    pub prune: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub set: String,
    pub downloaded: usize,
    pub skipped: usize,
    /// The local log, index, and refs were rebuilt from `metadata.json`
    pub rebuilt: bool,
    /// Local objects the remote does not have; deleted only by [`RemoteSession::prune`]
    pub prune_candidates: Vec<ObjectHash>,
}

/// A connection from a repository to one configured remote
pub struct RemoteSession<'a> {
    repo: &'a Repository,
    config: RemoteConfig,
    transport: Box<dyn Transport>,
    transformer: Box<dyn Transformer>,
    ops: OperationTable,
    settings: TransferSettings,
}

impl<'a> RemoteSession<'a> {
    /// Open the remote named `name` from the repository config
    pub fn open(repo: &'a Repository, name: &str) -> Result<Self> {
        let config = Remotes::new(repo.layout()).get(name)?;
        Self::new(repo, config)
    }

    pub fn new(repo: &'a Repository, config: RemoteConfig) -> Result<Self> {
        let transport = transport::open(&config)?;
        let transformer = transformer_for(&config.format)?;
        let ops = OperationTable::load(&repo.layout().operations_state())?;
        Ok(Self {
            repo,
            config,
            transport,
            transformer,
            ops,
            settings: TransferSettings::default(),
        })
    }

    /// Replace the transport opened from the URL
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.settings.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.settings.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.settings.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn operations(&self) -> &OperationTable {
        &self.ops
    }

    /// Commit `tx` on success; abort it with the error's kind otherwise
    async fn finish<T>(&mut self, tx: Transaction, op: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                warn!("{} with '{}' failed: {}", op, self.config.name, e);
                if let Err(abort_err) = tx.abort(Some(e.kind())) {
                    warn!("abort failed: {}", abort_err);
                }
                if let Err(disconnect_err) = self.transport.disconnect().await {
                    debug!("disconnect after failure: {}", disconnect_err);
                }
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────

    pub async fn push(&mut self, options: &PushOptions) -> Result<PushReport> {
        let set = self.repo.set_or_current(options.set.as_deref())?;
        if self.repo.log_entries(&set)?.is_empty() {
            return Err(EmbrError::invalid(format!("nothing to push: set '{}' has no history", set)));
        }
        let tx = Transaction::begin(self.repo.layout(), "push", &self.config.name, &set_prefix(&set))?;
        let result = self.push_inner(&tx, &set, options.force).await;
        self.finish(tx, "push", result).await
    }

    async fn push_inner(&mut self, tx: &Transaction, set: &str, force: bool) -> Result<PushReport> {
        let store = self.repo.store();
        let log = self.repo.log_entries(set)?;
        let mut report = PushReport {
            set: set.to_string(),
            ..Default::default()
        };

        self.transport.connect().await?;
        let remote_docs = self.transport.list(&documents_prefix(set)).await?;
        let local: HashSet<ObjectHash> = log.iter().map(|e| e.hash).collect();
        let mut on_remote: HashSet<ObjectHash> = remote_docs.iter().filter_map(|k| document_hash(k)).collect();

        if force {
            let stale: Vec<String> = remote_docs
                .iter()
                .filter(|k| document_hash(k).is_none_or(|h| !local.contains(&h)))
                .cloned()
                .collect();
            if !stale.is_empty() {
                report.deleted = self.transport.delete(&stale).await?;
                info!("deleted {} stale remote documents", report.deleted);
            }
            on_remote.retain(|h| local.contains(h));
        }

        let mut seen = HashSet::new();
        for entry in &log {
            if !seen.insert(entry.hash) {
                continue;
            }
            if on_remote.contains(&entry.hash) {
                report.skipped += 1;
                continue;
            }
            if !store.exists(&entry.hash) {
                warn!("object {} for {} is missing locally, skipping", entry.hash.short(12), entry.path);
                report.missing += 1;
                continue;
            }
            let native = store.read_raw(&entry.hash)?;
            let sidecar = store.read_meta(&entry.hash).ok();
            let transformed = self.transformer.forward(&native, sidecar.as_ref(), None)?;
            let key = document_key(set, &entry.hash, transformed.extension());
            self.transport.state_mut().data_is_precompressed = matches!(transformed, Transformed::Parquet(_));
            let data = transformed.into_bytes();
            transfer::upload(
                self.transport.as_mut(),
                &self.ops,
                &self.config.name,
                &key,
                &data,
                &self.settings,
                false,
            )
            .await?;
            report.uploaded += 1;
            report.bytes += data.len() as u64;
            debug!("uploaded {}", key);
        }

        let metadata = RemoteMetadata::build(self.repo, set)?.to_json()?;
        self.transport.state_mut().data_is_precompressed = false;
        transfer::upload(
            self.transport.as_mut(),
            &self.ops,
            &self.config.name,
            &metadata_key(set),
            &metadata,
            &self.settings,
            false,
        )
        .await?;
        report.bytes += metadata.len() as u64;
        self.transport.disconnect().await?;

        tx.write_temp_ref(&TempRef {
            operation: "push".into(),
            remote: self.config.name.clone(),
            path: set_prefix(set),
            size: report.bytes,
            timestamp: chrono::Utc::now().timestamp(),
            checksum: djb_checksum_hex(&metadata),
        })?;
        self.ops.save()?;
        info!(
            "pushed set '{}' to '{}': {} uploaded, {} already present",
            set, self.config.name, report.uploaded, report.skipped
        );
        Ok(report)
    }

    /// Continue an interrupted push of `data` to `path` from its recorded offset
    pub async fn resume_push(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let key = paths::join_key(&[path]);
        if key.is_empty() {
            return Err(EmbrError::invalid("resume_push needs a remote path"));
        }
        let tx = Transaction::begin(self.repo.layout(), "push", &self.config.name, &key)?;
        let result = self.resume_inner(&tx, &key, data).await;
        self.finish(tx, "push", result).await
    }

    async fn resume_inner(&mut self, tx: &Transaction, key: &str, data: &[u8]) -> Result<()> {
        self.transport.connect().await?;
        transfer::upload(
            self.transport.as_mut(),
            &self.ops,
            &self.config.name,
            key,
            data,
            &self.settings,
            true,
        )
        .await?;
        self.transport.disconnect().await?;
        tx.write_temp_ref(&TempRef {
            operation: "push".into(),
            remote: self.config.name.clone(),
            path: key.to_string(),
            size: data.len() as u64,
            timestamp: chrono::Utc::now().timestamp(),
            checksum: djb_checksum_hex(data),
        })?;
        self.ops.save()
    }

    // ─────────────────────────────────────────────────────
    // Pull
    // ─────────────────────────────────────────────────────

    pub async fn pull(&mut self, options: &PullOptions) -> Result<PullReport> {
        let set = match &options.set {
            Some(set) => {
                paths::validate_set_name(set)?;
                set.clone()
            }
            None => self.repo.current_set()?,
        };
        let tx = Transaction::begin(self.repo.layout(), "pull", &self.config.name, &set_prefix(&set))?;
        let result = self.pull_inner(&tx, &set, options.prune).await;
        self.finish(tx, "pull", result).await
    }

    async fn pull_inner(&mut self, tx: &Transaction, set: &str, prune: bool) -> Result<PullReport> {
        let repo = self.repo;
        let store = repo.store();
        let mut report = PullReport {
            set: set.to_string(),
            ..Default::default()
        };

        self.transport.connect().await?;
        let listing = self.transport.list(&format!("{}/", set_prefix(set))).await?;
        let meta_key = metadata_key(set);

        let metadata = if listing.iter().any(|k| *k == meta_key) {
            let bytes = transfer::download(self.transport.as_mut(), &self.ops, &self.config.name, &meta_key).await?;
            Some((RemoteMetadata::from_json(&bytes)?, bytes))
        } else {
            warn!("remote '{}' has no {}", self.config.name, meta_key);
            None
        };

        // History is only rebuilt once every document is stored locally
        let fresh = !repo.layout().set_dir(set).is_dir()
            || (repo.index(set)?.is_empty() && repo.log_entries(set)?.is_empty());

        let docs_prefix = documents_prefix(set);
        let mut remote_hashes = HashSet::new();
        let mut bytes_in = 0u64;
        for key in listing.iter().filter(|k| k.starts_with(&docs_prefix)) {
            let Some(hash) = document_hash(key) else {
                debug!("ignoring remote file {}", key);
                continue;
            };
            remote_hashes.insert(hash);
            if store.exists(&hash) {
                report.skipped += 1;
                continue;
            }
            let data = transfer::download(self.transport.as_mut(), &self.ops, &self.config.name, key).await?;
            bytes_in += data.len() as u64;
            let written = if key.ends_with(".json") {
                let sidecar = metadata
                    .as_ref()
                    .map(|(m, _)| passthrough_metadata(m, &hash))
                    .unwrap_or_default();
                store.write(&data, &sidecar)?
            } else {
                self.transformer.inverse(&data)?.write_to(store)?
            };
            if written != hash {
                return Err(EmbrError::HashMismatch {
                    expected: hash.to_hex(),
                    actual: written.to_hex(),
                });
            }
            report.downloaded += 1;
        }

        match &metadata {
            Some((remote_meta, _)) if fresh => {
                remote_meta.rebuild(repo, set)?;
                report.rebuilt = true;
            }
            _ if !repo.layout().set_dir(set).is_dir() => repo.create_set_files(set)?,
            _ => {}
        }

        if prune {
            report.prune_candidates = self.prune_candidates(set, &remote_hashes)?;
        }
        self.transport.disconnect().await?;

        tx.write_temp_ref(&TempRef {
            operation: "pull".into(),
            remote: self.config.name.clone(),
            path: set_prefix(set),
            size: bytes_in,
            timestamp: chrono::Utc::now().timestamp(),
            checksum: metadata
                .as_ref()
                .map(|(_, bytes)| djb_checksum_hex(bytes))
                .unwrap_or_default(),
        })?;
        self.ops.save()?;
        info!(
            "pulled set '{}' from '{}': {} downloaded, {} already present",
            set, self.config.name, report.downloaded, report.skipped
        );
        Ok(report)
    }

    /// Local objects absent from the remote that no other set references
    fn prune_candidates(&self, set: &str, remote: &HashSet<ObjectHash>) -> Result<Vec<ObjectHash>> {
        let mut elsewhere = HashSet::new();
        for other in self.repo.set_names()? {
            if other == set {
                continue;
            }
            elsewhere.extend(self.repo.index(&other)?.into_iter().map(|e| e.hash));
            elsewhere.extend(self.repo.log_entries(&other)?.into_iter().map(|e| e.hash));
        }
        Ok(self
            .repo
            .store()
            .hashes()?
            .into_iter()
            .filter(|h| !remote.contains(h) && !elsewhere.contains(h))
            .collect())
    }

    /// Delete confirmed prune candidates, returning the number removed
    pub fn prune(&self, candidates: &[ObjectHash]) -> Result<usize> {
        let _lock = self.repo.write_lock()?;
        let mut removed = 0;
        for hash in candidates {
            if self.repo.store().exists(hash) {
                self.repo.store().remove(hash)?;
                removed += 1;
            }
        }
        info!("pruned {} local objects", removed);
        Ok(removed)
    }

    /// Persist operation state
    pub fn shutdown(self) -> Result<()> {
        self.ops.save()
    }
}

impl Drop for RemoteSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ops.save() {
            warn!("failed to save operation state: {}", e);
        }
    }
}

/// Sidecar for a text object taken from the remote `objects` entry
fn passthrough_metadata(remote: &RemoteMetadata, hash: &ObjectHash) -> Metadata {
    let mut sidecar = Metadata::new().with(meta::KEY_FILE_TYPE, "json");
    match remote.object(hash) {
        Some(object) => {
            sidecar.set(meta::KEY_SOURCE_FILE, object.path.as_str());
            sidecar.set(meta::KEY_MODEL, object.model.as_str());
            sidecar.set(meta::KEY_TIMESTAMP, object.created.to_string());
        }
        None => sidecar.set(meta::KEY_TIMESTAMP, chrono::Utc::now().timestamp().to_string()),
    }
    sidecar
}
