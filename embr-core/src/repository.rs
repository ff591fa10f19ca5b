//! Repository facade
//!
//! Ties the object store to the per-set index, log, and model refs. Every
//! mutation of index/log/refs/HEAD runs under the repository write lock
//! (`REMOTE_LOCK`), which is also what remote transactions hold.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{self, PayloadFormat};
use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;
use crate::lock::PidLock;
use crate::meta::{self, Metadata};
use crate::paths::{self, RepoLayout, MARKER_DIR};
use crate::refs::{self, Head, LogEntry, RefEntry, DEFAULT_SET};
use crate::store::{self, ObjectStore};

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_DELAY: Duration = Duration::from_millis(100);

/// Result of storing one embedding
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub hash: ObjectHash,
    pub path: String,
    pub model: String,
    /// The payload was already present in the object store
    pub existed: bool,
}

/// Filter for [`Repository::log`]
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub set: Option<String>,
    pub path: Option<String>,
    pub model: Option<String>,
    /// Keep only the newest N entries
    pub limit: Option<usize>,
}

/// Head and history of one model for a path
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub model: String,
    pub current: Option<ObjectHash>,
    /// Oldest first
    pub history: Vec<LogEntry>,
}

impl ModelStatus {
    /// Timestamp of the log entry that introduced the current hash
    pub fn current_timestamp(&self) -> Option<i64> {
        let current = self.current?;
        self.history
            .iter()
            .rev()
            .find(|e| e.hash == current)
            .map(|e| e.timestamp)
    }
}

/// Per-model state of one source path
#[derive(Debug, Clone)]
pub struct PathStatus {
    pub path: String,
    pub set: String,
    pub models: Vec<ModelStatus>,
}

/// Similarity between two embeddings
#[derive(Debug, Clone, PartialEq)]
pub struct DiffReport {
    pub a: ObjectHash,
    pub b: ObjectHash,
    pub dimensions: usize,
    /// Cosine similarity in `[-1, 1]`; 0 when either vector has zero norm
    pub cosine: f64,
    pub euclidean_distance: f64,
    /// `1 / (1 + distance)`
    pub euclidean_similarity: f64,
}

impl DiffReport {
    pub fn similarity_percent(&self) -> f64 {
        self.cosine * 100.0
    }
}

/// Outcome of [`Repository::remove`]
#[derive(Debug, Clone, Default)]
pub struct RemoveReport {
    /// Hashes whose bindings to the path were dropped
    pub unbound: Vec<ObjectHash>,
    /// Objects deleted because nothing references them any more
    pub deleted: Vec<ObjectHash>,
}

/// Saved contents of files about to be rewritten, restored if a later step fails
pub(crate) struct Rewrite {
    saved: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl Rewrite {
    pub(crate) fn capture(paths: &[PathBuf]) -> Result<Self> {
        let mut saved = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = match fs::read(path) {
                Ok(c) => Some(c),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            saved.push((path.clone(), contents));
        }
        Ok(Self { saved })
    }

    pub(crate) fn restore(self) {
        for (path, contents) in self.saved {
            let result = match contents {
                Some(c) => refs::atomic_write(&path, &c),
                None => fs::remove_file(&path).or_else(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => Ok(()),
                    _ => Err(e),
                }).map_err(EmbrError::from),
            };
            if let Err(e) = result {
                warn!("failed to restore {:?}: {}", path, e);
            }
        }
    }
}

/// An embr repository on disk
#[derive(Debug, Clone)]
pub struct Repository {
    layout: RepoLayout,
    store: ObjectStore,
}

impl Repository {
    /// Create `.embr` under `root` with the default set. Re-running is harmless.
    pub fn init(root: &Path) -> Result<Self> {
        let repo = Self::at(root);
        let fresh = !repo.layout.dir().exists();
        fs::create_dir_all(repo.layout.objects_dir())?;
        fs::create_dir_all(repo.layout.sets_dir())?;
        if !repo.layout.set_dir(DEFAULT_SET).is_dir() {
            repo.create_set_files(DEFAULT_SET)?;
        }
        if !repo.layout.head().is_file() {
            Head::new(DEFAULT_SET).write(&repo.layout.head())?;
        }
        if fresh {
            info!("Initialized empty embr repository in {:?}", repo.layout.dir());
        } else {
            info!("Reinitialized existing embr repository in {:?}", repo.layout.dir());
        }
        Ok(repo)
    }

    /// Open the repository containing `start`
    pub fn open(start: &Path) -> Result<Self> {
        let root = paths::find_repo_root(start)?;
        Ok(Self::at(&root))
    }

    fn at(root: &Path) -> Self {
        let layout = RepoLayout::new(root);
        let store = ObjectStore::new(layout.objects_dir());
        Self { layout, store }
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Exclusive repository write lock
    pub fn write_lock(&self) -> Result<PidLock> {
        PidLock::acquire_with_retry(&self.layout.remote_lock(), LOCK_ATTEMPTS, LOCK_DELAY)
    }

    pub fn head(&self) -> Result<Head> {
        Head::read(&self.layout.head())
    }

    /// Name of the active set
    pub fn current_set(&self) -> Result<String> {
        Ok(self.head()?.set)
    }

    pub(crate) fn set_or_current(&self, set: Option<&str>) -> Result<String> {
        let name = match set {
            Some(s) => s.to_string(),
            None => self.current_set()?,
        };
        self.require_set(&name)?;
        Ok(name)
    }

    pub(crate) fn require_set(&self, name: &str) -> Result<()> {
        paths::validate_set_name(name)?;
        if self.layout.set_dir(name).is_dir() {
            Ok(())
        } else {
            Err(EmbrError::not_found(format!("set '{}'", name)))
        }
    }

    pub(crate) fn create_set_files(&self, name: &str) -> Result<()> {
        fs::create_dir_all(self.layout.set_model_refs(name))?;
        for file in [self.layout.set_index(name), self.layout.set_log(name)] {
            if !file.exists() {
                refs::atomic_write(&file, b"")?;
            }
        }
        Ok(())
    }

    pub fn index(&self, set: &str) -> Result<Vec<RefEntry>> {
        refs::read_ref_entries(&self.layout.set_index(set))
    }

    pub fn log_entries(&self, set: &str) -> Result<Vec<LogEntry>> {
        refs::read_log(&self.layout.set_log(set))
    }

    /// Models with a ref file in `set`, sorted
    pub fn models(&self, set: &str) -> Result<Vec<String>> {
        let dir = self.layout.set_model_refs(set);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut models = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with('.') {
                    models.push(name);
                }
            }
        }
        models.sort();
        Ok(models)
    }

    pub fn model_ref(&self, set: &str, model: &str) -> Result<Vec<RefEntry>> {
        refs::read_ref_entries(&self.layout.model_ref(set, model))
    }

    /// Model of an index row: the newest log entry binding `hash` to `path`,
    /// then the object's sidecar
    pub(crate) fn model_for(&self, hash: &ObjectHash, path: &str, log: &[LogEntry]) -> Option<String> {
        log.iter()
            .rev()
            .find(|e| e.hash == *hash && e.path == path)
            .and_then(|e| e.model.clone())
            .or_else(|| self.store.model_of(hash))
    }

    // ─────────────────────────────────────────────────────
    // Store
    // ─────────────────────────────────────────────────────

    /// Store a precomputed embedding for `source` under `model` in the current set
    pub fn store_embedding(&self, payload: &[u8], source: &Path, model: &str) -> Result<StoreOutcome> {
        paths::validate_model_name(model)?;
        let path = self.layout.relative_path(source)?;
        if payload.is_empty() {
            return Err(EmbrError::invalid("empty embedding payload"));
        }
        let format = PayloadFormat::detect(payload);
        let timestamp = chrono::Utc::now().timestamp();
        let mut metadata = Metadata::new()
            .with(meta::KEY_SOURCE_FILE, path.as_str())
            .with(meta::KEY_TIMESTAMP, timestamp.to_string())
            .with(meta::KEY_FILE_TYPE, format.as_str())
            .with(meta::KEY_MODEL, model);
        if format != PayloadFormat::Text {
            let (values, _) = codec::decode_vector(payload)?;
            metadata.set(meta::KEY_DIMENSIONS, values.len().to_string());
        }

        let _lock = self.write_lock()?;
        let set = self.current_set()?;
        self.require_set(&set)?;
        let existed = self.store.exists(&ObjectHash::from_data(payload));
        let hash = self.store.write(payload, &metadata)?;
        self.record(&set, hash, &path, model, timestamp)?;
        info!("stored {} for {} ({}) in set '{}'", hash.short(12), path, model, set);
        Ok(StoreOutcome {
            hash,
            path,
            model: model.to_string(),
            existed,
        })
    }

    /// Append a log entry and point index/model ref at `hash`. Caller holds the lock.
    pub(crate) fn record(&self, set: &str, hash: ObjectHash, path: &str, model: &str, timestamp: i64) -> Result<()> {
        let log_path = self.layout.set_log(set);
        let log_len = fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
        let rewrite = Rewrite::capture(&self.binding_files(set, model))?;
        let result = refs::append_log(&log_path, &LogEntry::new(timestamp, hash, path, model))
            .and_then(|_| self.bind(set, hash, path, model));
        if let Err(e) = result {
            rewrite.restore();
            truncate_to(&log_path, log_len);
            return Err(e);
        }
        Ok(())
    }

    fn binding_files(&self, set: &str, model: &str) -> Vec<PathBuf> {
        vec![
            self.layout.set_index(set),
            self.layout.model_ref(set, model),
            self.layout.head(),
        ]
    }

    /// Rewrite index, model ref, and HEAD's model line so `(path, model)` resolves to `hash`
    pub(crate) fn bind(&self, set: &str, hash: ObjectHash, path: &str, model: &str) -> Result<()> {
        let index_path = self.layout.set_index(set);
        let log = self.log_entries(set)?;
        let mut index = refs::read_ref_entries(&index_path)?;
        index.retain(|e| {
            e.path != path
                || (e.hash != hash && self.model_for(&e.hash, &e.path, &log).as_deref() != Some(model))
        });
        index.push(RefEntry::new(hash, path));
        refs::write_ref_entries(&index_path, &index)?;

        refs::replace_ref_line(&self.layout.model_ref(set, model), hash, path)?;

        let mut head = self.head()?;
        if head.set == set && head.update_model_head(model, hash) {
            head.write(&self.layout.head())?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // History and status
    // ─────────────────────────────────────────────────────

    /// Log entries, newest first
    pub fn log(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let set = self.set_or_current(query.set.as_deref())?;
        let mut entries: Vec<LogEntry> = self
            .log_entries(&set)?
            .into_iter()
            .filter(|e| query.path.as_deref().is_none_or(|p| e.path == p))
            .filter(|e| {
                query
                    .model
                    .as_deref()
                    .is_none_or(|m| self.entry_model(e).as_deref() == Some(m))
            })
            .collect();
        entries.reverse();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Model of a log entry, consulting the sidecar for legacy lines
    fn entry_model(&self, entry: &LogEntry) -> Option<String> {
        entry
            .model
            .clone()
            .or_else(|| self.store.model_of(&entry.hash))
    }

    /// Current hash and history of every model tracking `source`
    pub fn status(&self, source: &Path) -> Result<PathStatus> {
        let path = self.layout.relative_path(source)?;
        let set = self.set_or_current(None)?;
        let log: Vec<LogEntry> = self
            .log_entries(&set)?
            .into_iter()
            .filter(|e| e.path == path)
            .collect();

        let mut models = BTreeSet::new();
        for entry in &log {
            models.insert(
                self.entry_model(entry)
                    .unwrap_or_else(|| refs::UNKNOWN_MODEL.to_string()),
            );
        }
        for model in self.models(&set)? {
            if self.model_ref(&set, &model)?.iter().any(|e| e.path == path) {
                models.insert(model);
            }
        }
        if models.is_empty() {
            return Err(EmbrError::not_found(format!("'{}' is not tracked in set '{}'", path, set)));
        }

        let mut statuses = Vec::new();
        for model in models {
            let current = self
                .model_ref(&set, &model)?
                .into_iter()
                .find(|e| e.path == path)
                .map(|e| e.hash);
            let history = log
                .iter()
                .filter(|e| self.entry_model(e).as_deref().unwrap_or(refs::UNKNOWN_MODEL) == model)
                .cloned()
                .collect();
            statuses.push(ModelStatus {
                model,
                current,
                history,
            });
        }
        Ok(PathStatus {
            path,
            set,
            models: statuses,
        })
    }

    // ─────────────────────────────────────────────────────
    // Rollback
    // ─────────────────────────────────────────────────────

    /// Resolve a prefix among log entries of the current set for `path` (and `model`)
    pub fn resolve_with_context(&self, prefix: &str, source: &Path, model: Option<&str>) -> Result<ObjectHash> {
        let path = self.layout.relative_path(source)?;
        let set = self.current_set()?;
        let candidates: Vec<ObjectHash> = self
            .log_entries(&set)?
            .into_iter()
            .filter(|e| e.path == path)
            .filter(|e| model.is_none_or(|m| self.entry_model(e).as_deref() == Some(m)))
            .map(|e| e.hash)
            .collect();
        store::resolve_among(prefix, candidates).map_err(|e| match e {
            EmbrError::NotFound(_) => EmbrError::not_found(format!(
                "no entry for '{}' matches '{}'{}",
                path,
                prefix,
                model.map(|m| format!(" under model '{}'", m)).unwrap_or_default()
            )),
            other => other,
        })
    }

    /// Point `(path, model)` back at an earlier embedding and return its full hash.
    ///
    /// The index, model ref, and HEAD are rewritten together; a failure in any
    /// step restores all three.
    pub fn rollback(&self, prefix: &str, source: &Path, model: Option<&str>) -> Result<ObjectHash> {
        let path = self.layout.relative_path(source)?;
        let _lock = self.write_lock()?;
        let hash = self.resolve_with_context(prefix, source, model)?;
        if !self.store.exists(&hash) {
            return Err(EmbrError::not_found(format!("object {} is missing from the store", hash)));
        }
        let set = self.current_set()?;
        let model = match model {
            Some(m) => m.to_string(),
            None => {
                let log = self.log_entries(&set)?;
                log.iter()
                    .rev()
                    .find(|e| e.hash == hash && e.path == path)
                    .and_then(|e| e.model.clone())
                    .or_else(|| self.store.model_of(&hash))
                    .unwrap_or_else(|| refs::UNKNOWN_MODEL.to_string())
            }
        };

        let rewrite = Rewrite::capture(&self.binding_files(&set, &model))?;
        if let Err(e) = self.bind(&set, hash, &path, &model) {
            rewrite.restore();
            return Err(e);
        }
        info!("rolled back {} ({}) to {}", path, model, hash.short(12));
        Ok(hash)
    }

    // ─────────────────────────────────────────────────────
    // Diff, remove, export
    // ─────────────────────────────────────────────────────

    /// Compare two stored embeddings
    pub fn diff(&self, a: &str, b: &str) -> Result<DiffReport> {
        let ha = self.store.resolve(a)?;
        let hb = self.store.resolve(b)?;
        let (va, _) = self.store.read_vector(&ha)?;
        let (vb, _) = self.store.read_vector(&hb)?;
        if va.len() != vb.len() {
            return Err(EmbrError::DimensionMismatch {
                left: va.len(),
                right: vb.len(),
            });
        }
        let (mut dot, mut na, mut nb, mut dist) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for (x, y) in va.iter().zip(&vb) {
            let (x, y) = (*x as f64, *y as f64);
            dot += x * y;
            na += x * x;
            nb += y * y;
            dist += (x - y) * (x - y);
        }
        let cosine = if na <= 0.0 || nb <= 0.0 {
            0.0
        } else {
            dot / (na.sqrt() * nb.sqrt())
        };
        let distance = dist.sqrt();
        Ok(DiffReport {
            a: ha,
            b: hb,
            dimensions: va.len(),
            cosine,
            euclidean_distance: distance,
            euclidean_similarity: 1.0 / (1.0 + distance),
        })
    }

    /// Stop tracking `source` (or only its `model` embedding) in the current set.
    ///
    /// Unless `cached`, objects left unreferenced by every set's index and refs
    /// are deleted. The log keeps its history.
    pub fn remove(&self, source: &Path, model: Option<&str>, cached: bool) -> Result<RemoveReport> {
        let path = self.layout.relative_path(source)?;
        let _lock = self.write_lock()?;
        let set = self.current_set()?;
        let log = self.log_entries(&set)?;
        let index_path = self.layout.set_index(&set);
        let mut index = refs::read_ref_entries(&index_path)?;

        let matches = |e: &RefEntry| {
            e.path == path
                && model.is_none_or(|m| self.model_for(&e.hash, &e.path, &log).as_deref() == Some(m))
        };
        let unbound: Vec<ObjectHash> = index.iter().filter(|e| matches(e)).map(|e| e.hash).collect();
        if unbound.is_empty() {
            return Err(EmbrError::not_found(format!("'{}' is not tracked in set '{}'", path, set)));
        }

        let models: Vec<String> = match model {
            Some(m) => vec![m.to_string()],
            None => self.models(&set)?,
        };
        let mut files = vec![index_path.clone()];
        files.extend(models.iter().map(|m| self.layout.model_ref(&set, m)));
        let rewrite = Rewrite::capture(&files)?;
        let result = (|| {
            index.retain(|e| !matches(e));
            refs::write_ref_entries(&index_path, &index)?;
            for m in &models {
                let ref_path = self.layout.model_ref(&set, m);
                let mut entries = refs::read_ref_entries(&ref_path)?;
                let before = entries.len();
                entries.retain(|e| e.path != path);
                if entries.len() != before {
                    refs::write_ref_entries(&ref_path, &entries)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            rewrite.restore();
            return Err(e);
        }

        let mut report = RemoveReport {
            unbound,
            deleted: Vec::new(),
        };
        if !cached {
            let still_bound = self.bound_hashes()?;
            for hash in &report.unbound {
                if !still_bound.contains(hash) && self.store.exists(hash) {
                    self.store.remove(hash)?;
                    report.deleted.push(*hash);
                }
            }
        }
        debug!("removed {} binding(s) for {}", report.unbound.len(), path);
        Ok(report)
    }

    /// Write the decoded payload of an object to `output`
    pub fn export(&self, prefix: &str, output: &Path, force: bool) -> Result<ObjectHash> {
        let hash = self.store.resolve(prefix)?;
        if output.exists() && !force {
            return Err(EmbrError::AlreadyExists(format!(
                "output file '{}' (use --force to overwrite)",
                output.display()
            )));
        }
        let payload = self.store.read_payload(&hash)?;
        refs::atomic_write(output, &payload)?;
        Ok(hash)
    }

    // ─────────────────────────────────────────────────────
    // Reachability
    // ─────────────────────────────────────────────────────

    /// Names of every set directory, sorted
    pub fn set_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.layout.sets_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if paths::validate_set_name(&name).is_ok() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Hashes named by any set's index or model refs
    fn bound_hashes(&self) -> Result<HashSet<ObjectHash>> {
        let mut hashes = HashSet::new();
        for set in self.set_names()? {
            hashes.extend(self.index(&set)?.into_iter().map(|e| e.hash));
            for model in self.models(&set)? {
                hashes.extend(self.model_ref(&set, &model)?.into_iter().map(|e| e.hash));
            }
        }
        Ok(hashes)
    }

    /// Hashes reachable from any set's index, log, or model refs, or from HEAD
    pub fn referenced_hashes(&self) -> Result<HashSet<ObjectHash>> {
        let mut hashes = self.bound_hashes()?;
        for set in self.set_names()? {
            hashes.extend(self.log_entries(&set)?.into_iter().map(|e| e.hash));
        }
        // Repositories from before sets kept a single index and log in .embr
        for legacy in [self.layout.dir().join("index"), self.layout.dir().join("log")] {
            if legacy.is_file() {
                hashes.extend(refs::read_ref_entries(&legacy)?.into_iter().map(|e| e.hash));
                hashes.extend(refs::read_log(&legacy)?.into_iter().map(|e| e.hash));
            }
        }
        hashes.extend(self.head()?.model_heads.into_iter().map(|(_, h)| h));
        Ok(hashes)
    }
}

fn truncate_to(path: &Path, len: u64) {
    let result = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(len));
    if let Err(e) = result {
        warn!("failed to truncate {:?} back to {} bytes: {}", path, len, e);
    }
}

/// True if `dir` looks like a repository root
pub fn is_repository(dir: &Path) -> bool {
    dir.join(MARKER_DIR).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_raw;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        (temp_dir, repo)
    }

    #[test]
    fn test_init_creates_layout() {
        let (tmp, repo) = repo();
        assert!(is_repository(tmp.path()));
        assert_eq!(repo.current_set().unwrap(), "main");
        assert!(repo.layout().set_index("main").is_file());
        assert!(repo.layout().set_log("main").is_file());
        assert!(repo.layout().set_model_refs("main").is_dir());
        // Idempotent
        Repository::init(tmp.path()).unwrap();
        assert_eq!(repo.current_set().unwrap(), "main");
    }

    #[test]
    fn test_open_from_subdirectory() {
        let (tmp, _repo) = repo();
        let nested = tmp.path().join("docs");
        fs::create_dir(&nested).unwrap();
        let opened = Repository::open(&nested).unwrap();
        assert_eq!(opened.root(), tmp.path());
    }

    #[test]
    fn test_store_updates_log_index_and_ref() {
        let (_tmp, repo) = repo();
        let out = repo
            .store_embedding(&encode_raw(&[1.0, 2.0]), Path::new("a.txt"), "m1")
            .unwrap();
        assert!(!out.existed);
        assert_eq!(repo.index("main").unwrap(), vec![RefEntry::new(out.hash, "a.txt")]);
        assert_eq!(repo.model_ref("main", "m1").unwrap(), vec![RefEntry::new(out.hash, "a.txt")]);
        let log = repo.log_entries("main").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].model.as_deref(), Some("m1"));

        let meta = repo.store().read_meta(&out.hash).unwrap();
        assert_eq!(meta.source_file(), Some("a.txt"));
        assert_eq!(meta.file_type(), Some("bin"));
        assert_eq!(meta.dimensions(), Some(2));
        assert!(!repo.layout().remote_lock().exists());
    }

    #[test]
    fn test_store_keeps_one_index_row_per_model() {
        let (_tmp, repo) = repo();
        let a1 = repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        let b1 = repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m2").unwrap();
        let a2 = repo.store_embedding(&encode_raw(&[3.0]), Path::new("a"), "m1").unwrap();

        let index = repo.index("main").unwrap();
        assert_eq!(index, vec![RefEntry::new(b1.hash, "a"), RefEntry::new(a2.hash, "a")]);
        assert!(!index.iter().any(|e| e.hash == a1.hash));
        assert_eq!(repo.log_entries("main").unwrap().len(), 3);
    }

    #[test]
    fn test_shared_payload_keeps_each_binding_model() {
        let (_tmp, repo) = repo();
        let shared = encode_raw(&[4.0, 4.0]);
        let a = repo.store_embedding(&shared, Path::new("a"), "m1").unwrap();
        repo.store_embedding(&shared, Path::new("b"), "m2").unwrap();
        assert_eq!(repo.store().model_of(&a.hash).as_deref(), Some("m1"));

        let a2 = repo.store_embedding(&encode_raw(&[5.0]), Path::new("a"), "m1").unwrap();
        assert_eq!(
            repo.index("main").unwrap(),
            vec![RefEntry::new(a.hash, "b"), RefEntry::new(a2.hash, "a")]
        );
        let report = repo.remove(Path::new("b"), Some("m2"), true).unwrap();
        assert_eq!(report.unbound, vec![a.hash]);
    }

    #[test]
    fn test_store_rejects_bad_input() {
        let (_tmp, repo) = repo();
        assert!(repo.store_embedding(b"", Path::new("a"), "m1").is_err());
        assert!(repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "bad model").is_err());
        assert!(repo.store_embedding(&encode_raw(&[1.0]), Path::new("a b"), "m1").is_err());
    }

    #[test]
    fn test_log_query_filters_newest_first() {
        let (_tmp, repo) = repo();
        repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        repo.store_embedding(&encode_raw(&[2.0]), Path::new("b"), "m1").unwrap();
        let last = repo.store_embedding(&encode_raw(&[3.0]), Path::new("a"), "m2").unwrap();

        let all = repo.log(&LogQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].hash, last.hash);

        let only_a = repo.log(&LogQuery { path: Some("a".into()), ..Default::default() }).unwrap();
        assert_eq!(only_a.len(), 2);
        let m2 = repo.log(&LogQuery { model: Some("m2".into()), ..Default::default() }).unwrap();
        assert_eq!(m2.len(), 1);
        let limited = repo.log(&LogQuery { limit: Some(1), ..Default::default() }).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_rollback_restores_earlier_hash() {
        let (_tmp, repo) = repo();
        let first = repo.store_embedding(&encode_raw(&[1.0, 2.0]), Path::new("a"), "m1").unwrap();
        let second = repo.store_embedding(&encode_raw(&[2.0, 3.0]), Path::new("a"), "m1").unwrap();

        let status = repo.status(Path::new("a")).unwrap();
        assert_eq!(status.models[0].current, Some(second.hash));

        let resolved = repo.rollback(&first.hash.short(10), Path::new("a"), None).unwrap();
        assert_eq!(resolved, first.hash);
        let status = repo.status(Path::new("a")).unwrap();
        assert_eq!(status.models[0].current, Some(first.hash));
        assert_eq!(status.models[0].history.len(), 2);
        assert_eq!(repo.index("main").unwrap(), vec![RefEntry::new(first.hash, "a")]);
    }

    #[test]
    fn test_rollback_rejects_other_paths_hash() {
        let (_tmp, repo) = repo();
        let other = repo.store_embedding(&encode_raw(&[5.0]), Path::new("b"), "m1").unwrap();
        repo.store_embedding(&encode_raw(&[6.0]), Path::new("a"), "m1").unwrap();
        let err = repo.rollback(&other.hash.short(10), Path::new("a"), None).unwrap_err();
        assert!(matches!(err, EmbrError::NotFound(_)));
    }

    #[test]
    fn test_rollback_updates_tracked_head_line() {
        let (_tmp, repo) = repo();
        let first = repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        let second = repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m1").unwrap();
        fs::write(repo.layout().head(), format!("main\nref: m1 {}\n", second.hash)).unwrap();

        repo.rollback(&first.hash.to_hex(), Path::new("a"), Some("m1")).unwrap();
        assert_eq!(repo.head().unwrap().model_heads, vec![("m1".to_string(), first.hash)]);
    }

    #[test]
    fn test_diff_identical_and_mismatch() {
        let (_tmp, repo) = repo();
        let a = repo.store_embedding(&encode_raw(&[1.0, 0.0]), Path::new("a"), "m1").unwrap();
        let b = repo.store_embedding(&encode_raw(&[0.0, 1.0]), Path::new("b"), "m1").unwrap();
        let c = repo.store_embedding(&encode_raw(&[1.0, 0.0, 0.0]), Path::new("c"), "m1").unwrap();

        let same = repo.diff(&a.hash.to_hex(), &a.hash.to_hex()).unwrap();
        assert!((same.similarity_percent() - 100.0).abs() < 1e-9);
        assert_eq!(same.euclidean_similarity, 1.0);

        let orth = repo.diff(&a.hash.to_hex(), &b.hash.to_hex()).unwrap();
        assert!(orth.cosine.abs() < 1e-9);

        assert!(matches!(
            repo.diff(&a.hash.to_hex(), &c.hash.to_hex()).unwrap_err(),
            EmbrError::DimensionMismatch { left: 2, right: 3 }
        ));
    }

    #[test]
    fn test_remove_model_and_cached() {
        let (_tmp, repo) = repo();
        let m1 = repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        let m2 = repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m2").unwrap();

        let report = repo.remove(Path::new("a"), Some("m1"), true).unwrap();
        assert_eq!(report.unbound, vec![m1.hash]);
        assert!(report.deleted.is_empty());
        assert!(repo.store().exists(&m1.hash));
        assert_eq!(repo.index("main").unwrap(), vec![RefEntry::new(m2.hash, "a")]);
        assert!(repo.model_ref("main", "m1").unwrap().is_empty());

        let report = repo.remove(Path::new("a"), None, false).unwrap();
        assert_eq!(report.deleted, vec![m2.hash]);
        assert!(!repo.store().exists(&m2.hash));
        assert!(repo.remove(Path::new("a"), None, false).is_err());
        // History is kept
        assert_eq!(repo.log_entries("main").unwrap().len(), 2);
    }

    #[test]
    fn test_export_requires_force() {
        let (tmp, repo) = repo();
        let payload = encode_raw(&[1.0, 2.0]);
        let out = repo.store_embedding(&payload, Path::new("a"), "m1").unwrap();
        let target = tmp.path().join("out.bin");

        repo.export(&out.hash.short(8), &target, false).unwrap();
        assert_eq!(fs::read(&target).unwrap(), payload);
        assert!(matches!(
            repo.export(&out.hash.short(8), &target, false).unwrap_err(),
            EmbrError::AlreadyExists(_)
        ));
        repo.export(&out.hash.short(8), &target, true).unwrap();
    }
}
