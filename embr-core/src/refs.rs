//! Index, log, model refs, and HEAD
//!
//! All of these are small line-oriented text files:
//!
//! ```text
//! index              <hash> <path>
//! log                <unix_ts> <hash> <path> <model>   (legacy: no model)
//! refs/models/<m>    <hash> <path>
//! HEAD               <set>  followed by optional "ref: <model> <hash>" lines
//! ```
//!
//! Index, refs, and HEAD are replaced wholesale through [`atomic_write`]. The
//! log is append-only; a trailing line without a newline is a write that never
//! finished and is ignored by readers.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;

/// Set used when HEAD is missing or empty
pub const DEFAULT_SET: &str = "main";

/// Model recorded for legacy three-field log lines
pub const UNKNOWN_MODEL: &str = "unknown";

/// Write `contents` to a sibling temp file, fsync it, and rename it over `path`
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EmbrError::invalid(format!("no parent directory for {:?}", path)))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Complete lines of a file; a missing file reads as empty
pub(crate) fn read_complete_lines(path: &Path) -> Result<Vec<String>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    // The last element is either "" (file ended with '\n') or a torn write
    if let Some(last) = lines.pop() {
        if !last.trim().is_empty() {
            debug!("ignoring partial trailing line in {:?}", path);
        }
    }
    Ok(lines)
}

// ─────────────────────────────────────────────────────
// Index and model refs
// ─────────────────────────────────────────────────────

/// `(hash, path)` row shared by the index and model ref files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub hash: ObjectHash,
    pub path: String,
}

impl RefEntry {
    pub fn new(hash: ObjectHash, path: impl Into<String>) -> Self {
        Self {
            hash,
            path: path.into(),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let (hash, path) = line.trim().split_once(char::is_whitespace)?;
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        Some(Self {
            hash: ObjectHash::from_hex(hash).ok()?,
            path: path.to_string(),
        })
    }
}

pub fn read_ref_entries(path: &Path) -> Result<Vec<RefEntry>> {
    Ok(read_complete_lines(path)?
        .iter()
        .filter_map(|l| RefEntry::parse(l))
        .collect())
}

pub fn write_ref_entries(path: &Path, entries: &[RefEntry]) -> Result<()> {
    let text: String = entries
        .iter()
        .map(|e| format!("{} {}\n", e.hash, e.path))
        .collect();
    atomic_write(path, text.as_bytes())
}

/// Replace every line for `path` with a single `(hash, path)` line
pub fn replace_ref_line(file: &Path, hash: ObjectHash, path: &str) -> Result<()> {
    let mut entries = read_ref_entries(file)?;
    entries.retain(|e| e.path != path);
    entries.push(RefEntry::new(hash, path));
    write_ref_entries(file, &entries)
}

// ─────────────────────────────────────────────────────
// Log
// ─────────────────────────────────────────────────────

/// One history record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: i64,
    pub hash: ObjectHash,
    pub path: String,
    /// `None` for legacy three-field lines
    pub model: Option<String>,
}

impl LogEntry {
    pub fn new(timestamp: i64, hash: ObjectHash, path: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            timestamp,
            hash,
            path: path.into(),
            model: Some(model.into()),
        }
    }

    pub fn model_or_unknown(&self) -> &str {
        self.model.as_deref().unwrap_or(UNKNOWN_MODEL)
    }

    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (ts, hash, path, model) = match fields.as_slice() {
            [ts, hash, path] => (ts, hash, path, None),
            [ts, hash, path, model] => (ts, hash, path, Some(model.to_string())),
            _ => return None,
        };
        Some(Self {
            timestamp: ts.parse().ok()?,
            hash: ObjectHash::from_hex(hash).ok()?,
            path: path.to_string(),
            model,
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.timestamp,
            self.hash,
            self.path,
            self.model_or_unknown()
        )
    }
}

pub fn read_log(path: &Path) -> Result<Vec<LogEntry>> {
    Ok(read_complete_lines(path)?
        .iter()
        .filter_map(|l| LogEntry::parse(l))
        .collect())
}

/// Append one entry and fsync. Always writes the four-field form.
pub fn append_log(path: &Path, entry: &LogEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(entry.to_line().as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Rewrite the whole log, used when rebuilding from a remote
pub fn write_log(path: &Path, entries: &[LogEntry]) -> Result<()> {
    let text: String = entries.iter().map(LogEntry::to_line).collect();
    atomic_write(path, text.as_bytes())
}

// ─────────────────────────────────────────────────────
// HEAD
// ─────────────────────────────────────────────────────

/// Contents of HEAD: the current set plus optional per-model head lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub set: String,
    pub model_heads: Vec<(String, ObjectHash)>,
}

impl Head {
    pub fn new(set: impl Into<String>) -> Self {
        Self {
            set: set.into(),
            model_heads: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut set = None;
        let mut model_heads = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("ref:") {
                let mut parts = rest.split_whitespace();
                if let (Some(model), Some(hash)) = (parts.next(), parts.next()) {
                    if let Ok(hash) = ObjectHash::from_hex(hash) {
                        model_heads.push((model.to_string(), hash));
                    }
                }
            } else if set.is_none() {
                set = Some(line.to_string());
            }
        }
        Ok(Self {
            set: set.unwrap_or_else(|| DEFAULT_SET.to_string()),
            model_heads,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = format!("{}\n", self.set);
        for (model, hash) in &self.model_heads {
            text.push_str(&format!("ref: {} {}\n", model, hash));
        }
        atomic_write(path, text.as_bytes())
    }

    /// Update an existing per-model line; returns false when the model is not tracked
    pub fn update_model_head(&mut self, model: &str, hash: ObjectHash) -> bool {
        match self.model_heads.iter_mut().find(|(m, _)| m == model) {
            Some(entry) => {
                entry.1 = hash;
                true
            }
            None => false,
        }
    }
}
