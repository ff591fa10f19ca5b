//! Repository layout and URL helpers
//!
//! Everything embr persists lives under the `.embr` marker directory at the
//! repository root. [`RepoLayout`] is the single place that knows the file
//! names; [`RemoteUrl`] parses the three supported remote URL forms.

use std::path::{Component, Path, PathBuf};

use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;

/// Name of the marker directory
pub const MARKER_DIR: &str = ".embr";

/// Longest accepted source path, in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Walk up from `start` until a directory containing `.embr` is found
pub fn find_repo_root(start: &Path) -> Result<PathBuf> {
    let start = if start.is_absolute() {
        start.to_path_buf()
    } else {
        std::env::current_dir()?.join(start)
    };
    start
        .ancestors()
        .find(|dir| dir.join(MARKER_DIR).is_dir())
        .map(Path::to_path_buf)
        .ok_or_else(|| EmbrError::NotInitialized(start.display().to_string()))
}

/// Paths of every file and directory under `.embr`
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
    dir: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(MARKER_DIR);
        Self { root, dir }
    }

    /// Working tree root (parent of `.embr`)
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.embr` directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.dir.join("objects")
    }

    pub fn object_raw(&self, hash: &ObjectHash) -> PathBuf {
        self.objects_dir().join(format!("{}.raw", hash))
    }

    pub fn object_meta(&self, hash: &ObjectHash) -> PathBuf {
        self.objects_dir().join(format!("{}.meta", hash))
    }

    pub fn sets_dir(&self) -> PathBuf {
        self.dir.join("sets")
    }

    pub fn set_dir(&self, set: &str) -> PathBuf {
        self.sets_dir().join(set)
    }

    pub fn set_index(&self, set: &str) -> PathBuf {
        self.set_dir(set).join("index")
    }

    pub fn set_log(&self, set: &str) -> PathBuf {
        self.set_dir(set).join("log")
    }

    pub fn set_model_refs(&self, set: &str) -> PathBuf {
        self.set_dir(set).join("refs").join("models")
    }

    pub fn model_ref(&self, set: &str, model: &str) -> PathBuf {
        self.set_model_refs(set).join(model)
    }

    pub fn head(&self) -> PathBuf {
        self.dir.join("HEAD")
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("config")
    }

    pub fn config_local(&self) -> PathBuf {
        self.dir.join("config.local")
    }

    pub fn remote_journal(&self) -> PathBuf {
        self.dir.join("REMOTE_JOURNAL")
    }

    pub fn remote_lock(&self) -> PathBuf {
        self.dir.join("REMOTE_LOCK")
    }

    pub fn remote_temp(&self) -> PathBuf {
        self.dir.join("REMOTE_TEMP")
    }

    pub fn remote_head(&self) -> PathBuf {
        self.dir.join("REMOTE_HEAD")
    }

    pub fn gc_lock(&self) -> PathBuf {
        self.dir.join("gc.lock")
    }

    pub fn operations_state(&self) -> PathBuf {
        self.dir.join("operations.state")
    }

    /// Express a path given from the working directory `cwd` relative to the root
    pub fn resolve(&self, cwd: &Path, path: &Path) -> Result<String> {
        self.relative_path(&cwd.join(path))
    }

    /// Express `path` relative to the repository root.
    ///
    /// Relative inputs are taken as already relative to the root. Paths are
    /// normalised to forward slashes without `.` components.
    pub fn relative_path(&self, path: &Path) -> Result<String> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| {
                EmbrError::invalid(format!(
                    "'{}' is outside the repository at '{}'",
                    path.display(),
                    self.root.display()
                ))
            })?
        } else {
            path
        };
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(EmbrError::invalid(format!(
                            "'{}' escapes the repository root",
                            path.display()
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }
        let joined = parts.join("/");
        validate_source_path(&joined)?;
        Ok(joined)
    }
}

/// Source paths are stored in space-separated line files
pub fn validate_source_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EmbrError::invalid("empty source path"));
    }
    if path.len() > MAX_PATH_LEN {
        let shown = path.char_indices().nth(64).map_or(path, |(i, _)| &path[..i]);
        return Err(EmbrError::PathTooLong(format!("{}... ({} bytes)", shown, path.len())));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(EmbrError::invalid(format!(
            "source path '{}' contains whitespace",
            path
        )));
    }
    Ok(())
}

/// Set names match `[A-Za-z0-9._-]+`
pub fn validate_set_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(EmbrError::invalid(format!(
            "invalid set name '{}' (allowed: letters, digits, '.', '_', '-')",
            name
        )))
    }
}

/// Model names become file names under `refs/models`
pub fn validate_model_name(model: &str) -> Result<()> {
    let ok = !model.is_empty()
        && model != "."
        && model != ".."
        && !model.contains('/')
        && !model.contains('\\')
        && !model.chars().any(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err(EmbrError::invalid(format!("invalid model name '{}'", model)))
    }
}

// ─────────────────────────────────────────────────────
// URLs and object keys
// ─────────────────────────────────────────────────────

/// Split `base?k=v&k2=v2` into the base and its decoded query pairs
pub fn split_query(url: &str) -> (&str, Vec<(String, String)>) {
    match url.split_once('?') {
        None => (url, Vec::new()),
        Some((base, query)) => {
            let pairs = query
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect();
            (base, pairs)
        }
    }
}

/// First value for `key` in a parsed query
pub fn query_param<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Join key segments with single slashes, dropping empty segments
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parsed remote location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUrl {
    /// `file:///abs/path` or a bare local path
    File { path: PathBuf },
    /// `http://` or `https://` base URL, without trailing slash
    Http { base: String },
    /// `s3://bucket/prefix?region=...&endpoint=...`
    S3 {
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

impl RemoteUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let (base, query) = split_query(url);
        if let Some(rest) = base.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(EmbrError::invalid(format!("missing bucket in '{}'", url)));
            }
            return Ok(RemoteUrl::S3 {
                bucket: bucket.to_string(),
                prefix: join_key(&[prefix]),
                region: query_param(&query, "region").map(str::to_string),
                endpoint: query_param(&query, "endpoint").map(str::to_string),
            });
        }
        if base.starts_with("http://") || base.starts_with("https://") {
            return Ok(RemoteUrl::Http {
                base: base.trim_end_matches('/').to_string(),
            });
        }
        if let Some(path) = base.strip_prefix("file://") {
            if path.is_empty() {
                return Err(EmbrError::invalid(format!("missing path in '{}'", url)));
            }
            return Ok(RemoteUrl::File {
                path: PathBuf::from(path),
            });
        }
        if base.contains("://") {
            return Err(EmbrError::Unsupported(format!("remote URL scheme in '{}'", url)));
        }
        if base.is_empty() {
            return Err(EmbrError::invalid("empty remote URL"));
        }
        Ok(RemoteUrl::File {
            path: PathBuf::from(base),
        })
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            RemoteUrl::File { .. } => "file",
            RemoteUrl::Http { .. } => "http",
            RemoteUrl::S3 { .. } => "s3",
        }
    }
}
