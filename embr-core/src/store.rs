//! Content-addressed object store
//!
//! Objects live in `.embr/objects` as `<hash>.raw` (native form, see
//! [`crate::object`]) with a `<hash>.meta` sidecar. Objects are immutable;
//! writing a payload that already exists leaves both files untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::codec::{self, PayloadFormat};
use crate::error::{EmbrError, Result};
use crate::hash::{is_hash_prefix, ObjectHash, HASH_HEX_LEN};
use crate::meta::{self, Metadata};
use crate::object::{self, DecodedObject};
use crate::refs::atomic_write;

/// Summary of one stored object
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub hash: ObjectHash,
    /// Size of `<hash>.raw` plus `<hash>.meta` on disk
    pub size: u64,
    pub modified: SystemTime,
}

/// File-backed object store rooted at an `objects` directory
#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
    level: i32,
}

impl ObjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            level: codec::DEFAULT_LEVEL,
        }
    }

    /// Override the ZSTD level used for new objects (0 stores uncompressed)
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn raw_path(&self, hash: &ObjectHash) -> PathBuf {
        self.dir.join(format!("{}.raw", hash))
    }

    pub fn meta_path(&self, hash: &ObjectHash) -> PathBuf {
        self.dir.join(format!("{}.meta", hash))
    }

    pub fn exists(&self, hash: &ObjectHash) -> bool {
        self.raw_path(hash).is_file()
    }

    /// Store a payload and its metadata, returning the content hash.
    ///
    /// The sidecar is written before the object so an interrupted write leaves
    /// at most an orphaned `.meta`, which garbage collection removes.
    pub fn write(&self, payload: &[u8], metadata: &Metadata) -> Result<ObjectHash> {
        fs::create_dir_all(&self.dir)?;
        let hash = ObjectHash::from_data(payload);
        let raw_path = self.raw_path(&hash);
        let meta_path = self.meta_path(&hash);
        if raw_path.is_file() {
            if !meta_path.is_file() {
                atomic_write(&meta_path, metadata.to_text().as_bytes())?;
            }
            debug!("object {} already stored", hash.short(12));
        } else {
            atomic_write(&meta_path, metadata.to_text().as_bytes())?;
            let (encoded_hash, bytes) = object::encode_object(payload, self.level)?;
            debug_assert_eq!(encoded_hash, hash);
            atomic_write(&raw_path, &bytes)?;
            debug!("stored object {} ({} bytes)", hash.short(12), payload.len());
        }
        Ok(hash)
    }

    /// Stored bytes of `<hash>.raw`, still in native form
    pub fn read_raw(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        fs::read(self.raw_path(hash)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EmbrError::not_found(format!("object {}", hash)),
            _ => e.into(),
        })
    }

    /// Decoded object: header (if any) and uncompressed payload
    pub fn read_object(&self, hash: &ObjectHash) -> Result<DecodedObject> {
        object::decode_object(&self.read_raw(hash)?)
    }

    pub fn read_payload(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        Ok(self.read_object(hash)?.payload)
    }

    /// Float values of a vector object
    pub fn read_vector(&self, hash: &ObjectHash) -> Result<(Vec<f32>, PayloadFormat)> {
        codec::decode_vector(&self.read_payload(hash)?)
    }

    pub fn read_meta(&self, hash: &ObjectHash) -> Result<Metadata> {
        let path = self.meta_path(hash);
        if !path.is_file() {
            return Err(EmbrError::not_found(format!("metadata for {}", hash)));
        }
        meta::read_metadata(&path)
    }

    /// Model recorded in the object's sidecar, if any
    pub fn model_of(&self, hash: &ObjectHash) -> Option<String> {
        self.read_meta(hash).ok()?.model().map(str::to_string)
    }

    /// All stored hashes, sorted
    pub fn hashes(&self) -> Result<Vec<ObjectHash>> {
        Ok(self.iterate()?.into_iter().map(|o| o.hash).collect())
    }

    /// Enumerate every `<hash>.raw`
    pub fn iterate(&self) -> Result<Vec<ObjectInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut objects = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(hash) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".raw"))
                .and_then(|h| ObjectHash::from_hex(h).ok())
            else {
                continue;
            };
            let md = entry.metadata()?;
            let meta_size = fs::metadata(self.meta_path(&hash)).map(|m| m.len()).unwrap_or(0);
            objects.push(ObjectInfo {
                hash,
                size: md.len() + meta_size,
                modified: md.modified()?,
            });
        }
        objects.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(objects)
    }

    /// Resolve a hash prefix against every stored object
    pub fn resolve(&self, prefix: &str) -> Result<ObjectHash> {
        let candidates = self.hashes()?;
        resolve_among(prefix, candidates.iter().copied())
    }

    /// Delete both files of an object, returning the bytes freed
    pub fn remove(&self, hash: &ObjectHash) -> Result<u64> {
        let mut freed = 0;
        for path in [self.raw_path(hash), self.meta_path(hash)] {
            match fs::metadata(&path) {
                Ok(md) => {
                    fs::remove_file(&path)?;
                    freed += md.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(freed)
    }

    /// `.meta` files whose `.raw` is missing
    pub fn orphaned_meta(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(hash) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".meta"))
                .and_then(|h| ObjectHash::from_hex(h).ok())
            {
                if !self.exists(&hash) {
                    orphans.push(entry.path());
                }
            }
        }
        Ok(orphans)
    }
}

/// Resolve `prefix` among `candidates`; two or more matches are ambiguous
pub fn resolve_among(
    prefix: &str,
    candidates: impl IntoIterator<Item = ObjectHash>,
) -> Result<ObjectHash> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if !is_hash_prefix(&prefix) {
        return Err(EmbrError::invalid(format!("'{}' is not a hash prefix", prefix)));
    }
    let mut matches: Vec<ObjectHash> = candidates
        .into_iter()
        .filter(|h| h.to_hex().starts_with(&prefix))
        .collect();
    matches.sort();
    matches.dedup();
    match matches.len() {
        0 => Err(EmbrError::not_found(format!("no object matches '{}'", prefix))),
        1 => Ok(matches[0]),
        _ if prefix.len() == HASH_HEX_LEN => Ok(matches[0]),
        _ => Err(EmbrError::HashAmbiguous {
            prefix,
            candidates: matches.iter().map(ObjectHash::to_hex).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_raw;
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("objects"));
        (temp_dir, store)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_tmp, store) = store();
        let payload = encode_raw(&[1.0, 2.0, 3.0, 4.0]);
        let meta = Metadata::new().with("model", "m1").with("source_file", "a.txt");
        let hash = store.write(&payload, &meta).unwrap();

        assert!(store.exists(&hash));
        assert_eq!(store.read_payload(&hash).unwrap(), payload);
        assert_eq!(store.read_meta(&hash).unwrap(), meta);
        assert_eq!(store.read_vector(&hash).unwrap().0, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(store.model_of(&hash).as_deref(), Some("m1"));
        // Stored form is headered and compressed
        assert_eq!(&store.read_raw(&hash).unwrap()[..4], b"EBVS");
    }

    #[test]
    fn test_write_is_deduplicated() {
        let (_tmp, store) = store();
        let payload = encode_raw(&[0.5; 16]);
        let h1 = store.write(&payload, &Metadata::new().with("model", "m1")).unwrap();
        let h2 = store.write(&payload, &Metadata::new().with("model", "m2")).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.iterate().unwrap().len(), 1);
        assert_eq!(store.model_of(&h1).as_deref(), Some("m1"));
    }

    #[test]
    fn test_missing_sidecar_is_restored() {
        let (_tmp, store) = store();
        let payload = encode_raw(&[2.0; 4]);
        let hash = store.write(&payload, &Metadata::new().with("model", "m1")).unwrap();
        std::fs::remove_file(store.meta_path(&hash)).unwrap();
        store.write(&payload, &Metadata::new().with("model", "m2")).unwrap();
        assert_eq!(store.model_of(&hash).as_deref(), Some("m2"));
    }

    #[test]
    fn test_resolve_prefixes() {
        let (_tmp, store) = store();
        let h = store.write(&encode_raw(&[1.0]), &Metadata::new()).unwrap();
        assert_eq!(store.resolve(&h.short(8)).unwrap(), h);
        assert_eq!(store.resolve(&h.to_hex().to_uppercase()).unwrap(), h);
        assert!(matches!(store.resolve("zz").unwrap_err(), EmbrError::InvalidInput(_)));
    }

    #[test]
    fn test_resolve_ambiguous_lists_all() {
        let a = ObjectHash::from_hex(&format!("ab{}", "0".repeat(62))).unwrap();
        let b = ObjectHash::from_hex(&format!("ab{}", "1".repeat(62))).unwrap();
        let c = ObjectHash::from_hex(&format!("cd{}", "0".repeat(62))).unwrap();
        match resolve_among("ab", [a, b, c]).unwrap_err() {
            EmbrError::HashAmbiguous { candidates, .. } => {
                assert_eq!(candidates, vec![a.to_hex(), b.to_hex()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(resolve_among("ab0", [a, b, c]).unwrap(), a);
        assert!(matches!(
            resolve_among("ef", [a, b, c]).unwrap_err(),
            EmbrError::NotFound(_)
        ));
    }

    #[test]
    fn test_remove_and_orphans() {
        let (_tmp, store) = store();
        let hash = store.write(&encode_raw(&[3.0]), &Metadata::new().with("model", "m")).unwrap();
        fs::remove_file(store.raw_path(&hash)).unwrap();
        assert_eq!(store.orphaned_meta().unwrap().len(), 1);
        assert!(store.remove(&hash).unwrap() > 0);
        assert!(store.orphaned_meta().unwrap().is_empty());
        assert!(matches!(store.read_raw(&hash).unwrap_err(), EmbrError::NotFound(_)));
    }
}
