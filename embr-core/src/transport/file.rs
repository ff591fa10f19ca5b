//! Local directory back-end

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{Transport, TransportState};
use crate::error::{EmbrError, Result};

/// Keys map to files under `root`; `/` in a key is a directory separator
pub struct FileTransport {
    root: PathBuf,
    state: TransportState,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: TransportState::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(EmbrError::invalid(format!("invalid key '{}'", key)));
            }
            path.push(part);
        }
        if path == self.root {
            return Err(EmbrError::invalid("empty key"));
        }
        Ok(path)
    }
}

fn is_staging_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

#[async_trait]
impl Transport for FileTransport {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TransportState {
        &mut self.state
    }

    async fn connect(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.key_path(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.tmp.{}", name, std::process::id()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EmbrError::not_found(format!("remote key {}", key))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() { name.clone() } else { format!("{}/{}", rel, name) };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if !is_staging_file(&name) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            match fs::remove_file(self.key_path(key)?).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.key_path(key)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let temp_dir = TempDir::new().unwrap();
        let mut t = FileTransport::new(temp_dir.path());
        t.connect().await.unwrap();

        t.put("sets/main/documents/aa.parquet", b"1".to_vec()).await.unwrap();
        t.put("sets/main/documents/bb.parquet", b"2".to_vec()).await.unwrap();
        t.put("sets/main/metadata.json", b"{}".to_vec()).await.unwrap();

        assert_eq!(
            t.list("sets/main/documents/").await.unwrap(),
            vec![
                "sets/main/documents/aa.parquet".to_string(),
                "sets/main/documents/bb.parquet".to_string()
            ]
        );
        assert_eq!(t.list("").await.unwrap().len(), 3);
        assert_eq!(t.get("sets/main/metadata.json").await.unwrap(), b"{}");

        let removed = t
            .delete(&["sets/main/documents/aa.parquet".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!t.exists("sets/main/documents/aa.parquet").await.unwrap());
        assert!(matches!(
            t.get("sets/main/documents/aa.parquet").await.unwrap_err(),
            EmbrError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let t = FileTransport::new(temp_dir.path().join("nope"));
        assert!(t.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let t = FileTransport::new(temp_dir.path());
        assert!(t.put("../x", b"1".to_vec()).await.is_err());
        assert!(t.put("", b"1".to_vec()).await.is_err());
    }
}
