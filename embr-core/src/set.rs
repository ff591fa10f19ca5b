//! Set lifecycle
//!
//! A set is a directory under `.embr/sets` holding its own index, log, and
//! model refs. HEAD names the current set. Objects are shared by all sets, so
//! deleting a set never touches the object store.

use std::fs;

use tracing::info;

use crate::error::{EmbrError, Result};
use crate::paths;
use crate::refs::Head;
use crate::repository::Repository;

/// One row of [`Repository::list_sets`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub name: String,
    pub current: bool,
    pub entries: usize,
}

/// Detail returned by [`Repository::set_status`]
#[derive(Debug, Clone)]
pub struct SetStatus {
    pub name: String,
    pub current: bool,
    pub index_entries: usize,
    pub log_entries: usize,
    pub models: Vec<String>,
    /// Newest log timestamp
    pub last_updated: Option<i64>,
}

impl Repository {
    /// Create an empty set; it becomes current when no valid current set exists
    pub fn create_set(&self, name: &str) -> Result<()> {
        paths::validate_set_name(name)?;
        let _lock = self.write_lock()?;
        if self.layout().set_dir(name).exists() {
            return Err(EmbrError::AlreadyExists(format!("set '{}'", name)));
        }
        self.create_set_files(name)?;

        let head_path = self.layout().head();
        let head = Head::read(&head_path)?;
        if !head_path.is_file() || !self.layout().set_dir(&head.set).is_dir() {
            Head::new(name).write(&head_path)?;
            info!("created set '{}' and made it current", name);
        } else {
            info!("created set '{}'", name);
        }
        Ok(())
    }

    /// All sets, with the current one flagged
    pub fn list_sets(&self) -> Result<Vec<SetInfo>> {
        let current = self.current_set()?;
        self.set_names()?
            .into_iter()
            .map(|name| {
                Ok(SetInfo {
                    entries: self.index(&name)?.len(),
                    current: name == current,
                    name,
                })
            })
            .collect()
    }

    /// Make `name` the current set
    pub fn switch_set(&self, name: &str) -> Result<()> {
        self.require_set(name)?;
        let _lock = self.write_lock()?;
        let mut head = self.head()?;
        if head.set == name {
            return Ok(());
        }
        head.set = name.to_string();
        // Per-model head lines belong to the previous set
        head.model_heads.clear();
        head.write(&self.layout().head())?;
        info!("switched to set '{}'", name);
        Ok(())
    }

    /// Delete a set's index, log, and refs.
    ///
    /// The current set is never deleted. A set that still has index entries
    /// requires `force`.
    pub fn delete_set(&self, name: &str, force: bool) -> Result<()> {
        self.require_set(name)?;
        let _lock = self.write_lock()?;
        if self.current_set()? == name {
            return Err(EmbrError::Conflict(format!(
                "cannot delete the current set '{}'; switch to another set first",
                name
            )));
        }
        let entries = self.index(name)?.len();
        if entries > 0 && !force {
            return Err(EmbrError::Referenced(format!(
                "set '{}' still has {} entries (use --force to delete it)",
                name, entries
            )));
        }
        fs::remove_dir_all(self.layout().set_dir(name))?;
        info!("deleted set '{}'", name);
        Ok(())
    }

    /// Summary of a set, defaulting to the current one
    pub fn set_status(&self, name: Option<&str>) -> Result<SetStatus> {
        let name = self.set_or_current(name)?;
        let log = self.log_entries(&name)?;
        Ok(SetStatus {
            current: self.current_set()? == name,
            index_entries: self.index(&name)?.len(),
            log_entries: log.len(),
            models: self.models(&name)?,
            last_updated: log.iter().map(|e| e.timestamp).max(),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_raw;
    use std::path::Path;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        (temp_dir, repo)
    }

    #[test]
    fn test_create_list_switch() {
        let (_tmp, repo) = repo();
        repo.create_set("exp").unwrap();
        assert_eq!(repo.current_set().unwrap(), "main");

        let sets = repo.list_sets().unwrap();
        assert_eq!(
            sets,
            vec![
                SetInfo { name: "exp".into(), current: false, entries: 0 },
                SetInfo { name: "main".into(), current: true, entries: 0 },
            ]
        );

        repo.switch_set("exp").unwrap();
        assert_eq!(repo.current_set().unwrap(), "exp");
        assert!(repo.switch_set("missing").is_err());
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_names() {
        let (_tmp, repo) = repo();
        assert!(matches!(repo.create_set("main").unwrap_err(), EmbrError::AlreadyExists(_)));
        assert!(matches!(repo.create_set("a/b").unwrap_err(), EmbrError::InvalidInput(_)));
    }

    #[test]
    fn test_create_becomes_current_without_head() {
        let (_tmp, repo) = repo();
        fs::remove_file(repo.layout().head()).unwrap();
        fs::remove_dir_all(repo.layout().set_dir("main")).unwrap();
        repo.create_set("first").unwrap();
        assert_eq!(repo.current_set().unwrap(), "first");
    }

    #[test]
    fn test_stores_are_isolated_per_set() {
        let (_tmp, repo) = repo();
        repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        repo.create_set("exp").unwrap();
        repo.switch_set("exp").unwrap();
        assert!(repo.index("exp").unwrap().is_empty());
        repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m1").unwrap();
        assert_eq!(repo.index("main").unwrap().len(), 1);
        assert_eq!(repo.index("exp").unwrap().len(), 1);
        assert_ne!(repo.index("main").unwrap(), repo.index("exp").unwrap());
    }

    #[test]
    fn test_delete_rules() {
        let (_tmp, repo) = repo();
        assert!(matches!(repo.delete_set("main", true).unwrap_err(), EmbrError::Conflict(_)));

        repo.create_set("exp").unwrap();
        repo.switch_set("exp").unwrap();
        let stored = repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        repo.switch_set("main").unwrap();

        assert!(matches!(repo.delete_set("exp", false).unwrap_err(), EmbrError::Referenced(_)));
        repo.delete_set("exp", true).unwrap();
        assert!(!repo.layout().set_dir("exp").exists());
        // Shared objects survive
        assert!(repo.store().exists(&stored.hash));
    }

    #[test]
    fn test_set_status() {
        let (_tmp, repo) = repo();
        repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m2").unwrap();
        let status = repo.set_status(None).unwrap();
        assert_eq!(status.name, "main");
        assert!(status.current);
        assert_eq!(status.index_entries, 2);
        assert_eq!(status.log_entries, 2);
        assert_eq!(status.models, vec!["m1".to_string(), "m2".to_string()]);
        assert!(status.last_updated.is_some());
    }
}
