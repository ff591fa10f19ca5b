//! PID lock files
//!
//! A lock is a file holding the owner's PID. It is written under a unique
//! name and hard-linked into place, so it never appears without its PID. A
//! lock whose PID no longer names a live process is stale and may be taken
//! over; an unreadable one only once it is older than [`UNREADABLE_GRACE`].
//! Used for the repository write lock (`REMOTE_LOCK`) and for `gc.lock`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{EmbrError, Result};

/// Age after which a lock without a readable PID is treated as stale
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    released: bool,
}

/// PID recorded in a lock file, if it parses
pub fn lock_owner(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age < UNREADABLE_GRACE)
}

/// Whether `pid` names a running process
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl PidLock {
    /// Take the lock once, replacing it if the holder is dead
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match lock_owner(path) {
                    Some(pid) if pid_alive(pid) => Err(EmbrError::LockFailed(format!(
                        "{} is held by process {}",
                        path.display(),
                        pid
                    ))),
                    None if recently_modified(path) => Err(EmbrError::LockFailed(format!(
                        "{} has no readable owner yet",
                        path.display()
                    ))),
                    owner => {
                        warn!("removing stale lock {:?} (owner {:?})", path, owner);
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        Self::create(path).map_err(|e| match e.kind() {
                            ErrorKind::AlreadyExists => EmbrError::LockFailed(format!(
                                "{} was taken by another process",
                                path.display()
                            )),
                            _ => e.into(),
                        })
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry [`PidLock::acquire`] while a live holder keeps the lock
    pub fn acquire_with_retry(path: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let mut last = None;
        for attempt in 0..attempts.max(1) {
            match Self::acquire(path) {
                Ok(lock) => return Ok(lock),
                Err(EmbrError::LockFailed(msg)) => {
                    debug!("lock attempt {} failed: {}", attempt + 1, msg);
                    last = Some(msg);
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EmbrError::LockFailed(last.unwrap_or_default()))
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let staged = dir.join(format!(".{}.{}.{:016x}", name, std::process::id(), rand::random::<u64>()));
        let result = (|| {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&staged)?;
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;
            fs::hard_link(&staged, path)
        })();
        let _ = fs::remove_file(&staged);
        result?;
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file now
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A PID above the kernel's `pid_max`, so never alive
    pub(crate) const DEAD_PID: i32 = 99_999_999;

    #[test]
    fn test_acquire_writes_pid_and_release_removes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gc.lock");
        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock_owner(&path), Some(std::process::id() as i32));
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_live_holder_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gc.lock");
        let _held = PidLock::acquire(&path).unwrap();
        assert!(matches!(
            PidLock::acquire(&path).unwrap_err(),
            EmbrError::LockFailed(_)
        ));
        assert!(PidLock::acquire_with_retry(&path, 2, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("REMOTE_LOCK");
        fs::write(&path, format!("{}\n", DEAD_PID)).unwrap();
        assert!(!pid_alive(DEAD_PID));

        let _lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock_owner(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn test_fresh_unreadable_lock_is_held() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("REMOTE_LOCK");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            PidLock::acquire(&path).unwrap_err(),
            EmbrError::LockFailed(_)
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_old_garbage_lock_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gc.lock");
        fs::write(&path, "not a pid").unwrap();
        let old = SystemTime::now() - Duration::from_secs(60);
        fs::File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();

        let _lock = PidLock::acquire(&path).unwrap();
        assert_eq!(lock_owner(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn test_no_staged_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gc.lock");
        let _lock = PidLock::acquire(&path).unwrap();
        let _ = PidLock::acquire(&path);
        let names: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("gc.lock")]);
    }

    #[test]
    fn test_drop_releases() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gc.lock");
        {
            let _lock = PidLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
