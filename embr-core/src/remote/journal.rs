//! Remote transaction journal
//!
//! Every write-bearing remote operation runs inside a [`Transaction`]:
//!
//! 1. `begin` takes `REMOTE_LOCK` and appends `BEGIN <ts> <op> <remote> <path>`
//! 2. the operation writes its outcome to `REMOTE_TEMP`
//! 3. `commit` renames `REMOTE_TEMP` over `REMOTE_HEAD`, appends `COMMIT <ts>`
//!    and releases the lock; `abort` unlinks the temp ref and appends
//!    `ABORT <ts> <Kind>` instead
//!
//! A `BEGIN` with no later `COMMIT`, `ABORT` or `RECOVER` is an interrupted
//! transaction; [`recover`] completes it when the temp ref survived and
//! aborts it otherwise.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EmbrError, ErrorKind, Result};
use crate::lock::{lock_owner, pid_alive, PidLock};
use crate::paths::RepoLayout;
use crate::refs::{atomic_write, read_complete_lines};

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Begin {
        timestamp: i64,
        op: String,
        remote: String,
        path: String,
    },
    Commit {
        timestamp: i64,
    },
    Abort {
        timestamp: i64,
        /// Kind of the error that failed the transaction
        kind: Option<String>,
    },
    Recover {
        timestamp: i64,
    },
}

impl JournalRecord {
    fn to_line(&self) -> String {
        match self {
            JournalRecord::Begin {
                timestamp,
                op,
                remote,
                path,
            } => format!("BEGIN {} {} {} {}\n", timestamp, op, remote, path),
            JournalRecord::Commit { timestamp } => format!("COMMIT {}\n", timestamp),
            JournalRecord::Abort {
                timestamp,
                kind: Some(kind),
            } => format!("ABORT {} {}\n", timestamp, kind),
            JournalRecord::Abort { timestamp, kind: None } => format!("ABORT {}\n", timestamp),
            JournalRecord::Recover { timestamp } => format!("RECOVER {}\n", timestamp),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(5, ' ');
        let tag = parts.next()?;
        let timestamp = parts.next()?.parse().ok()?;
        match tag {
            "BEGIN" => Some(JournalRecord::Begin {
                timestamp,
                op: parts.next()?.to_string(),
                remote: parts.next()?.to_string(),
                path: parts.next().unwrap_or_default().to_string(),
            }),
            "COMMIT" => Some(JournalRecord::Commit { timestamp }),
            "ABORT" => Some(JournalRecord::Abort {
                timestamp,
                kind: parts.next().map(str::to_string),
            }),
            "RECOVER" => Some(JournalRecord::Recover { timestamp }),
            _ => None,
        }
    }

    fn closes_transaction(&self) -> bool {
        !matches!(self, JournalRecord::Begin { .. })
    }
}

/// Append-only `REMOTE_JOURNAL`
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(record.to_line().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<JournalRecord>> {
        Ok(read_complete_lines(&self.path)?
            .iter()
            .filter_map(|l| JournalRecord::parse(l))
            .collect())
    }

    /// The last `BEGIN`, if nothing closed it
    pub fn open_transaction(&self) -> Result<Option<JournalRecord>> {
        let records = self.records()?;
        let Some(begin) = records
            .iter()
            .rposition(|r| matches!(r, JournalRecord::Begin { .. }))
        else {
            return Ok(None);
        };
        if records[begin + 1..].iter().any(JournalRecord::closes_transaction) {
            return Ok(None);
        }
        Ok(Some(records[begin].clone()))
    }

    pub fn recovery_needed(&self) -> Result<bool> {
        Ok(self.open_transaction()?.is_some())
    }
}

/// Outcome recorded in `REMOTE_TEMP` and, once committed, `REMOTE_HEAD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempRef {
    pub operation: String,
    pub remote: String,
    pub path: String,
    pub size: u64,
    pub timestamp: i64,
    pub checksum: String,
}

impl TempRef {
    pub fn to_text(&self) -> String {
        format!(
            "OPERATION {}\nREMOTE {}\nPATH {}\nSIZE {}\nTIMESTAMP {}\nCHECKSUM {}\n",
            self.operation, self.remote, self.path, self.size, self.timestamp, self.checksum
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            text.lines()
                .find_map(|l| l.strip_prefix(name)?.strip_prefix(' ').map(str::to_string))
                .ok_or_else(|| EmbrError::InvalidFormat(format!("remote ref has no {}", name)))
        };
        let number = |name: &str| -> Result<i64> {
            field(name)?
                .trim()
                .parse()
                .map_err(|_| EmbrError::InvalidFormat(format!("remote ref {} is not a number", name)))
        };
        Ok(Self {
            operation: field("OPERATION")?,
            remote: field("REMOTE")?,
            path: field("PATH")?,
            size: number("SIZE")? as u64,
            timestamp: number("TIMESTAMP")?,
            checksum: field("CHECKSUM")?,
        })
    }

    /// Read a ref file; a missing file reads as `None`
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// In-flight remote transaction; dropping it unfinished aborts it
#[derive(Debug)]
pub struct Transaction {
    layout: RepoLayout,
    journal: Journal,
    lock: Option<PidLock>,
}

impl Transaction {
    /// Recover any interrupted transaction, take the lock, and log `BEGIN`
    pub fn begin(layout: &RepoLayout, op: &str, remote: &str, path: &str) -> Result<Self> {
        recover(layout)?;
        let lock = PidLock::acquire_with_retry(&layout.remote_lock(), LOCK_ATTEMPTS, LOCK_DELAY)?;
        let journal = Journal::new(layout.remote_journal());
        journal.append(&JournalRecord::Begin {
            timestamp: now(),
            op: op.to_string(),
            remote: remote.to_string(),
            path: path.to_string(),
        })?;
        debug!("BEGIN {} {} {}", op, remote, path);
        Ok(Self {
            layout: layout.clone(),
            journal,
            lock: Some(lock),
        })
    }

    pub fn write_temp_ref(&self, temp: &TempRef) -> Result<()> {
        atomic_write(&self.layout.remote_temp(), temp.to_text().as_bytes())
    }

    /// Publish the temp ref as `REMOTE_HEAD` and close the transaction
    pub fn commit(mut self) -> Result<()> {
        let temp = self.layout.remote_temp();
        if temp.exists() {
            fs::rename(&temp, self.layout.remote_head())?;
        }
        self.journal.append(&JournalRecord::Commit { timestamp: now() })?;
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        debug!("COMMIT");
        Ok(())
    }

    /// Discard the temp ref and close the transaction, recording the failure kind
    pub fn abort(mut self, kind: Option<ErrorKind>) -> Result<()> {
        self.abort_in_place(kind)
    }

    fn abort_in_place(&mut self, kind: Option<ErrorKind>) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        remove_if_exists(&self.layout.remote_temp())?;
        self.journal.append(&JournalRecord::Abort {
            timestamp: now(),
            kind: kind.map(|k| k.to_string()),
        })?;
        lock.release()?;
        debug!("ABORT {:?}", kind);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.lock.is_some() {
            if let Err(e) = self.abort_in_place(Some(ErrorKind::Interrupted)) {
                warn!("failed to abort dropped transaction: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was pending
    Clean,
    /// The temp ref was published
    Completed,
    /// The pending transaction was rolled back
    Aborted,
}

/// Finish or roll back a transaction interrupted by a crash
pub fn recover(layout: &RepoLayout) -> Result<Recovery> {
    let journal = Journal::new(layout.remote_journal());
    let temp = layout.remote_temp();
    if !journal.recovery_needed()? {
        if temp.exists() {
            warn!("removing stray {:?}", temp);
            remove_if_exists(&temp)?;
        }
        return Ok(Recovery::Clean);
    }

    let lock = layout.remote_lock();
    if let Some(pid) = lock_owner(&lock) {
        if pid_alive(pid) {
            return Err(EmbrError::LockFailed(format!(
                "remote operation in progress (process {})",
                pid
            )));
        }
    }
    remove_if_exists(&lock)?;

    let outcome = if temp.exists() {
        fs::rename(&temp, layout.remote_head())?;
        Recovery::Completed
    } else {
        Recovery::Aborted
    };
    journal.append(&JournalRecord::Recover { timestamp: now() })?;
    info!("recovered interrupted remote transaction: {:?}", outcome);
    Ok(outcome)
}
