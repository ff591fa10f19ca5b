//! Garbage collection of unreferenced objects
//!
//! An object is referenced when any set's index, log, or model refs (or a
//! HEAD model line) names it. Unreferenced objects older than the expiry
//! cutoff are deleted under `gc.lock`.

use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;
use crate::lock::PidLock;
use crate::repository::Repository;

/// Expiry used when none is given
pub const DEFAULT_EXPIRE: &str = "2.weeks.ago";

/// Age threshold for deleting unreferenced objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never delete anything
    Never,
    /// Delete every unreferenced object
    Now,
    /// Delete unreferenced objects older than this
    OlderThan(Duration),
}

impl Expiry {
    /// Parse `N.unit.ago`, `now`, or `never`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "never" => return Ok(Expiry::Never),
            "now" => return Ok(Expiry::Now),
            _ => {}
        }
        let bad = || {
            EmbrError::invalid(format!(
                "invalid expiry '{}' (expected N.<unit>.ago, now, or never)",
                s
            ))
        };
        let mut parts = s.split('.');
        let (Some(n), Some(unit), Some("ago"), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(bad());
        };
        let n: u64 = n.parse().map_err(|_| bad())?;
        let unit_secs: u64 = match unit.trim_end_matches('s') {
            "second" => 1,
            "minute" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            "week" => 7 * 86_400,
            "month" => 30 * 86_400,
            "year" => 365 * 86_400,
            _ => return Err(bad()),
        };
        let secs = n.checked_mul(unit_secs).ok_or_else(bad)?;
        Ok(Expiry::OlderThan(Duration::from_secs(secs)))
    }

    /// Objects modified at or before this instant are old enough to remove
    fn cutoff(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            Expiry::Never => None,
            Expiry::Now => Some(now),
            Expiry::OlderThan(age) => Some(now.checked_sub(*age).unwrap_or(SystemTime::UNIX_EPOCH)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub expire: Expiry,
    pub dry_run: bool,
    /// Accepted for compatibility; collects exactly what a normal run does
    pub aggressive: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            expire: Expiry::OlderThan(Duration::from_secs(14 * 86_400)),
            dry_run: false,
            aggressive: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub objects_removed: usize,
    pub bytes_freed: u64,
    /// Unreferenced, expired objects (removed unless dry run)
    pub candidates: Vec<ObjectHash>,
    pub message: String,
}

impl Repository {
    pub fn gc(&self, options: &GcOptions) -> Result<GcReport> {
        let Some(cutoff) = options.expire.cutoff(SystemTime::now()) else {
            return Ok(GcReport {
                message: "Garbage collection skipped (expire=never)".into(),
                ..Default::default()
            });
        };

        let _lock = PidLock::acquire(&self.layout().gc_lock())?;
        let referenced = self.referenced_hashes()?;
        let store = self.store();

        let mut report = GcReport::default();
        for object in store.iterate()? {
            if referenced.contains(&object.hash) || object.modified > cutoff {
                continue;
            }
            report.candidates.push(object.hash);
            if options.dry_run {
                report.bytes_freed += object.size;
                continue;
            }
            report.bytes_freed += store.remove(&object.hash)?;
            report.objects_removed += 1;
            debug!("removed unreferenced object {}", object.hash.short(12));
        }
        if !options.dry_run {
            for orphan in store.orphaned_meta()? {
                debug!("removing orphaned metadata {:?}", orphan);
                report.bytes_freed += std::fs::metadata(&orphan).map(|m| m.len()).unwrap_or(0);
                std::fs::remove_file(&orphan)?;
            }
        }

        report.message = if options.dry_run {
            format!(
                "Would remove {} unreferenced objects ({} bytes)",
                report.candidates.len(),
                report.bytes_freed
            )
        } else {
            format!(
                "Removed {} unreferenced objects, freed {} bytes",
                report.objects_removed, report.bytes_freed
            )
        };
        if options.aggressive {
            report.message.push_str(" (aggressive mode)");
        }
        info!("{}", report.message);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_raw;
    use crate::lock::tests::DEAD_PID;
    use crate::meta::Metadata;
    use std::path::Path;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        (temp_dir, repo)
    }

    #[test]
    fn test_parse_expiry() {
        assert_eq!(Expiry::parse("never").unwrap(), Expiry::Never);
        assert_eq!(Expiry::parse("now").unwrap(), Expiry::Now);
        assert_eq!(
            Expiry::parse("2.weeks.ago").unwrap(),
            Expiry::OlderThan(Duration::from_secs(14 * 86_400))
        );
        assert_eq!(Expiry::parse("1.day.ago").unwrap(), Expiry::OlderThan(Duration::from_secs(86_400)));
        assert_eq!(
            Expiry::parse("3.months.ago").unwrap(),
            Expiry::OlderThan(Duration::from_secs(90 * 86_400))
        );
        assert_eq!(Expiry::parse(DEFAULT_EXPIRE).unwrap(), GcOptions::default().expire);
        for bad in ["", "2.weeks", "x.days.ago", "2.fortnights.ago", "2.days.ago.now"] {
            assert!(Expiry::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_never_removes_nothing() {
        let (_tmp, repo) = repo();
        let orphan = repo.store().write(&encode_raw(&[1.0]), &Metadata::new()).unwrap();
        let report = repo
            .gc(&GcOptions { expire: Expiry::Never, ..Default::default() })
            .unwrap();
        assert_eq!(report.objects_removed, 0);
        assert!(repo.store().exists(&orphan));
    }

    #[test]
    fn test_removes_only_unreferenced() {
        let (_tmp, repo) = repo();
        let kept = repo.store_embedding(&encode_raw(&[1.0]), Path::new("a"), "m1").unwrap();
        // Still in the log after being replaced, so still referenced
        repo.store_embedding(&encode_raw(&[2.0]), Path::new("a"), "m1").unwrap();
        let orphan = repo.store().write(&encode_raw(&[3.0]), &Metadata::new()).unwrap();

        let dry = repo
            .gc(&GcOptions { expire: Expiry::Now, dry_run: true, ..Default::default() })
            .unwrap();
        assert_eq!(dry.candidates, vec![orphan]);
        assert_eq!(dry.objects_removed, 0);
        assert!(repo.store().exists(&orphan));

        let report = repo
            .gc(&GcOptions { expire: Expiry::Now, aggressive: true, ..Default::default() })
            .unwrap();
        assert_eq!(report.objects_removed, 1);
        assert!(report.bytes_freed > 0);
        assert!(report.message.ends_with("(aggressive mode)"));
        assert!(!repo.store().exists(&orphan));
        assert!(!repo.store().meta_path(&orphan).exists());
        assert!(repo.store().exists(&kept.hash));
        assert!(!repo.layout().gc_lock().exists());
    }

    #[test]
    fn test_recent_objects_survive_default_expiry() {
        let (_tmp, repo) = repo();
        let orphan = repo.store().write(&encode_raw(&[3.0]), &Metadata::new()).unwrap();
        let report = repo.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.objects_removed, 0);
        assert!(repo.store().exists(&orphan));
    }

    #[test]
    fn test_objects_in_other_sets_are_referenced() {
        let (_tmp, repo) = repo();
        repo.create_set("other").unwrap();
        repo.switch_set("other").unwrap();
        let stored = repo.store_embedding(&encode_raw(&[4.0]), Path::new("a"), "m1").unwrap();
        repo.switch_set("main").unwrap();
        repo.gc(&GcOptions { expire: Expiry::Now, ..Default::default() }).unwrap();
        assert!(repo.store().exists(&stored.hash));
    }

    #[test]
    fn test_gc_lock_contention() {
        let (_tmp, repo) = repo();
        let _held = PidLock::acquire(&repo.layout().gc_lock()).unwrap();
        assert!(matches!(
            repo.gc(&GcOptions::default()).unwrap_err(),
            EmbrError::LockFailed(_)
        ));
    }

    #[test]
    fn test_stale_gc_lock_is_taken_over() {
        let (_tmp, repo) = repo();
        std::fs::write(repo.layout().gc_lock(), format!("{}\n", DEAD_PID)).unwrap();
        assert!(repo.gc(&GcOptions::default()).is_ok());
    }
}
