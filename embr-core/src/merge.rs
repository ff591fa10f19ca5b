//! Merging one set into another
//!
//! Bindings are keyed by `(path, model)`. Source-only bindings are copied into
//! the target. Where both sets bind the same key to different hashes, `union`
//! keeps the target, while `mean`, `max`, and `weighted` combine the two
//! vectors elementwise into a new object.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use crate::codec;
use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;
use crate::meta::{self, Metadata};
use crate::repository::Repository;

/// Weight used for either side when its metadata has no `merge_weight`
pub const DEFAULT_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Union,
    Mean,
    Max,
    Weighted,
}

impl FromStr for MergeStrategy {
    type Err = EmbrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "union" => Ok(MergeStrategy::Union),
            "mean" | "average" => Ok(MergeStrategy::Mean),
            "max" => Ok(MergeStrategy::Max),
            "weighted" => Ok(MergeStrategy::Weighted),
            other => Err(EmbrError::invalid(format!(
                "unknown merge strategy '{}' (expected union, mean, max, or weighted)",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeStrategy::Union => "union",
            MergeStrategy::Mean => "mean",
            MergeStrategy::Max => "max",
            MergeStrategy::Weighted => "weighted",
        })
    }
}

/// A binding left unchanged in the target
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub path: String,
    pub model: String,
    pub reason: String,
}

/// Counts and conflicts from [`Repository::merge`]
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Source-only bindings copied into the target
    pub new: usize,
    /// Target bindings replaced by a combined vector
    pub updated: usize,
    pub conflicts: Vec<MergeConflict>,
    /// Bindings skipped because an object could not be read or written
    pub errors: usize,
}

#[derive(Debug, Clone)]
struct Binding {
    hash: ObjectHash,
    path: String,
    model: String,
}

impl Repository {
    /// Merge `source` into `target` (the current set when `None`)
    pub fn merge(&self, source: &str, target: Option<&str>, strategy: MergeStrategy) -> Result<MergeReport> {
        let target = self.set_or_current(target)?;
        self.require_set(source)?;
        if source == target {
            return Err(EmbrError::invalid(format!("cannot merge set '{}' into itself", source)));
        }

        let _lock = self.write_lock()?;
        let source_bindings = self.bindings(source)?;
        let target_bindings: BTreeMap<(String, String), ObjectHash> = self
            .bindings(&target)?
            .into_iter()
            .map(|b| ((b.path, b.model), b.hash))
            .collect();

        let mut report = MergeReport::default();
        for binding in source_bindings {
            let key = (binding.path.clone(), binding.model.clone());
            let outcome = match target_bindings.get(&key) {
                None => self
                    .adopt(&target, &binding, binding.hash)
                    .map(|_| report.new += 1),
                Some(existing) if *existing == binding.hash => Ok(()),
                Some(existing) => match strategy {
                    MergeStrategy::Union => {
                        report.conflicts.push(MergeConflict {
                            path: binding.path.clone(),
                            model: binding.model.clone(),
                            reason: "kept target version".into(),
                        });
                        Ok(())
                    }
                    _ => match self.combine(&binding, *existing, strategy) {
                        Ok(hash) => self.adopt(&target, &binding, hash).map(|_| report.updated += 1),
                        Err(EmbrError::DimensionMismatch { left, right }) => {
                            report.conflicts.push(MergeConflict {
                                path: binding.path.clone(),
                                model: binding.model.clone(),
                                reason: format!("dimension mismatch ({} vs {})", left, right),
                            });
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                },
            };
            if let Err(e) = outcome {
                warn!("merge of {} ({}) failed: {}", binding.path, binding.model, e);
                report.errors += 1;
            }
        }
        info!(
            "merged '{}' into '{}' ({}): {} new, {} updated, {} conflicts, {} errors",
            source,
            target,
            strategy,
            report.new,
            report.updated,
            report.conflicts.len(),
            report.errors
        );
        Ok(report)
    }

    /// Current `(path, model) -> hash` bindings of a set, from its model refs
    fn bindings(&self, set: &str) -> Result<Vec<Binding>> {
        let mut out = Vec::new();
        for model in self.models(set)? {
            for entry in self.model_ref(set, &model)? {
                out.push(Binding {
                    hash: entry.hash,
                    path: entry.path,
                    model: model.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Point the target set at `hash` for the binding's key and log it
    fn adopt(&self, target: &str, binding: &Binding, hash: ObjectHash) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp();
        self.record(target, hash, &binding.path, &binding.model, timestamp)
    }

    /// Write the elementwise combination of the source and target vectors
    fn combine(&self, source: &Binding, target_hash: ObjectHash, strategy: MergeStrategy) -> Result<ObjectHash> {
        let store = self.store();
        let (sv, _) = store.read_vector(&source.hash)?;
        let (tv, format) = store.read_vector(&target_hash)?;
        if sv.len() != tv.len() {
            return Err(EmbrError::DimensionMismatch {
                left: sv.len(),
                right: tv.len(),
            });
        }
        let source_meta = store.read_meta(&source.hash).unwrap_or_default();
        let target_meta = store.read_meta(&target_hash).unwrap_or_default();
        let ws = source_meta.merge_weight().unwrap_or(DEFAULT_WEIGHT);
        let wt = target_meta.merge_weight().unwrap_or(DEFAULT_WEIGHT);

        let merged = combine_values(&sv, &tv, strategy, ws, wt);
        let payload = codec::encode_vector(&merged, format)?;
        let metadata = Metadata::new()
            .with(meta::KEY_SOURCE_FILE, source.path.as_str())
            .with(meta::KEY_TIMESTAMP, chrono::Utc::now().timestamp().to_string())
            .with(meta::KEY_FILE_TYPE, format.as_str())
            .with(meta::KEY_MODEL, source.model.as_str())
            .with(meta::KEY_DIMENSIONS, merged.len().to_string())
            .with("merge_strategy", strategy.to_string())
            .with("merged_from", format!("{},{}", source.hash, target_hash));
        store.write(&payload, &metadata)
    }
}

/// Elementwise combination of two equal-length vectors
pub fn combine_values(source: &[f32], target: &[f32], strategy: MergeStrategy, ws: f32, wt: f32) -> Vec<f32> {
    source
        .iter()
        .zip(target)
        .map(|(s, t)| match strategy {
            MergeStrategy::Union => *t,
            MergeStrategy::Mean => (s + t) / 2.0,
            MergeStrategy::Max => s.max(*t),
            MergeStrategy::Weighted => ws * s + wt * t,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_raw;
    use std::path::Path;
    use tempfile::TempDir;

    fn two_sets() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        repo.create_set("b").unwrap();
        (temp_dir, repo)
    }

    fn store_in(repo: &Repository, set: &str, values: &[f32], path: &str, model: &str) -> ObjectHash {
        let previous = repo.current_set().unwrap();
        repo.switch_set(set).unwrap();
        let hash = repo
            .store_embedding(&encode_raw(values), Path::new(path), model)
            .unwrap()
            .hash;
        repo.switch_set(&previous).unwrap();
        hash
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("UNION".parse::<MergeStrategy>().unwrap(), MergeStrategy::Union);
        assert_eq!("Weighted".parse::<MergeStrategy>().unwrap(), MergeStrategy::Weighted);
        assert!("median".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_self_merge_rejected() {
        let (_tmp, repo) = two_sets();
        assert!(matches!(
            repo.merge("main", None, MergeStrategy::Union).unwrap_err(),
            EmbrError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_union_copies_and_keeps_target() {
        let (_tmp, repo) = two_sets();
        let a_main = store_in(&repo, "main", &[1.0, 1.0], "a", "m1");
        let b_only = store_in(&repo, "main", &[2.0, 2.0], "b", "m1");
        let a_b = store_in(&repo, "b", &[9.0, 9.0], "a", "m1");

        let report = repo.merge("main", Some("b"), MergeStrategy::Union).unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.conflicts.len(), 1);

        let refs = repo.model_ref("b", "m1").unwrap();
        assert!(refs.iter().any(|e| e.path == "a" && e.hash == a_b));
        assert!(refs.iter().any(|e| e.path == "b" && e.hash == b_only));
        assert!(!refs.iter().any(|e| e.hash == a_main));
    }

    #[test]
    fn test_mean_creates_new_object() {
        let (_tmp, repo) = two_sets();
        let src = store_in(&repo, "main", &[1.0, 2.0], "a", "m1");
        let dst = store_in(&repo, "b", &[3.0, 4.0], "a", "m1");

        let report = repo.merge("main", Some("b"), MergeStrategy::Mean).unwrap();
        assert_eq!(report.updated, 1);
        let merged = repo.model_ref("b", "m1").unwrap()[0].hash;
        assert_ne!(merged, src);
        assert_ne!(merged, dst);
        assert_eq!(repo.store().read_vector(&merged).unwrap().0, vec![2.0, 3.0]);
        assert_eq!(repo.index("b").unwrap().len(), 1);
        // Source untouched
        assert_eq!(repo.model_ref("main", "m1").unwrap()[0].hash, src);
    }

    #[test]
    fn test_max_and_weighted_values() {
        assert_eq!(combine_values(&[1.0, 5.0], &[3.0, 2.0], MergeStrategy::Max, 0.5, 0.5), vec![3.0, 5.0]);
        assert_eq!(
            combine_values(&[1.0, 1.0], &[3.0, 3.0], MergeStrategy::Weighted, 0.25, 0.75),
            vec![2.5, 2.5]
        );
    }

    #[test]
    fn test_weighted_defaults_to_even_split() {
        let (_tmp, repo) = two_sets();
        store_in(&repo, "main", &[2.0], "a", "m1");
        store_in(&repo, "b", &[4.0], "a", "m1");
        repo.merge("main", Some("b"), MergeStrategy::Weighted).unwrap();
        let merged = repo.model_ref("b", "m1").unwrap()[0].hash;
        assert_eq!(repo.store().read_vector(&merged).unwrap().0, vec![3.0]);
    }

    #[test]
    fn test_dimension_mismatch_is_conflict() {
        let (_tmp, repo) = two_sets();
        store_in(&repo, "main", &[1.0, 2.0], "a", "m1");
        let dst = store_in(&repo, "b", &[3.0, 4.0, 5.0], "a", "m1");

        let report = repo.merge("main", Some("b"), MergeStrategy::Mean).unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.conflicts[0].reason.contains("dimension"));
        assert_eq!(repo.model_ref("b", "m1").unwrap()[0].hash, dst);
    }

    #[test]
    fn test_merge_into_current_by_default() {
        let (_tmp, repo) = two_sets();
        store_in(&repo, "b", &[1.0], "x", "m1");
        let report = repo.merge("b", None, MergeStrategy::Union).unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(repo.index("main").unwrap().len(), 1);
        assert_eq!(repo.log_entries("main").unwrap().len(), 1);
    }
}
