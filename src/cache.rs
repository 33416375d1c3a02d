//! Content-addressed evaluation cache.
//!
//! One JSON document on disk, keyed by the canonical cache key (combo
//! fingerprint + evaluation context + dataset signature). Read once when a
//! tuning run starts, written once when it ends; the verification lock
//! guarantees a single writer, so there is no merge logic and no partial
//! update path.
//!
//! Robustness rules:
//! - A missing, unparseable, or wrong-schema-version document is an empty
//!   cache, never an error. Cold starts and format bumps cost one full
//!   re-evaluation, nothing else.
//! - An entry is only served while every artifact file it references still
//!   exists; a hit with a deleted artifact evicts the entry and reports a
//!   miss so the row gets recomputed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::EvaluationRow;

/// Bump when the entry layout or key material changes; older documents are
/// then treated as cold caches.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCache {
    pub schema_version: u32,
    pub entries: BTreeMap<String, EvaluationRow>,
}

impl Default for EvalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalCache {
    pub fn new() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }

    /// Load the cache document, degrading to empty on any inconsistency.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::new();
        };
        match serde_json::from_str::<Self>(text.trim_start_matches('\u{feff}')) {
            Ok(cache) if cache.schema_version == CACHE_SCHEMA_VERSION => cache,
            _ => Self::new(),
        }
    }

    /// Fetch a cached row. Validates that the row's artifacts are still on
    /// disk; dangling entries are evicted and reported as misses.
    pub fn lookup(&mut self, key: &str) -> Option<EvaluationRow> {
        let row = self.entries.get(key)?;
        if !row.artifacts_present() {
            self.entries.remove(key);
            return None;
        }
        let mut row = row.clone();
        row.from_cache = true;
        Some(row)
    }

    pub fn store(&mut self, key: String, row: EvaluationRow) {
        self.entries.insert(key, row);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the document back. Called once at the end of a run, while the
    /// verification lock is still held.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        std::fs::write(path, text)
            .with_context(|| format!("failed to write eval cache {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edgetune_cache_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn row_with_artifacts(dir: &Path) -> EvaluationRow {
        let mut row = EvaluationRow {
            combo_id: "scenario_test_000".into(),
            avg_profit_factor: 1.2,
            ..Default::default()
        };
        row.report_json = dir.join("report.json");
        row.profile_csv = dir.join("profile.csv");
        row.matrix_csv = dir.join("matrix.csv");
        for artifact in [&row.report_json, &row.profile_csv, &row.matrix_csv] {
            fs::write(artifact, "artifact").unwrap();
        }
        row
    }

    #[test]
    fn test_cold_start_on_missing_and_garbage() {
        let dir = temp_dir("cold");
        assert!(EvalCache::load(&dir.join("absent.json")).is_empty());

        let garbage = dir.join("garbage.json");
        fs::write(&garbage, "[1, 2, oops").unwrap();
        assert!(EvalCache::load(&garbage).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_schema_version_mismatch_is_cold_start() {
        let dir = temp_dir("schema");
        let path = dir.join("cache.json");
        let mut cache = EvalCache::new();
        cache.schema_version = CACHE_SCHEMA_VERSION + 1;
        cache.store("k".into(), EvaluationRow::default());
        cache.persist(&path).unwrap();

        assert!(EvalCache::load(&path).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_roundtrip_and_hit_marks_from_cache() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("cache.json");
        let row = row_with_artifacts(&dir);

        let mut cache = EvalCache::new();
        cache.store("key1".into(), row.clone());
        cache.persist(&path).unwrap();

        let mut loaded = EvalCache::load(&path);
        let hit = loaded.lookup("key1").expect("hit");
        assert!(hit.from_cache);
        assert_eq!(hit.combo_id, row.combo_id);
        assert!(loaded.lookup("other").is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_artifact_evicts_entry() {
        let dir = temp_dir("evict");
        let row = row_with_artifacts(&dir);
        let mut cache = EvalCache::new();
        cache.store("key1".into(), row.clone());

        fs::remove_file(&row.profile_csv).unwrap();
        assert!(cache.lookup("key1").is_none());
        // Evicted, not just skipped: a later persist drops it for good.
        assert!(cache.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
