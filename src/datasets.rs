//! Dataset discovery, deterministic subsampling, and change signatures.
//!
//! Discovery scans the configured backtest data directories for CSV candle
//! files. Directories whose path contains `backtest_real` hold exchange
//! captures; those are filtered to the primary 1-minute timeframe and can be
//! required to ship their higher-timeframe companion files, since the engine
//! refuses multi-timeframe strategies without them.
//!
//! Screening subsampling is evenly spaced rather than random on purpose:
//! the screening stage must hit the same datasets on every run or the
//! evaluation cache never gets a second hit.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{
    canonical_hash, encode_string, encode_u32, encode_u64, encode_u8, CanonicalBytes,
    FINGERPRINT_ENCODING_VERSION,
};

/// Higher timeframes a real-data 1m dataset must ship companions for.
const COMPANION_TIMEFRAMES: &[&str] = &["5m", "60m", "240m"];

/// Scan data directories for backtest datasets.
///
/// Missing directories are skipped silently (not every deployment has a
/// curated or real-data directory). The result is deduplicated and sorted
/// case-insensitively by full path so downstream ordering is stable across
/// filesystems.
pub fn discover_datasets(
    dirs: &[PathBuf],
    real_data_only: bool,
    require_higher_tf: bool,
) -> Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !dir.exists() {
            continue;
        }
        let is_real = dir.to_string_lossy().to_lowercase().contains("backtest_real");
        if real_data_only && !is_real {
            continue;
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to scan data directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != "csv").unwrap_or(true) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if is_real && !name.contains("_1m_") {
                continue;
            }
            if require_higher_tf && is_real && !has_higher_tf_companions(&path) {
                continue;
            }
            found.push(path.canonicalize().unwrap_or(path));
        }
    }

    found.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    found.dedup();
    Ok(found)
}

/// A 1m real-data file `upbit_<market>_1m_<range>.csv` qualifies only when
/// every companion timeframe has at least one sibling for the same market.
pub fn has_higher_tf_companions(primary: &Path) -> bool {
    let stem = match primary.file_stem() {
        Some(stem) => stem.to_string_lossy().to_lowercase(),
        None => return false,
    };
    if !stem.starts_with("upbit_") {
        return false;
    }
    let pivot = match stem.find("_1m_") {
        Some(pivot) => pivot,
        None => return false,
    };
    if pivot <= 6 {
        return false;
    }
    let market = &stem[6..pivot];
    let parent = match primary.parent() {
        Some(parent) => parent,
        None => return false,
    };

    COMPANION_TIMEFRAMES.iter().all(|tf| {
        let prefix = format!("upbit_{}_{}_", market, tf);
        std::fs::read_dir(parent)
            .map(|entries| {
                entries.flatten().any(|e| {
                    let name = e.file_name().to_string_lossy().to_lowercase();
                    name.starts_with(&prefix) && name.ends_with(".csv")
                })
            })
            .unwrap_or(false)
    })
}

/// Deterministic, evenly spaced subsample of `limit` items.
///
/// Index stride is `(N-1)/(limit-1)`; each of `limit` evenly spaced
/// positions rounds to the nearest index, duplicates collapse, and any
/// shortfall is backfilled from unused indices in ascending order. A limit
/// of 0 or one covering the whole list returns the input unchanged; a limit
/// of 1 picks the middle element.
pub fn select_evenly_spaced<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    if limit == 0 || items.len() <= limit {
        return items.to_vec();
    }
    if limit == 1 {
        return vec![items[items.len() / 2].clone()];
    }

    let step = (items.len() - 1) as f64 / (limit - 1) as f64;
    let mut indices: BTreeSet<usize> = (0..limit)
        .map(|i| (i as f64 * step).round() as usize)
        .collect();
    for i in 0..items.len() {
        if indices.len() >= limit {
            break;
        }
        indices.insert(i);
    }

    indices.into_iter().map(|i| items[i].clone()).collect()
}

/// One dataset's identity for cache invalidation: resolved path plus size
/// and modification time. Never persisted beyond a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStamp {
    pub path: String,
    pub size: u64,
    pub mtime_secs: u64,
    pub mtime_nanos: u32,
}

/// Ordered stamps for a dataset set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSignature(pub Vec<DatasetStamp>);

impl DatasetSignature {
    /// Stat every dataset. A missing or unreadable dataset is an input
    /// error; the tuning run must fail fast rather than cache against a
    /// phantom signature.
    pub fn capture(datasets: &[PathBuf]) -> Result<Self> {
        let mut stamps = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            let meta = std::fs::metadata(dataset)
                .with_context(|| format!("dataset not accessible: {}", dataset.display()))?;
            let mtime = meta
                .modified()
                .with_context(|| format!("dataset mtime unavailable: {}", dataset.display()))?;
            let since_epoch = mtime
                .duration_since(SystemTime::UNIX_EPOCH)
                .context("dataset mtime predates UNIX_EPOCH")?;
            stamps.push(DatasetStamp {
                path: dataset.to_string_lossy().into_owned(),
                size: meta.len(),
                mtime_secs: since_epoch.as_secs(),
                mtime_nanos: since_epoch.subsec_nanos(),
            });
        }
        Ok(Self(stamps))
    }

    pub fn hash(&self) -> String {
        canonical_hash(self)
    }
}

impl CanonicalBytes for DatasetSignature {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_u8(&mut buf, FINGERPRINT_ENCODING_VERSION);
        encode_u32(&mut buf, self.0.len() as u32);
        for stamp in &self.0 {
            encode_string(&mut buf, &stamp.path);
            encode_u64(&mut buf, stamp.size);
            encode_u64(&mut buf, stamp.mtime_secs);
            encode_u32(&mut buf, stamp.mtime_nanos);
        }
        buf
    }
}
