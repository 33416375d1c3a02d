//! Shared trading configuration handling.
//!
//! The backtest engine reads one JSON document with `trading.*` scalar and
//! boolean thresholds plus `strategies.<name>.min_signal_strength` floors.
//! Tuning repeatedly rewrites that file, so this module keeps the mutation
//! surface tiny and reversible:
//!
//! - [`BaseConfig`] is an immutable snapshot of the document as it was when
//!   the run started; [`BaseConfig::merge_combo`] is a pure function that
//!   produces a NEW value with a combo's fields applied — nothing mutates
//!   the snapshot.
//! - [`ConfigRestorer`] is a scope guard that rewrites the original content
//!   on drop, so the shared file is restored on every exit path, including
//!   panics and `?` early returns mid-evaluation.
//! - [`BaseConfig::stripped_hash`] hashes the document with every tunable
//!   key removed. Cache keys built from it survive combo churn but still
//!   invalidate when a tuning-irrelevant base setting changes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::combos::ComboSpec;
use crate::fingerprint::{raw_bytes_hash, stable_json_hash};

/// Every `trading.*` key a combo may set. Shared by merge and strip so the
/// two can never drift apart.
pub const TUNABLE_TRADING_KEYS: &[&str] = &[
    "max_new_orders_per_scan",
    "min_expected_edge_pct",
    "min_reward_risk",
    "min_rr_weak_signal",
    "min_rr_strong_signal",
    "min_strategy_trades_for_ev",
    "min_strategy_expectancy_krw",
    "min_strategy_profit_factor",
    "avoid_high_volatility",
    "avoid_trending_down",
    "hostility_ewma_alpha",
    "hostility_hostile_threshold",
    "hostility_severe_threshold",
    "hostility_extreme_threshold",
    "hostility_pause_scans",
    "hostility_pause_scans_extreme",
    "hostility_pause_recent_sample_min",
    "hostility_pause_recent_expectancy_krw",
    "hostility_pause_recent_win_rate",
    "backtest_hostility_pause_candles",
    "backtest_hostility_pause_candles_extreme",
];

/// Strategy families carrying a tunable `min_signal_strength`.
pub const TUNABLE_STRATEGIES: &[&str] = &["scalping", "momentum", "breakout", "mean_reversion"];

/// Immutable snapshot of the shared configuration document.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    path: PathBuf,
    raw: String,
    parsed: Option<Value>,
}

impl BaseConfig {
    /// Read and snapshot the configuration file. A UTF-8 BOM is tolerated;
    /// unparseable JSON is kept as raw text (merging will fail, hashing
    /// falls back to raw bytes).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let parsed = serde_json::from_str(raw.trim_start_matches('\u{feff}')).ok();
        Ok(Self {
            path: path.to_path_buf(),
            raw,
            parsed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The document text exactly as snapshotted.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Produce a new configuration value with the combo's tunable fields
    /// applied. The snapshot itself is never modified.
    pub fn merge_combo(&self, combo: &ComboSpec) -> Result<Value> {
        let mut cfg = self
            .parsed
            .clone()
            .with_context(|| format!("config is not valid JSON: {}", self.path.display()))?;
        apply_combo(&mut cfg, combo);
        Ok(cfg)
    }

    /// Hash of the document with all tunable keys stripped.
    pub fn stripped_hash(&self) -> String {
        match &self.parsed {
            Some(value) => {
                let mut stripped = value.clone();
                strip_tunables(&mut stripped);
                stable_json_hash(&stripped)
            }
            None => raw_bytes_hash(self.raw.as_bytes()),
        }
    }
}

/// Set every tunable field of `combo` on `cfg`, creating the `trading` and
/// per-strategy nodes when absent or malformed.
pub fn apply_combo(cfg: &mut Value, combo: &ComboSpec) {
    if !cfg.is_object() {
        *cfg = json!({});
    }
    let root = cfg.as_object_mut().expect("config root forced to object");

    let trading = root
        .entry("trading")
        .or_insert_with(|| json!({}));
    if !trading.is_object() {
        *trading = json!({});
    }
    let t = trading.as_object_mut().expect("trading forced to object");
    t.insert("max_new_orders_per_scan".into(), json!(combo.max_new_orders_per_scan));
    t.insert("min_expected_edge_pct".into(), json!(combo.min_expected_edge_pct));
    t.insert("min_reward_risk".into(), json!(combo.min_reward_risk));
    t.insert("min_rr_weak_signal".into(), json!(combo.min_rr_weak_signal));
    t.insert("min_rr_strong_signal".into(), json!(combo.min_rr_strong_signal));
    t.insert(
        "min_strategy_trades_for_ev".into(),
        json!(combo.min_strategy_trades_for_ev),
    );
    t.insert(
        "min_strategy_expectancy_krw".into(),
        json!(combo.min_strategy_expectancy_krw),
    );
    t.insert(
        "min_strategy_profit_factor".into(),
        json!(combo.min_strategy_profit_factor),
    );
    t.insert("avoid_high_volatility".into(), json!(combo.avoid_high_volatility));
    t.insert("avoid_trending_down".into(), json!(combo.avoid_trending_down));
    t.insert("hostility_ewma_alpha".into(), json!(combo.hostility_ewma_alpha));
    t.insert(
        "hostility_hostile_threshold".into(),
        json!(combo.hostility_hostile_threshold),
    );
    t.insert(
        "hostility_severe_threshold".into(),
        json!(combo.hostility_severe_threshold),
    );
    t.insert(
        "hostility_extreme_threshold".into(),
        json!(combo.hostility_extreme_threshold),
    );
    t.insert("hostility_pause_scans".into(), json!(combo.hostility_pause_scans));
    t.insert(
        "hostility_pause_scans_extreme".into(),
        json!(combo.hostility_pause_scans_extreme),
    );
    t.insert(
        "hostility_pause_recent_sample_min".into(),
        json!(combo.hostility_pause_recent_sample_min),
    );
    t.insert(
        "hostility_pause_recent_expectancy_krw".into(),
        json!(combo.hostility_pause_recent_expectancy_krw),
    );
    t.insert(
        "hostility_pause_recent_win_rate".into(),
        json!(combo.hostility_pause_recent_win_rate),
    );
    t.insert(
        "backtest_hostility_pause_candles".into(),
        json!(combo.backtest_hostility_pause_candles),
    );
    t.insert(
        "backtest_hostility_pause_candles_extreme".into(),
        json!(combo.backtest_hostility_pause_candles_extreme),
    );

    let strategies = root
        .entry("strategies")
        .or_insert_with(|| json!({}));
    if !strategies.is_object() {
        *strategies = json!({});
    }
    let s = strategies.as_object_mut().expect("strategies forced to object");
    let strengths = [
        ("scalping", combo.scalping_min_signal_strength),
        ("momentum", combo.momentum_min_signal_strength),
        ("breakout", combo.breakout_min_signal_strength),
        ("mean_reversion", combo.mean_reversion_min_signal_strength),
    ];
    for (name, strength) in strengths {
        let node = s.entry(name).or_insert_with(|| json!({}));
        if !node.is_object() {
            *node = json!({});
        }
        node.as_object_mut()
            .expect("strategy node forced to object")
            .insert("min_signal_strength".into(), json!(strength));
    }
}

fn strip_tunables(cfg: &mut Value) {
    if let Some(trading) = cfg.get_mut("trading").and_then(Value::as_object_mut) {
        for key in TUNABLE_TRADING_KEYS {
            trading.remove(*key);
        }
    }
    if let Some(strategies) = cfg.get_mut("strategies").and_then(Value::as_object_mut) {
        for name in TUNABLE_STRATEGIES {
            if let Some(node) = strategies.get_mut(*name).and_then(Value::as_object_mut) {
                node.remove("min_signal_strength");
            }
            // A strategy node that only ever held tunables is an artifact of
            // a previous merge; dropping it keeps the stripped hash equal
            // before and after a combo has been applied.
            if strategies
                .get(*name)
                .and_then(Value::as_object)
                .is_some_and(|node| node.is_empty())
            {
                strategies.remove(*name);
            }
        }
    }
}

/// Write a configuration value to the shared path with a trailing newline.
pub fn write_config(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir {}", parent.display()))?;
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(path, text)
        .with_context(|| format!("failed to write config: {}", path.display()))
}

/// Scope guard restoring a file's original content.
///
/// Captured before the first mutation; restores on drop unless `restore`
/// already ran. Drop ignores write errors — a failing restore must not turn
/// an unwinding evaluation error into an abort.
#[derive(Debug)]
pub struct ConfigRestorer {
    path: PathBuf,
    original: String,
    restored: bool,
}

impl ConfigRestorer {
    pub fn capture(path: &Path) -> Result<Self> {
        let original = std::fs::read_to_string(path)
            .with_context(|| format!("failed to snapshot config: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            original,
            restored: false,
        })
    }

    /// Eager restore with error reporting. Subsequent drop is a no-op.
    pub fn restore(&mut self) -> Result<()> {
        self.restored = true;
        std::fs::write(&self.path, &self.original)
            .with_context(|| format!("failed to restore config: {}", self.path.display()))
    }
}

impl Drop for ConfigRestorer {
    fn drop(&mut self) {
        if !self.restored {
            let _ = std::fs::write(&self.path, &self.original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combos::legacy_baseline;
    use std::fs;
    use std::path::PathBuf;

    fn temp_config(tag: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edgetune_config_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, content).unwrap();
        path
    }

    const SAMPLE: &str = r#"{
        "trading": {"min_reward_risk": 1.0, "order_timeout_sec": 30},
        "strategies": {"scalping": {"min_signal_strength": 0.5, "enabled": true}},
        "exchange": {"name": "upbit"}
    }"#;

    #[test]
    fn test_merge_is_pure() {
        let path = temp_config("pure", SAMPLE);
        let base = BaseConfig::load(&path).unwrap();
        let merged = base.merge_combo(&legacy_baseline()).unwrap();

        assert_eq!(merged["trading"]["min_reward_risk"], json!(1.20));
        assert_eq!(merged["trading"]["order_timeout_sec"], json!(30));
        assert_eq!(
            merged["strategies"]["momentum"]["min_signal_strength"],
            json!(0.72)
        );
        // Snapshot untouched.
        assert!(base.raw().contains("\"min_reward_risk\": 1.0"));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_stripped_hash_ignores_tunables() {
        let path_a = temp_config("hash_a", SAMPLE);
        let base_a = BaseConfig::load(&path_a).unwrap();

        let merged = base_a.merge_combo(&legacy_baseline()).unwrap();
        let path_b = temp_config("hash_b", &merged.to_string());
        let base_b = BaseConfig::load(&path_b).unwrap();

        assert_eq!(base_a.stripped_hash(), base_b.stripped_hash());

        // A non-tunable edit must change the hash.
        let path_c = temp_config("hash_c", &SAMPLE.replace("upbit", "binance"));
        let base_c = BaseConfig::load(&path_c).unwrap();
        assert_ne!(base_a.stripped_hash(), base_c.stripped_hash());

        for p in [path_a, path_b, path_c] {
            let _ = fs::remove_dir_all(p.parent().unwrap());
        }
    }

    #[test]
    fn test_unparseable_config_hashes_raw() {
        let path = temp_config("rawhash", "not json at all {");
        let base = BaseConfig::load(&path).unwrap();
        assert_eq!(base.stripped_hash().len(), 64);
        assert!(base.merge_combo(&legacy_baseline()).is_err());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_restorer_restores_on_drop() {
        let path = temp_config("restore", SAMPLE);
        {
            let _guard = ConfigRestorer::capture(&path).unwrap();
            fs::write(&path, "clobbered").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_restorer_explicit_restore() {
        let path = temp_config("restore_explicit", SAMPLE);
        let mut guard = ConfigRestorer::capture(&path).unwrap();
        fs::write(&path, "clobbered").unwrap();
        guard.restore().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
