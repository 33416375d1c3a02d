//! Candidate combo generation.
//!
//! A [`ComboSpec`] bundles every tunable threshold the backtest gate exposes:
//! order-rate caps, edge and reward/risk floors, per-strategy viability
//! floors, the hostility response block, and per-strategy minimum signal
//! strengths. Combos are generated deterministically per scenario mode —
//! no randomness anywhere, so repeated runs produce byte-identical candidate
//! lists and the evaluation cache actually pays off.
//!
//! ## Scenario modes
//!
//! | Mode            | Shape                                                |
//! |-----------------|------------------------------------------------------|
//! | `legacy_only`   | The single current-baseline combo                    |
//! | `diverse_light` | Small edge × reward/risk grid, derived dependents    |
//! | `diverse_wide`  | Wider grid over the same axes                        |
//! | `quality_focus` | Hand-picked seed profiles + clamped ± perturbations  |
//!
//! Grid points only vary the primary axes; every dependent parameter
//! (weak/strong RR bands, expectancy/trade-count ladders, hostility pause
//! windows) is derived from the axis values. Identity is a canonical
//! fingerprint over the tunable fields; generation dedupes on it with
//! first-occurrence-wins ordering before truncating to the requested cap.

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::fingerprint::{
    canonical_hash, encode_bool, encode_f64, encode_u32, encode_u8, CanonicalBytes,
    FINGERPRINT_ENCODING_VERSION,
};

/// Candidate generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ScenarioMode {
    LegacyOnly,
    DiverseLight,
    DiverseWide,
    QualityFocus,
}

impl ScenarioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioMode::LegacyOnly => "legacy_only",
            ScenarioMode::DiverseLight => "diverse_light",
            ScenarioMode::DiverseWide => "diverse_wide",
            ScenarioMode::QualityFocus => "quality_focus",
        }
    }
}

impl std::fmt::Display for ScenarioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, versioned bundle of tunable gate parameters.
///
/// Immutable once generated. `combo_id`/`description` are labels only and do
/// not participate in the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboSpec {
    pub combo_id: String,
    pub description: String,

    pub max_new_orders_per_scan: u32,
    pub min_expected_edge_pct: f64,
    pub min_reward_risk: f64,
    pub min_rr_weak_signal: f64,
    pub min_rr_strong_signal: f64,
    pub min_strategy_trades_for_ev: u32,
    pub min_strategy_expectancy_krw: f64,
    pub min_strategy_profit_factor: f64,
    pub avoid_high_volatility: bool,
    pub avoid_trending_down: bool,

    pub hostility_ewma_alpha: f64,
    pub hostility_hostile_threshold: f64,
    pub hostility_severe_threshold: f64,
    pub hostility_extreme_threshold: f64,
    pub hostility_pause_scans: u32,
    pub hostility_pause_scans_extreme: u32,
    pub hostility_pause_recent_sample_min: u32,
    pub hostility_pause_recent_expectancy_krw: f64,
    pub hostility_pause_recent_win_rate: f64,
    pub backtest_hostility_pause_candles: u32,
    pub backtest_hostility_pause_candles_extreme: u32,

    pub scalping_min_signal_strength: f64,
    pub momentum_min_signal_strength: f64,
    pub breakout_min_signal_strength: f64,
    pub mean_reversion_min_signal_strength: f64,
}

impl CanonicalBytes for ComboSpec {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(192);
        encode_u8(&mut buf, FINGERPRINT_ENCODING_VERSION);
        encode_u32(&mut buf, self.max_new_orders_per_scan);
        encode_f64(&mut buf, self.min_expected_edge_pct);
        encode_f64(&mut buf, self.min_reward_risk);
        encode_f64(&mut buf, self.min_rr_weak_signal);
        encode_f64(&mut buf, self.min_rr_strong_signal);
        encode_u32(&mut buf, self.min_strategy_trades_for_ev);
        encode_f64(&mut buf, self.min_strategy_expectancy_krw);
        encode_f64(&mut buf, self.min_strategy_profit_factor);
        encode_bool(&mut buf, self.avoid_high_volatility);
        encode_bool(&mut buf, self.avoid_trending_down);
        encode_f64(&mut buf, self.hostility_ewma_alpha);
        encode_f64(&mut buf, self.hostility_hostile_threshold);
        encode_f64(&mut buf, self.hostility_severe_threshold);
        encode_f64(&mut buf, self.hostility_extreme_threshold);
        encode_u32(&mut buf, self.hostility_pause_scans);
        encode_u32(&mut buf, self.hostility_pause_scans_extreme);
        encode_u32(&mut buf, self.hostility_pause_recent_sample_min);
        encode_f64(&mut buf, self.hostility_pause_recent_expectancy_krw);
        encode_f64(&mut buf, self.hostility_pause_recent_win_rate);
        encode_u32(&mut buf, self.backtest_hostility_pause_candles);
        encode_u32(&mut buf, self.backtest_hostility_pause_candles_extreme);
        encode_f64(&mut buf, self.scalping_min_signal_strength);
        encode_f64(&mut buf, self.momentum_min_signal_strength);
        encode_f64(&mut buf, self.breakout_min_signal_strength);
        encode_f64(&mut buf, self.mean_reversion_min_signal_strength);
        buf
    }
}

impl ComboSpec {
    /// Stable content identity over the tunable fields.
    pub fn fingerprint(&self) -> String {
        canonical_hash(self)
    }
}

/// The combo currently shipped in the build configuration.
pub fn legacy_baseline() -> ComboSpec {
    ComboSpec {
        combo_id: "baseline_current".into(),
        description: "Current baseline in build config.".into(),
        max_new_orders_per_scan: 2,
        min_expected_edge_pct: 0.0010,
        min_reward_risk: 1.20,
        min_rr_weak_signal: 1.80,
        min_rr_strong_signal: 1.20,
        min_strategy_trades_for_ev: 30,
        min_strategy_expectancy_krw: -2.0,
        min_strategy_profit_factor: 0.95,
        avoid_high_volatility: true,
        avoid_trending_down: true,
        hostility_ewma_alpha: 0.14,
        hostility_hostile_threshold: 0.62,
        hostility_severe_threshold: 0.82,
        hostility_extreme_threshold: 0.88,
        hostility_pause_scans: 4,
        hostility_pause_scans_extreme: 6,
        hostility_pause_recent_sample_min: 10,
        hostility_pause_recent_expectancy_krw: 0.0,
        hostility_pause_recent_win_rate: 0.40,
        backtest_hostility_pause_candles: 36,
        backtest_hostility_pause_candles_extreme: 60,
        scalping_min_signal_strength: 0.70,
        momentum_min_signal_strength: 0.72,
        breakout_min_signal_strength: 0.40,
        mean_reversion_min_signal_strength: 0.40,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Grid scenarios for the two diverse modes.
///
/// The edge × reward/risk product is the real search space; signal-strength
/// grids are cycled by grid index so neighbouring grid points differ on
/// those axes too without multiplying the combo count.
fn diverse_scenarios(mode: ScenarioMode) -> Vec<ComboSpec> {
    let wide = mode == ScenarioMode::DiverseWide;
    let edge_grid: &[f64] = if wide {
        &[0.0006, 0.0008, 0.0010, 0.0012, 0.0014, 0.0016]
    } else {
        &[0.0008, 0.0010, 0.0012, 0.0014]
    };
    let rr_grid: &[f64] = if wide {
        &[1.05, 1.15, 1.25, 1.35]
    } else {
        &[1.10, 1.20, 1.30]
    };
    let scalp_grid: &[f64] = if wide {
        &[0.62, 0.66, 0.70, 0.74]
    } else {
        &[0.64, 0.68, 0.72]
    };
    let mom_grid: &[f64] = if wide {
        &[0.60, 0.64, 0.68, 0.72, 0.76]
    } else {
        &[0.62, 0.68, 0.74]
    };
    let breakout_grid: &[f64] = if wide { &[0.35, 0.40, 0.45] } else { &[0.36, 0.42] };
    let mrev_grid: &[f64] = if wide { &[0.35, 0.40, 0.45] } else { &[0.36, 0.42] };

    let mut generated = Vec::new();
    let mut i = 0usize;
    for &edge in edge_grid {
        for &rr in rr_grid {
            let weak = round2((rr + 0.45).min(2.20));
            let strong = round2((rr - 0.10).max(0.80));
            let ev_trades = if rr >= 1.30 {
                35
            } else if rr >= 1.20 {
                25
            } else {
                18
            };
            let ev_expect = if edge >= 0.0014 {
                0.0
            } else if edge >= 0.0010 {
                -1.0
            } else {
                -3.0
            };
            let ev_pf = if rr >= 1.30 {
                1.00
            } else if rr >= 1.20 {
                0.95
            } else {
                0.90
            };

            generated.push(ComboSpec {
                combo_id: format!("scenario_{}_{:03}", mode, i),
                description: format!("Auto-generated {} scenario", mode),
                max_new_orders_per_scan: if rr >= 1.25 { 2 } else { 3 },
                min_expected_edge_pct: edge,
                min_reward_risk: rr,
                min_rr_weak_signal: weak,
                min_rr_strong_signal: strong,
                min_strategy_trades_for_ev: ev_trades,
                min_strategy_expectancy_krw: ev_expect,
                min_strategy_profit_factor: ev_pf,
                avoid_high_volatility: edge >= 0.0010,
                avoid_trending_down: rr >= 1.20,
                hostility_ewma_alpha: if rr >= 1.25 { 0.16 } else { 0.12 },
                hostility_hostile_threshold: if rr >= 1.30 { 0.64 } else { 0.60 },
                hostility_severe_threshold: if rr >= 1.30 { 0.84 } else { 0.80 },
                hostility_extreme_threshold: if rr >= 1.30 { 0.90 } else { 0.86 },
                hostility_pause_scans: if rr >= 1.30 { 5 } else { 3 },
                hostility_pause_scans_extreme: if rr >= 1.30 { 8 } else { 5 },
                hostility_pause_recent_sample_min: 10,
                hostility_pause_recent_expectancy_krw: 0.0,
                hostility_pause_recent_win_rate: if rr >= 1.30 { 0.42 } else { 0.38 },
                backtest_hostility_pause_candles: if rr >= 1.30 { 45 } else { 28 },
                backtest_hostility_pause_candles_extreme: if rr >= 1.30 { 72 } else { 48 },
                scalping_min_signal_strength: scalp_grid[i % scalp_grid.len()],
                momentum_min_signal_strength: mom_grid[i % mom_grid.len()],
                breakout_min_signal_strength: breakout_grid[i % breakout_grid.len()],
                mean_reversion_min_signal_strength: mrev_grid[i % mrev_grid.len()],
            });
            i += 1;
        }
    }
    generated
}

/// One hand-authored quality profile: the axes that vary between seeds.
struct QualitySeed {
    edge: f64,
    rr: f64,
    weak: f64,
    strong: f64,
    ev_trades: u32,
    ev_exp: f64,
    ev_pf: f64,
    scalp: f64,
    mom: f64,
    brk: f64,
    mrev: f64,
}

const QUALITY_SEEDS: &[QualitySeed] = &[
    QualitySeed {
        edge: 0.0010,
        rr: 1.30,
        weak: 1.75,
        strong: 1.20,
        ev_trades: 35,
        ev_exp: -1.0,
        ev_pf: 1.00,
        scalp: 0.72,
        mom: 0.74,
        brk: 0.42,
        mrev: 0.42,
    },
    QualitySeed {
        edge: 0.0012,
        rr: 1.35,
        weak: 1.85,
        strong: 1.25,
        ev_trades: 40,
        ev_exp: -0.5,
        ev_pf: 1.05,
        scalp: 0.74,
        mom: 0.76,
        brk: 0.44,
        mrev: 0.44,
    },
    QualitySeed {
        edge: 0.0014,
        rr: 1.40,
        weak: 1.95,
        strong: 1.30,
        ev_trades: 45,
        ev_exp: 0.0,
        ev_pf: 1.08,
        scalp: 0.76,
        mom: 0.78,
        brk: 0.46,
        mrev: 0.45,
    },
    QualitySeed {
        edge: 0.0011,
        rr: 1.32,
        weak: 1.80,
        strong: 1.22,
        ev_trades: 38,
        ev_exp: -0.7,
        ev_pf: 1.03,
        scalp: 0.73,
        mom: 0.75,
        brk: 0.43,
        mrev: 0.43,
    },
];

fn quality_seed_combo(index: usize, seed: &QualitySeed) -> ComboSpec {
    ComboSpec {
        combo_id: format!("scenario_quality_focus_{:03}", index),
        description: "Auto-generated quality-focused scenario".into(),
        max_new_orders_per_scan: 2,
        min_expected_edge_pct: seed.edge,
        min_reward_risk: seed.rr,
        min_rr_weak_signal: seed.weak,
        min_rr_strong_signal: seed.strong,
        min_strategy_trades_for_ev: seed.ev_trades,
        min_strategy_expectancy_krw: seed.ev_exp,
        min_strategy_profit_factor: seed.ev_pf,
        avoid_high_volatility: true,
        avoid_trending_down: true,
        hostility_ewma_alpha: 0.16,
        hostility_hostile_threshold: 0.64,
        hostility_severe_threshold: 0.84,
        hostility_extreme_threshold: 0.90,
        hostility_pause_scans: 5,
        hostility_pause_scans_extreme: 8,
        hostility_pause_recent_sample_min: 10,
        hostility_pause_recent_expectancy_krw: 0.0,
        hostility_pause_recent_win_rate: 0.42,
        backtest_hostility_pause_candles: 45,
        backtest_hostility_pause_candles_extreme: 72,
        scalping_min_signal_strength: seed.scalp,
        momentum_min_signal_strength: seed.mom,
        breakout_min_signal_strength: seed.brk,
        mean_reversion_min_signal_strength: seed.mrev,
    }
}

/// (d_edge, d_rr, d_signal) perturbation steps applied to each seed.
const QUALITY_PERTURBATIONS: &[(f64, f64, f64)] = &[
    (-0.0001, -0.05, -0.01),
    (-0.0001, 0.00, -0.01),
    (0.0000, 0.05, 0.00),
    (0.0001, 0.00, 0.01),
    (0.0001, 0.05, 0.01),
];

/// Quality-focus scenarios: the seed profiles plus systematic perturbations
/// along (edge, reward/risk, signal strength), every derived value clamped
/// to its valid range. Fills up to `max_scenarios` (24 when unbounded).
fn quality_scenarios(max_scenarios: usize) -> Vec<ComboSpec> {
    let mut generated: Vec<ComboSpec> = QUALITY_SEEDS
        .iter()
        .enumerate()
        .map(|(i, seed)| quality_seed_combo(i, seed))
        .collect();

    let target_count = if max_scenarios > 0 { max_scenarios } else { 24 };
    let mut idx = generated.len();

    for seed in QUALITY_SEEDS {
        if idx >= target_count {
            break;
        }
        for &(d_edge, d_rr, d_sig) in QUALITY_PERTURBATIONS {
            if idx >= target_count {
                break;
            }
            let rr_up = d_rr > 0.0;
            let min_rr = round2((seed.rr + d_rr).max(1.05));
            let nudge2: f64 = if rr_up { 0.02 } else { -0.02 };

            generated.push(ComboSpec {
                combo_id: format!("scenario_quality_focus_{:03}", idx),
                description: "Auto-generated quality-focused perturbation".into(),
                max_new_orders_per_scan: if min_rr >= 1.25 { 2 } else { 3 },
                min_expected_edge_pct: round4((seed.edge + d_edge).clamp(0.0006, 0.0018)),
                min_reward_risk: min_rr,
                min_rr_weak_signal: round2((min_rr + 0.50).min(2.20)),
                min_rr_strong_signal: round2((min_rr - 0.10).max(0.90)),
                min_strategy_trades_for_ev: (seed.ev_trades as i64 + if rr_up { 2 } else { -2 })
                    .clamp(20, 55) as u32,
                min_strategy_expectancy_krw: round2(
                    (seed.ev_exp + if rr_up { 0.3 } else { -0.2 }).clamp(-2.5, 0.8),
                ),
                min_strategy_profit_factor: round2(
                    (seed.ev_pf + if rr_up { 0.02 } else { -0.01 }).clamp(0.92, 1.12),
                ),
                avoid_high_volatility: true,
                avoid_trending_down: min_rr >= 1.20,
                hostility_ewma_alpha: round2((0.16 + nudge2).clamp(0.06, 0.30)),
                hostility_hostile_threshold: round2((0.64 + nudge2).clamp(0.50, 0.78)),
                hostility_severe_threshold: round2((0.84 + nudge2).clamp(0.65, 0.90)),
                hostility_extreme_threshold: round2((0.90 + nudge2).clamp(0.70, 0.95)),
                hostility_pause_scans: (5i64 + if rr_up { 1 } else { -1 }).clamp(2, 12) as u32,
                hostility_pause_scans_extreme: (8i64 + if rr_up { 2 } else { -2 }).clamp(3, 16)
                    as u32,
                hostility_pause_recent_sample_min: 10,
                hostility_pause_recent_expectancy_krw: 0.0,
                hostility_pause_recent_win_rate: round2((0.42 + nudge2).clamp(0.30, 0.55)),
                backtest_hostility_pause_candles: (45i64 + if rr_up { 6 } else { -6 })
                    .clamp(12, 180) as u32,
                backtest_hostility_pause_candles_extreme: (72i64 + if rr_up { 8 } else { -8 })
                    .clamp(24, 240) as u32,
                scalping_min_signal_strength: round2((seed.scalp + d_sig).clamp(0.62, 0.80)),
                momentum_min_signal_strength: round2((seed.mom + d_sig).clamp(0.60, 0.82)),
                breakout_min_signal_strength: round2((seed.brk + d_sig * 0.6).clamp(0.34, 0.50)),
                mean_reversion_min_signal_strength: round2(
                    (seed.mrev + d_sig * 0.6).clamp(0.34, 0.50),
                ),
            });
            idx += 1;
        }
    }
    generated
}

/// Drop combos whose fingerprint has been seen before, keeping first
/// occurrences in order.
fn dedupe_combos(combos: Vec<ComboSpec>) -> Vec<ComboSpec> {
    let mut seen = std::collections::HashSet::new();
    combos
        .into_iter()
        .filter(|combo| seen.insert(combo.fingerprint()))
        .collect()
}

/// Build the ordered, deduplicated candidate list for a scenario mode.
///
/// `max_scenarios == 0` means unbounded (except `quality_focus`, which fills
/// to its default 24). Errors when the resulting set is empty.
pub fn build_combos(
    mode: ScenarioMode,
    include_legacy: bool,
    max_scenarios: usize,
) -> Result<Vec<ComboSpec>> {
    let combos = match mode {
        ScenarioMode::LegacyOnly => vec![legacy_baseline()],
        ScenarioMode::DiverseLight | ScenarioMode::DiverseWide => {
            let generated = diverse_scenarios(mode);
            if include_legacy {
                let mut all = vec![legacy_baseline()];
                all.extend(generated);
                all
            } else {
                generated
            }
        }
        ScenarioMode::QualityFocus => {
            let generated = quality_scenarios(max_scenarios);
            if include_legacy {
                let mut all = vec![legacy_baseline()];
                all.extend(generated);
                all
            } else {
                generated
            }
        }
    };

    let mut combos = dedupe_combos(combos);
    if max_scenarios > 0 && combos.len() > max_scenarios {
        combos.truncate(max_scenarios);
    }
    if combos.is_empty() {
        bail!(
            "no tuning combos selected (scenario_mode={}, max_scenarios={})",
            mode,
            max_scenarios
        );
    }
    Ok(combos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_legacy_only_is_single_baseline() {
        let combos = build_combos(ScenarioMode::LegacyOnly, false, 0).unwrap();
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].combo_id, "baseline_current");
    }

    #[test]
    fn test_generation_deterministic() {
        for mode in [
            ScenarioMode::DiverseLight,
            ScenarioMode::DiverseWide,
            ScenarioMode::QualityFocus,
        ] {
            let a = build_combos(mode, true, 0).unwrap();
            let b = build_combos(mode, true, 0).unwrap();
            assert_eq!(a, b, "mode {} not deterministic", mode);
        }
    }

    #[test]
    fn test_fingerprints_unique_after_dedupe() {
        let combos = build_combos(ScenarioMode::DiverseWide, true, 0).unwrap();
        let fps: HashSet<String> = combos.iter().map(|c| c.fingerprint()).collect();
        assert_eq!(fps.len(), combos.len());
    }

    #[test]
    fn test_diverse_light_grid_size() {
        // 4 edges x 3 rr points; signal grids cycle, they do not multiply.
        let combos = build_combos(ScenarioMode::DiverseLight, false, 0).unwrap();
        assert_eq!(combos.len(), 12);
    }

    #[test]
    fn test_quality_focus_default_fill() {
        // 4 seeds + 4x5 perturbations.
        let combos = build_combos(ScenarioMode::QualityFocus, false, 0).unwrap();
        assert_eq!(combos.len(), 24);
    }

    #[test]
    fn test_max_scenarios_truncates() {
        let combos = build_combos(ScenarioMode::DiverseWide, false, 5).unwrap();
        assert_eq!(combos.len(), 5);
    }

    #[test]
    fn test_include_legacy_goes_first() {
        let combos = build_combos(ScenarioMode::DiverseLight, true, 0).unwrap();
        assert_eq!(combos[0].combo_id, "baseline_current");
        assert_eq!(combos.len(), 13);
    }

    #[test]
    fn test_dependent_params_derived_from_axes() {
        let combos = build_combos(ScenarioMode::DiverseLight, false, 0).unwrap();
        for combo in &combos {
            let rr = combo.min_reward_risk;
            assert_eq!(combo.min_rr_weak_signal, round2((rr + 0.45).min(2.20)));
            assert_eq!(combo.min_rr_strong_signal, round2((rr - 0.10).max(0.80)));
            assert!(combo.min_rr_strong_signal <= combo.min_rr_weak_signal);
        }
    }

    #[test]
    fn test_quality_perturbations_stay_clamped() {
        let combos = build_combos(ScenarioMode::QualityFocus, false, 0).unwrap();
        for combo in &combos {
            assert!(combo.min_expected_edge_pct >= 0.0006);
            assert!(combo.min_expected_edge_pct <= 0.0018);
            assert!(combo.scalping_min_signal_strength <= 0.80);
            assert!(combo.breakout_min_signal_strength >= 0.34);
            assert!(combo.min_reward_risk >= 1.05);
        }
    }

    #[test]
    fn test_fingerprint_ignores_labels() {
        let mut a = legacy_baseline();
        a.combo_id = "renamed".into();
        a.description = "something else".into();
        assert_eq!(a.fingerprint(), legacy_baseline().fingerprint());
    }
}
