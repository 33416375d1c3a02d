//! The profitability matrix runner.
//!
//! Evaluates the shared configuration across evaluation profiles × datasets
//! by invoking the opaque backtest executable once per cell, then aggregates
//! per-profile gate summaries into the gate report document consumed by the
//! tuner and the improvement loop.
//!
//! ## Concurrency
//!
//! Datasets within a profile are embarrassingly parallel: each worker runs
//! one backtest subprocess and parses its JSON tail. The pool is bounded by
//! `min(dataset count, available parallelism, configured cap)`. Workers
//! share nothing mutable; results are merged after the whole fan-out
//! completes, and any worker's failure aborts the evaluation — a partially
//! evaluated profile would silently skew the gate averages.
//!
//! Retries live HERE, per backtest invocation, not in the tuner: a flaky
//! dataset load gets `backtest_retry_count` attempts before the failure is
//! considered real.
//!
//! ## Hostility-adaptive thresholds
//!
//! When enabled, each dataset gets an adversarial score in [0, 100] derived
//! from how the profiles fared on it (loss share, peak drawdown, win-rate
//! shortfall). The average score classifies the dataset set as low / medium /
//! high hostility, and the gate floors are relaxed stepwise for hostile
//! sets — by default only the trade-count floor (`trades_only`), since thin
//! markets legitimately produce fewer signals but should not excuse losing
//! ones. Both requested and effective floors are embedded in the report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};

use crate::config::ConfigRestorer;
use crate::report::{
    parse_last_json_line, BacktestOutcome, ComparisonGate, FloorSet, GateReport,
    HostilityAdaptive, HostilityAssessment, MatrixRow, ProfileSummary, ThresholdReport,
};
use crate::types::HostilityLevel;

/// One evaluation profile: which core plane flags the engine runs with.
#[derive(Debug, Clone, Copy)]
pub struct ProfileSpec {
    pub profile_id: &'static str,
    pub description: &'static str,
    pub bridge: bool,
    pub policy: bool,
    pub risk: bool,
    pub execution: bool,
}

/// The fixed profile table, ordered from fully-legacy to fully-core.
pub const PROFILES: &[ProfileSpec] = &[
    ProfileSpec {
        profile_id: "legacy_default",
        description: "All core plane flags disabled.",
        bridge: false,
        policy: false,
        risk: false,
        execution: false,
    },
    ProfileSpec {
        profile_id: "core_bridge_only",
        description: "Core bridge enabled, policy/risk/execution planes disabled.",
        bridge: true,
        policy: false,
        risk: false,
        execution: false,
    },
    ProfileSpec {
        profile_id: "core_policy_risk",
        description: "Core bridge + policy + risk enabled, execution plane disabled.",
        bridge: true,
        policy: true,
        risk: true,
        execution: false,
    },
    ProfileSpec {
        profile_id: "core_full",
        description: "All core plane flags enabled.",
        bridge: true,
        policy: true,
        risk: true,
        execution: true,
    },
];

/// Gate floors the matrix evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct GateThresholds {
    pub min_profit_factor: f64,
    pub min_expectancy_krw: f64,
    pub max_drawdown_pct: f64,
    pub min_profitable_ratio: f64,
    pub min_avg_win_rate_pct: f64,
    pub min_avg_trades: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_profit_factor: 1.00,
            min_expectancy_krw: 0.0,
            max_drawdown_pct: 12.0,
            min_profitable_ratio: 0.55,
            min_avg_win_rate_pct: 0.0,
            min_avg_trades: 10.0,
        }
    }
}

/// Candidate-vs-legacy regression tolerances.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonDeltas {
    pub min_profit_factor_delta: f64,
    pub min_expectancy_delta_krw: f64,
    pub min_total_profit_delta_krw: f64,
}

impl Default for ComparisonDeltas {
    fn default() -> Self {
        Self {
            min_profit_factor_delta: -0.05,
            min_expectancy_delta_krw: -5.0,
            min_total_profit_delta_krw: -10_000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatrixOptions {
    pub exe_path: PathBuf,
    pub config_path: PathBuf,
    pub datasets: Vec<PathBuf>,
    pub profile_ids: Vec<String>,
    pub thresholds: GateThresholds,
    pub exclude_low_trade_runs_for_gate: bool,
    pub min_trades_per_run_for_gate: u64,
    pub comparison: ComparisonDeltas,
    pub require_higher_tf_companions: bool,
    pub enable_hostility_adaptive_thresholds: bool,
    pub enable_hostility_adaptive_trades_only: bool,
    pub max_workers: usize,
    pub backtest_retry_count: u32,
    pub output_csv: PathBuf,
    pub output_profile_csv: PathBuf,
    pub output_json: PathBuf,
}

#[derive(Debug)]
pub struct MatrixOutcome {
    pub overall_gate_pass: bool,
    pub report_json: PathBuf,
}

/// Bounded worker count for the dataset fan-out.
pub fn worker_count(dataset_count: usize, cap: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    dataset_count.max(1).min(cores).min(cap.max(1))
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn safe_avg(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        0.0
    } else {
        collected.iter().sum::<f64>() / collected.len() as f64
    }
}

fn apply_profile_flags(cfg: &mut Value, profile: &ProfileSpec) {
    if !cfg.is_object() {
        *cfg = json!({});
    }
    let trading = cfg
        .as_object_mut()
        .expect("config root forced to object")
        .entry("trading")
        .or_insert_with(|| json!({}));
    if !trading.is_object() {
        *trading = json!({});
    }
    let t = trading.as_object_mut().expect("trading forced to object");
    t.insert("enable_core_plane_bridge".into(), json!(profile.bridge));
    t.insert("enable_core_policy_plane".into(), json!(profile.policy));
    t.insert("enable_core_risk_plane".into(), json!(profile.risk));
    t.insert("enable_core_execution_plane".into(), json!(profile.execution));
}

/// Run one backtest with retries. Retrying covers both subprocess failures
/// and an unparseable result tail; the last error wins.
fn invoke_backtest(
    exe: &Path,
    dataset: &Path,
    require_higher_tf: bool,
    retry_count: u32,
) -> Result<BacktestOutcome> {
    let attempts = retry_count.max(1);
    let mut last_error = None;
    for _ in 0..attempts {
        let mut cmd = Command::new(exe);
        cmd.arg("--backtest").arg(dataset).arg("--json");
        if require_higher_tf {
            cmd.arg("--require-higher-tf-companions");
        }
        let output = match cmd.output() {
            Ok(output) => output,
            Err(err) => {
                last_error = Some(anyhow::anyhow!(
                    "failed to spawn backtest {}: {}",
                    exe.display(),
                    err
                ));
                continue;
            }
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        match parse_last_json_line(&text) {
            Some(outcome) if output.status.success() => return Ok(outcome),
            _ => {
                last_error = Some(anyhow::anyhow!(
                    "backtest result unparseable (dataset={}, exit={})",
                    dataset.display(),
                    output.status
                ));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("backtest never attempted")))
}

fn build_row(
    profile: &ProfileSpec,
    dataset: &Path,
    outcome: &BacktestOutcome,
    exclude_low_trade: bool,
    min_trades_per_run: u64,
) -> MatrixRow {
    MatrixRow {
        profile_id: profile.profile_id.to_string(),
        profile_description: profile.description.to_string(),
        dataset: dataset
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        total_profit_krw: round4(outcome.total_profit),
        profit_factor: round4(outcome.profit_factor),
        expectancy_krw: round4(outcome.expectancy_krw),
        max_drawdown_pct: round4(outcome.max_drawdown * 100.0),
        total_trades: outcome.total_trades,
        win_rate_pct: round4(outcome.win_rate * 100.0),
        profitable: outcome.total_profit > 0.0,
        gate_trade_eligible: !exclude_low_trade || outcome.total_trades >= min_trades_per_run,
    }
}

/// Fan one profile out across the dataset set on a bounded rayon pool.
fn run_profile_backtests(opts: &MatrixOptions, profile: &ProfileSpec) -> Result<Vec<MatrixRow>> {
    use rayon::prelude::*;

    let workers = worker_count(opts.datasets.len(), opts.max_workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build backtest worker pool")?;

    let mut rows = pool.install(|| {
        opts.datasets
            .par_iter()
            .map(|dataset| {
                let outcome = invoke_backtest(
                    &opts.exe_path,
                    dataset,
                    opts.require_higher_tf_companions,
                    opts.backtest_retry_count,
                )?;
                Ok(build_row(
                    profile,
                    dataset,
                    &outcome,
                    opts.exclude_low_trade_runs_for_gate,
                    opts.min_trades_per_run_for_gate,
                ))
            })
            .collect::<Result<Vec<MatrixRow>>>()
    })?;
    rows.sort_by(|a, b| a.dataset.cmp(&b.dataset));
    Ok(rows)
}

/// Aggregate one profile's rows into its gate summary. Pure; the gate only
/// considers trade-eligible runs when exclusion is on.
pub fn summarize_profile(
    profile_id: &str,
    rows: &[MatrixRow],
    thresholds: &GateThresholds,
    exclude_low_trade: bool,
) -> ProfileSummary {
    let gate_rows: Vec<&MatrixRow> = if exclude_low_trade {
        rows.iter().filter(|r| r.gate_trade_eligible).collect()
    } else {
        rows.iter().collect()
    };

    let run_count = rows.len() as u32;
    let gate_run_count = gate_rows.len() as u32;
    let profitable_count = gate_rows.iter().filter(|r| r.profitable).count() as u32;
    let profitable_ratio = if gate_run_count > 0 {
        round4(profitable_count as f64 / gate_run_count as f64)
    } else {
        0.0
    };

    let avg_profit_factor = round4(safe_avg(gate_rows.iter().map(|r| r.profit_factor)));
    let avg_expectancy = round4(safe_avg(gate_rows.iter().map(|r| r.expectancy_krw)));
    let avg_win_rate_pct = round4(safe_avg(gate_rows.iter().map(|r| r.win_rate_pct)));
    let avg_trades = round4(safe_avg(gate_rows.iter().map(|r| r.total_trades as f64)));
    let peak_drawdown = round4(
        gate_rows
            .iter()
            .map(|r| r.max_drawdown_pct)
            .fold(0.0, f64::max),
    );
    let sum_profit = round4(gate_rows.iter().map(|r| r.total_profit_krw).sum());

    let gate_sample_pass = gate_run_count > 0;
    let gate_profit_factor_pass = avg_profit_factor >= thresholds.min_profit_factor;
    let gate_expectancy_pass = avg_expectancy >= thresholds.min_expectancy_krw;
    let gate_drawdown_pass = peak_drawdown <= thresholds.max_drawdown_pct;
    let gate_profitable_ratio_pass = profitable_ratio >= thresholds.min_profitable_ratio;
    let gate_win_rate_pass = avg_win_rate_pct >= thresholds.min_avg_win_rate_pct;
    let gate_trades_pass = avg_trades >= thresholds.min_avg_trades;

    ProfileSummary {
        profile_id: profile_id.to_string(),
        runs: run_count,
        runs_used_for_gate: gate_run_count,
        excluded_low_trade_runs: run_count - gate_run_count,
        profitable_runs: profitable_count,
        profitable_ratio,
        avg_profit_factor,
        avg_expectancy_krw: avg_expectancy,
        avg_win_rate_pct,
        peak_max_drawdown_pct: peak_drawdown,
        avg_total_trades: avg_trades,
        total_profit_sum_krw: sum_profit,
        gate_sample_pass,
        gate_profit_factor_pass,
        gate_expectancy_pass,
        gate_drawdown_pass,
        gate_profitable_ratio_pass,
        gate_win_rate_pass,
        gate_trades_pass,
        gate_pass: gate_sample_pass
            && gate_profit_factor_pass
            && gate_expectancy_pass
            && gate_drawdown_pass
            && gate_profitable_ratio_pass
            && gate_win_rate_pass
            && gate_trades_pass,
    }
}

/// Score one dataset's hostility from how the profiles fared on it.
///
/// Unlike raw candle statistics, this only needs the backtest outcomes that
/// are already in hand: the share of losing profiles, the worst drawdown,
/// and the win-rate shortfall below break-even quality.
pub fn dataset_adversarial_score(rows: &[&MatrixRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let loss_share =
        rows.iter().filter(|r| !r.profitable).count() as f64 / rows.len() as f64;
    let peak_dd = rows.iter().map(|r| r.max_drawdown_pct).fold(0.0, f64::max);
    let avg_win_rate = safe_avg(rows.iter().map(|r| r.win_rate_pct));

    let score = loss_share * 55.0
        + (peak_dd * 2.5).min(30.0)
        + ((48.0 - avg_win_rate).max(0.0) * 0.75).min(15.0);
    round4(score.clamp(0.0, 100.0))
}

/// Classify the dataset set and derive the effective floors.
pub fn resolve_adaptive_thresholds(
    matrix_rows: &[MatrixRow],
    requested: FloorSet,
    trades_only: bool,
) -> HostilityAdaptive {
    let mut by_dataset: BTreeMap<&str, Vec<&MatrixRow>> = BTreeMap::new();
    for row in matrix_rows {
        by_dataset.entry(row.dataset.as_str()).or_default().push(row);
    }

    let scores: Vec<f64> = by_dataset
        .values()
        .map(|rows| dataset_adversarial_score(rows))
        .collect();
    let avg_score = round4(safe_avg(scores.iter().copied()));

    let dataset_count = by_dataset.len().max(1) as f64;
    let all_loss_share = by_dataset
        .values()
        .filter(|rows| rows.iter().all(|r| !r.profitable))
        .count() as f64
        / dataset_count;
    let very_low_profit_share = by_dataset
        .values()
        .filter(|rows| {
            let profitable = rows.iter().filter(|r| r.profitable).count() as f64;
            profitable / rows.len().max(1) as f64 <= 0.25
        })
        .count() as f64
        / dataset_count;

    let level = if avg_score >= 60.0 || all_loss_share >= 0.70 {
        HostilityLevel::High
    } else if avg_score >= 45.0 || very_low_profit_share >= 0.60 {
        HostilityLevel::Medium
    } else {
        HostilityLevel::Low
    };

    let mut effective = requested;
    let (trades_factor, ratio_step, win_step, expectancy_step) = match level {
        HostilityLevel::Low => (1.0, 0.0, 0.0, 0.0),
        HostilityLevel::Medium => (0.75, 0.05, 2.0, 1.0),
        HostilityLevel::High => (0.50, 0.10, 4.0, 2.0),
    };
    effective.min_avg_trades = round4((requested.min_avg_trades * trades_factor).max(1.0));
    if !trades_only {
        effective.min_profitable_ratio =
            round4((requested.min_profitable_ratio - ratio_step).max(0.0));
        effective.min_avg_win_rate_pct =
            round4((requested.min_avg_win_rate_pct - win_step).max(0.0));
        effective.min_expectancy_krw = round4(requested.min_expectancy_krw - expectancy_step);
    }

    HostilityAdaptive {
        requested,
        effective,
        hostility: HostilityAssessment {
            hostility_level: level,
            avg_adversarial_score: avg_score,
        },
    }
}

fn build_comparison(summaries: &[ProfileSummary], deltas: &ComparisonDeltas) -> ComparisonGate {
    let legacy = summaries.iter().find(|s| s.profile_id == "legacy_default");
    let core = summaries.iter().find(|s| s.profile_id == "core_full");

    let mut gate = ComparisonGate {
        baseline_profile: "legacy_default".into(),
        candidate_profile: "core_full".into(),
        ..Default::default()
    };
    let (Some(legacy), Some(core)) = (legacy, core) else {
        return gate;
    };

    gate.comparison_available = true;
    gate.delta_avg_profit_factor = round4(core.avg_profit_factor - legacy.avg_profit_factor);
    gate.delta_avg_expectancy_krw = round4(core.avg_expectancy_krw - legacy.avg_expectancy_krw);
    gate.delta_total_profit_sum_krw =
        round4(core.total_profit_sum_krw - legacy.total_profit_sum_krw);
    gate.gate_profit_factor_delta_pass =
        gate.delta_avg_profit_factor >= deltas.min_profit_factor_delta;
    gate.gate_expectancy_delta_pass =
        gate.delta_avg_expectancy_krw >= deltas.min_expectancy_delta_krw;
    gate.gate_total_profit_delta_pass =
        gate.delta_total_profit_sum_krw >= deltas.min_total_profit_delta_krw;
    gate.gate_pass = gate.gate_profit_factor_delta_pass
        && gate.gate_expectancy_delta_pass
        && gate.gate_total_profit_delta_pass;
    gate
}

fn write_csv<T: serde::Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output dir {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open csv {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Run the full matrix and write all three artifacts.
pub fn run_matrix(opts: &MatrixOptions) -> Result<MatrixOutcome> {
    if opts.datasets.is_empty() {
        bail!("no datasets configured for the matrix run");
    }
    if !opts.exe_path.exists() {
        bail!("backtest executable not found: {}", opts.exe_path.display());
    }
    let profiles: Vec<&ProfileSpec> = PROFILES
        .iter()
        .filter(|p| opts.profile_ids.iter().any(|id| id == p.profile_id))
        .collect();
    if profiles.is_empty() {
        bail!("no valid profiles selected (requested: {:?})", opts.profile_ids);
    }

    let original: Value = serde_json::from_str(
        std::fs::read_to_string(&opts.config_path)
            .with_context(|| format!("failed to read config {}", opts.config_path.display()))?
            .trim_start_matches('\u{feff}'),
    )
    .with_context(|| format!("config is not valid JSON: {}", opts.config_path.display()))?;

    let mut restorer = ConfigRestorer::capture(&opts.config_path)?;
    let mut matrix_rows: Vec<MatrixRow> = Vec::new();
    let fanout_result = (|| -> Result<()> {
        for profile in &profiles {
            let mut cfg = original.clone();
            apply_profile_flags(&mut cfg, profile);
            crate::config::write_config(&opts.config_path, &cfg)?;
            matrix_rows.extend(run_profile_backtests(opts, profile)?);
        }
        Ok(())
    })();
    restorer.restore()?;
    fanout_result?;

    if matrix_rows.is_empty() {
        bail!("no profitability rows generated");
    }
    matrix_rows.sort_by(|a, b| (a.profile_id.as_str(), a.dataset.as_str())
        .cmp(&(b.profile_id.as_str(), b.dataset.as_str())));

    let adaptive = opts.enable_hostility_adaptive_thresholds.then(|| {
        resolve_adaptive_thresholds(
            &matrix_rows,
            FloorSet {
                min_profit_factor: opts.thresholds.min_profit_factor,
                min_expectancy_krw: opts.thresholds.min_expectancy_krw,
                min_profitable_ratio: opts.thresholds.min_profitable_ratio,
                min_avg_win_rate_pct: opts.thresholds.min_avg_win_rate_pct,
                min_avg_trades: opts.thresholds.min_avg_trades,
            },
            opts.enable_hostility_adaptive_trades_only,
        )
    });

    // Gate floors: the effective (possibly relaxed) set when adaptive mode
    // is on, otherwise the requested floors verbatim.
    let gate_thresholds = match &adaptive {
        Some(adaptive) => GateThresholds {
            min_profit_factor: adaptive.effective.min_profit_factor,
            min_expectancy_krw: adaptive.effective.min_expectancy_krw,
            max_drawdown_pct: opts.thresholds.max_drawdown_pct,
            min_profitable_ratio: adaptive.effective.min_profitable_ratio,
            min_avg_win_rate_pct: adaptive.effective.min_avg_win_rate_pct,
            min_avg_trades: adaptive.effective.min_avg_trades,
        },
        None => opts.thresholds,
    };

    let summaries: Vec<ProfileSummary> = profiles
        .iter()
        .map(|profile| {
            let rows: Vec<MatrixRow> = matrix_rows
                .iter()
                .filter(|r| r.profile_id == profile.profile_id)
                .cloned()
                .collect();
            summarize_profile(
                profile.profile_id,
                &rows,
                &gate_thresholds,
                opts.exclude_low_trade_runs_for_gate,
            )
        })
        .collect();

    let core_vs_legacy = build_comparison(&summaries, &opts.comparison);
    let profile_gate_pass = summaries.iter().all(|s| s.gate_pass);
    // The comparison gate only participates when both endpoints ran.
    let overall_gate_pass =
        profile_gate_pass && (!core_vs_legacy.comparison_available || core_vs_legacy.gate_pass);

    let report = GateReport {
        generated_at: Utc::now().to_rfc3339(),
        inputs: json!({
            "exe_path": opts.exe_path,
            "config_path": opts.config_path,
            "datasets": opts.datasets,
        }),
        thresholds: ThresholdReport {
            min_profit_factor: opts.thresholds.min_profit_factor,
            min_expectancy_krw: opts.thresholds.min_expectancy_krw,
            max_drawdown_pct: opts.thresholds.max_drawdown_pct,
            min_profitable_ratio: opts.thresholds.min_profitable_ratio,
            min_avg_win_rate_pct: opts.thresholds.min_avg_win_rate_pct,
            min_avg_trades: opts.thresholds.min_avg_trades,
            exclude_low_trade_runs_for_gate: opts.exclude_low_trade_runs_for_gate,
            min_trades_per_run_for_gate: opts.min_trades_per_run_for_gate as u32,
            hostility_adaptive: adaptive,
        },
        profile_gate_pass,
        overall_gate_pass,
        core_vs_legacy,
        profile_summaries: summaries.clone(),
        matrix_rows: matrix_rows.clone(),
    };

    write_csv(&opts.output_csv, &matrix_rows)?;
    write_csv(&opts.output_profile_csv, &summaries)?;
    if let Some(parent) = opts.output_json.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(&report)?;
    text.push('\n');
    std::fs::write(&opts.output_json, text)
        .with_context(|| format!("failed to write gate report {}", opts.output_json.display()))?;

    Ok(MatrixOutcome {
        overall_gate_pass,
        report_json: opts.output_json.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(profile_id: &str, dataset: &str, profit: f64, pf: f64, trades: u64) -> MatrixRow {
        MatrixRow {
            profile_id: profile_id.into(),
            profile_description: String::new(),
            dataset: dataset.into(),
            total_profit_krw: profit,
            profit_factor: pf,
            expectancy_krw: if profit > 0.0 { 10.0 } else { -10.0 },
            max_drawdown_pct: 5.0,
            total_trades: trades,
            win_rate_pct: if profit > 0.0 { 55.0 } else { 40.0 },
            profitable: profit > 0.0,
            gate_trade_eligible: trades >= 1,
        }
    }

    fn floors() -> FloorSet {
        FloorSet {
            min_profit_factor: 1.0,
            min_expectancy_krw: 0.0,
            min_profitable_ratio: 0.55,
            min_avg_win_rate_pct: 48.0,
            min_avg_trades: 10.0,
        }
    }

    #[test]
    fn test_summarize_profile_gates() {
        let rows = vec![
            row("core_full", "a.csv", 1000.0, 1.3, 20),
            row("core_full", "b.csv", 500.0, 1.1, 15),
            row("core_full", "c.csv", -200.0, 0.8, 12),
        ];
        let summary = summarize_profile("core_full", &rows, &GateThresholds::default(), true);
        assert_eq!(summary.runs_used_for_gate, 3);
        assert_eq!(summary.profitable_runs, 2);
        assert!((summary.profitable_ratio - 0.6667).abs() < 1e-9);
        assert!(summary.gate_trades_pass);
        assert!(summary.gate_profit_factor_pass);
        // 0.6667 >= 0.55
        assert!(summary.gate_profitable_ratio_pass);
    }

    #[test]
    fn test_low_trade_runs_excluded_from_gate() {
        let mut thin = row("core_full", "thin.csv", -50.0, 0.2, 0);
        thin.gate_trade_eligible = false;
        let rows = vec![row("core_full", "a.csv", 1000.0, 1.3, 20), thin];
        let summary = summarize_profile("core_full", &rows, &GateThresholds::default(), true);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.runs_used_for_gate, 1);
        assert_eq!(summary.excluded_low_trade_runs, 1);
        assert_eq!(summary.profitable_ratio, 1.0);
    }

    #[test]
    fn test_adversarial_score_rises_with_losses() {
        let benign = vec![
            row("a", "x.csv", 100.0, 1.2, 10),
            row("b", "x.csv", 100.0, 1.2, 10),
        ];
        let hostile = vec![
            row("a", "x.csv", -100.0, 0.6, 10),
            row("b", "x.csv", -100.0, 0.6, 10),
        ];
        let benign_refs: Vec<&MatrixRow> = benign.iter().collect();
        let hostile_refs: Vec<&MatrixRow> = hostile.iter().collect();
        assert!(dataset_adversarial_score(&hostile_refs) > dataset_adversarial_score(&benign_refs));
    }

    #[test]
    fn test_adaptive_level_high_when_everything_loses() {
        let rows = vec![
            row("a", "x.csv", -100.0, 0.5, 10),
            row("a", "y.csv", -100.0, 0.5, 10),
            row("a", "z.csv", -100.0, 0.5, 10),
        ];
        let adaptive = resolve_adaptive_thresholds(&rows, floors(), true);
        assert_eq!(adaptive.hostility.hostility_level, HostilityLevel::High);
        assert_eq!(adaptive.effective.min_avg_trades, 5.0);
        // trades_only: other floors untouched.
        assert_eq!(adaptive.effective.min_profitable_ratio, 0.55);
    }

    #[test]
    fn test_adaptive_low_keeps_requested_floors() {
        let rows = vec![
            row("a", "x.csv", 100.0, 1.2, 10),
            row("a", "y.csv", 120.0, 1.3, 12),
        ];
        let adaptive = resolve_adaptive_thresholds(&rows, floors(), false);
        assert_eq!(adaptive.hostility.hostility_level, HostilityLevel::Low);
        assert_eq!(adaptive.effective, adaptive.requested);
    }

    #[test]
    fn test_adaptive_full_relaxation_touches_all_floors() {
        let rows = vec![
            row("a", "x.csv", -100.0, 0.5, 10),
            row("a", "y.csv", -100.0, 0.5, 10),
        ];
        let adaptive = resolve_adaptive_thresholds(&rows, floors(), false);
        assert_eq!(adaptive.hostility.hostility_level, HostilityLevel::High);
        assert!(adaptive.effective.min_profitable_ratio < 0.55);
        assert!(adaptive.effective.min_avg_win_rate_pct < 48.0);
        assert!(adaptive.effective.min_expectancy_krw < 0.0);
        // Profit factor is never relaxed.
        assert_eq!(adaptive.effective.min_profit_factor, 1.0);
    }

    #[test]
    fn test_comparison_gate_requires_both_profiles() {
        let only_core = vec![summarize_profile(
            "core_full",
            &[row("core_full", "a.csv", 100.0, 1.2, 10)],
            &GateThresholds::default(),
            true,
        )];
        let gate = build_comparison(&only_core, &ComparisonDeltas::default());
        assert!(!gate.comparison_available);
        assert!(!gate.gate_pass);
    }

    #[test]
    fn test_comparison_gate_deltas() {
        let legacy = summarize_profile(
            "legacy_default",
            &[row("legacy_default", "a.csv", 100.0, 1.2, 10)],
            &GateThresholds::default(),
            true,
        );
        let core = summarize_profile(
            "core_full",
            &[row("core_full", "a.csv", 90.0, 1.18, 10)],
            &GateThresholds::default(),
            true,
        );
        let gate = build_comparison(&[legacy, core], &ComparisonDeltas::default());
        assert!(gate.comparison_available);
        // Small regression stays within tolerances.
        assert!(gate.gate_pass);
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(worker_count(1, 8), 1);
        assert!(worker_count(100, 2) <= 2);
        assert!(worker_count(100, 0) >= 1);
    }
}
