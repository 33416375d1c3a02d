//! Outer auto-improvement loop.
//!
//! Drives the whole pipeline iteratively: evaluate the current shared
//! configuration (baseline), stop if the profitability target and the
//! overall gate already hold, otherwise tune candidates, apply the winner,
//! re-validate, and keep going until one of the terminal states is reached:
//!
//! ```text
//! running ──► success_gate_pass        target + overall gate passed
//!         ──► paused_no_improvement    objective stalled for N iterations
//!         ──► paused_runtime_limit     wall-clock budget exhausted
//!         ──► paused_max_iterations    iteration cap hit without success
//! ```
//!
//! The pauses are NOT errors — they exit 0 with a machine-readable
//! status/reason pair, because "the search stalled" is an answer, not a
//! failure.
//!
//! The loop holds the verification lock for its entire execution and hands
//! its handle to every nested tuning run, so one improvement session is one
//! critical section no matter how many evaluations it spawns. When the
//! tuner re-selects the combo that is already applied (same fingerprint),
//! the redundant re-validation run is skipped and the previous snapshot is
//! reused.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{write_config, BaseConfig};
use crate::datasets::discover_datasets;
use crate::evaluator::{MatrixRequest, MatrixRunner, TARGET_PROFILE};
use crate::funnel::{run_tune, TuneOptions};
use crate::lock;
use crate::report::GateReport;
use crate::score::{compute_objective, ObjectiveThresholds};
use crate::types::{EvaluationRow, MetricSummary};

/// Terminal states of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    SuccessGatePass,
    PausedNoImprovement,
    PausedRuntimeLimit,
    PausedMaxIterations,
    PausedNoData,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::SuccessGatePass => "success_gate_pass",
            LoopStatus::PausedNoImprovement => "paused_no_improvement",
            LoopStatus::PausedRuntimeLimit => "paused_runtime_limit",
            LoopStatus::PausedMaxIterations => "paused_max_iterations",
            LoopStatus::PausedNoData => "paused_no_data",
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of an iteration a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Baseline,
    PostApply,
}

/// Hard targets the configuration must reach for `success_gate_pass`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetFloors {
    pub min_profit_factor: f64,
    pub min_expectancy_krw: f64,
    pub min_profitable_ratio: f64,
    pub min_avg_win_rate_pct: f64,
    pub min_avg_trades: f64,
}

impl Default for TargetFloors {
    fn default() -> Self {
        Self {
            min_profit_factor: 1.00,
            min_expectancy_krw: 0.0,
            min_profitable_ratio: 0.55,
            min_avg_win_rate_pct: 48.0,
            min_avg_trades: 10.0,
        }
    }
}

fn target_satisfied(metrics: &MetricSummary, targets: &TargetFloors) -> bool {
    metrics.avg_profit_factor >= targets.min_profit_factor
        && metrics.avg_expectancy_krw >= targets.min_expectancy_krw
        && metrics.profitable_ratio >= targets.min_profitable_ratio
        && metrics.avg_total_trades >= targets.min_avg_trades
        && metrics.avg_win_rate_pct >= targets.min_avg_win_rate_pct
}

/// One row of the append-only iteration log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub phase: Phase,
    pub selected_combo: String,
    pub overall_gate_pass: bool,
    pub core_vs_legacy_gate_pass: bool,
    pub target_profile_gate_pass: bool,
    pub avg_profit_factor: f64,
    pub avg_expectancy_krw: f64,
    pub avg_total_trades: f64,
    pub avg_win_rate_pct: f64,
    pub profitable_ratio: f64,
    pub objective_score: f64,
    pub target_satisfied: bool,
    pub timestamp: String,
}

/// Condensed result of one full-matrix evaluation of the current config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvalSnapshot {
    pub metrics: MetricSummary,
    pub objective_score: f64,
    pub overall_gate_pass: bool,
    pub core_vs_legacy_gate_pass: bool,
    pub target_profile_gate_pass: bool,
    pub target_satisfied: bool,
}

#[derive(Debug, Clone)]
pub struct ImproveOptions {
    pub max_iterations: u32,
    /// 0 disables the stall detector entirely.
    pub max_consecutive_no_improvement: u32,
    pub max_runtime: Duration,
    pub improvement_epsilon: f64,
    pub targets: TargetFloors,

    pub skip_tune_phase: bool,
    pub sync_source_config: bool,
    pub source_config_path: Option<PathBuf>,

    /// Profiles evaluated in the baseline/post-apply matrix runs.
    pub baseline_profile_ids: Vec<String>,
    /// Resolve active objective floors from the baseline report's embedded
    /// hostility adjustment instead of the static configuration.
    pub use_adaptive_thresholds: bool,

    pub gate_report_json: PathBuf,
    pub baseline_matrix_csv: PathBuf,
    pub baseline_profile_csv: PathBuf,
    pub iteration_csv: PathBuf,
    pub summary_json: PathBuf,

    pub tune: TuneOptions,
}

impl Default for ImproveOptions {
    fn default() -> Self {
        let logs = PathBuf::from("build/Release/logs");
        Self {
            max_iterations: 4,
            max_consecutive_no_improvement: 2,
            max_runtime: Duration::from_secs(120 * 60),
            improvement_epsilon: 0.05,
            targets: TargetFloors::default(),
            skip_tune_phase: false,
            sync_source_config: false,
            source_config_path: Some(PathBuf::from("config/config.json")),
            baseline_profile_ids: vec![
                "legacy_default".into(),
                "core_bridge_only".into(),
                "core_policy_risk".into(),
                "core_full".into(),
            ],
            use_adaptive_thresholds: true,
            gate_report_json: logs.join("profitability_gate_report_baseline.json"),
            baseline_matrix_csv: logs.join("profitability_matrix_baseline.csv"),
            baseline_profile_csv: logs.join("profitability_profile_summary_baseline.csv"),
            iteration_csv: logs.join("candidate_auto_improvement_iterations.csv"),
            summary_json: logs.join("candidate_auto_improvement_summary.json"),
            tune: TuneOptions::default(),
        }
    }
}

/// Final structured summary written once per loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveSummary {
    pub generated_at: String,
    pub status: LoopStatus,
    pub reason: String,
    pub started_at: String,
    pub ended_at: String,
    pub max_iterations: u32,
    pub max_runtime_minutes: u64,
    pub max_consecutive_no_improvement: u32,
    pub targets: TargetFloors,
    pub best_objective_score: f64,
    pub best_combo_id: String,
    pub best_snapshot: Option<EvalSnapshot>,
    pub iterations: Vec<IterationRecord>,
}

#[derive(Debug)]
pub struct ImproveOutcome {
    pub status: LoopStatus,
    pub reason: String,
    pub best_objective: f64,
    pub best_combo_id: String,
    pub iterations: Vec<IterationRecord>,
    pub summary_json: PathBuf,
}

fn baseline_request(opts: &ImproveOptions, datasets: &[PathBuf]) -> MatrixRequest {
    MatrixRequest {
        datasets: datasets.to_vec(),
        profile_ids: opts.baseline_profile_ids.clone(),
        min_avg_trades: opts.tune.gate_min_avg_trades,
        exclude_low_trade_runs_for_gate: true,
        min_trades_per_run_for_gate: 1,
        require_higher_tf_companions: opts.tune.require_higher_tf_companions,
        enable_hostility_adaptive_thresholds: opts.tune.enable_hostility_adaptive_thresholds,
        enable_hostility_adaptive_trades_only: opts.tune.enable_hostility_adaptive_trades_only,
        max_workers: opts.tune.matrix_max_workers,
        backtest_retry_count: opts.tune.matrix_backtest_retry_count,
        matrix_csv: opts.baseline_matrix_csv.clone(),
        profile_csv: opts.baseline_profile_csv.clone(),
        report_json: opts.gate_report_json.clone(),
    }
}

fn baseline_target_profile(opts: &ImproveOptions) -> String {
    opts.baseline_profile_ids
        .iter()
        .find(|id| *id == TARGET_PROFILE)
        .cloned()
        .or_else(|| opts.baseline_profile_ids.first().cloned())
        .unwrap_or_else(|| TARGET_PROFILE.to_string())
}

/// Evaluate the current shared configuration over the full matrix and
/// condense the gate report into a snapshot.
fn evaluate_current(
    opts: &ImproveOptions,
    runner: &dyn MatrixRunner,
    datasets: &[PathBuf],
) -> Result<EvalSnapshot> {
    runner
        .run(&baseline_request(opts, datasets))
        .context("full-matrix evaluation of the current configuration failed")?;
    let report = GateReport::load(&opts.gate_report_json)
        .context("gate report missing after full-matrix evaluation")?;

    let active: ObjectiveThresholds = if opts.use_adaptive_thresholds {
        report.effective_floors().into()
    } else {
        opts.tune.objective
    };

    let target_profile = baseline_target_profile(opts);
    let summary = report
        .find_profile(&target_profile)
        .with_context(|| format!("baseline report lacks `{}` summary", target_profile))?;
    let metrics = summary.metrics();

    Ok(EvalSnapshot {
        metrics,
        objective_score: compute_objective(&metrics, &active, opts.tune.objective_mode),
        overall_gate_pass: report.overall_gate_pass,
        core_vs_legacy_gate_pass: report.core_vs_legacy.gate_pass,
        target_profile_gate_pass: summary.gate_pass,
        target_satisfied: target_satisfied(&metrics, &opts.targets),
    })
}

fn record_from_snapshot(
    iteration: u32,
    phase: Phase,
    selected_combo: &str,
    snapshot: &EvalSnapshot,
) -> IterationRecord {
    IterationRecord {
        iteration,
        phase,
        selected_combo: selected_combo.to_string(),
        overall_gate_pass: snapshot.overall_gate_pass,
        core_vs_legacy_gate_pass: snapshot.core_vs_legacy_gate_pass,
        target_profile_gate_pass: snapshot.target_profile_gate_pass,
        avg_profit_factor: snapshot.metrics.avg_profit_factor,
        avg_expectancy_krw: snapshot.metrics.avg_expectancy_krw,
        avg_total_trades: snapshot.metrics.avg_total_trades,
        avg_win_rate_pct: snapshot.metrics.avg_win_rate_pct,
        profitable_ratio: snapshot.metrics.profitable_ratio,
        objective_score: snapshot.objective_score,
        target_satisfied: snapshot.target_satisfied,
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Extra credit for candidates that already clear gates, applied when the
/// loop picks the combo to apply.
fn gate_bonus(row: &EvaluationRow) -> f64 {
    let mut bonus = 0.0;
    if row.overall_gate_pass {
        bonus += 300.0;
    }
    if row.profile_gate_pass {
        bonus += 80.0;
    }
    if row.gate_profit_factor_pass {
        bonus += 60.0;
    }
    if row.gate_trades_pass {
        bonus += 40.0;
    }
    bonus
}

/// Pick the combo to apply from the tuner's final rows: objective under the
/// loop's static floors plus the gate bonus, with metric tie-breaks.
fn select_best_candidate<'a>(
    rows: &'a [EvaluationRow],
    thresholds: &ObjectiveThresholds,
    opts: &ImproveOptions,
) -> Option<&'a EvaluationRow> {
    let scored = |row: &EvaluationRow| {
        compute_objective(&row.metrics(), thresholds, opts.tune.objective_mode) + gate_bonus(row)
    };
    rows.iter().max_by(|a, b| {
        scored(a)
            .partial_cmp(&scored(b))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.avg_expectancy_krw
                    .partial_cmp(&b.avg_expectancy_krw)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                a.avg_win_rate_pct
                    .partial_cmp(&b.avg_win_rate_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    })
}

fn write_iteration_csv(path: &PathBuf, records: &[IterationRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open iteration csv {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Run the auto-improvement loop to one of its terminal states.
pub fn run_improve(opts: &ImproveOptions, runner: &dyn MatrixRunner) -> Result<ImproveOutcome> {
    let datasets = discover_datasets(
        &opts.tune.data_dirs,
        opts.tune.real_data_only,
        opts.tune.require_higher_tf_companions,
    )?;
    if datasets.is_empty() {
        bail!(
            "no datasets found under {:?} with current filters",
            opts.tune.data_dirs
        );
    }

    // One critical section for the whole loop; nested tune runs reenter.
    let guard = lock::acquire(&opts.tune.lock_path, &opts.tune.lock, None)?;
    let lock_handle = guard.handle();

    let started = Instant::now();
    let started_at = Utc::now().to_rfc3339();

    let mut status: Option<LoopStatus> = None;
    let mut reason = String::new();
    let mut records: Vec<IterationRecord> = Vec::new();
    let mut best_objective = f64::NEG_INFINITY;
    let mut best_combo_id = String::new();
    let mut best_snapshot: Option<EvalSnapshot> = None;
    let mut consecutive_no_improve = 0u32;
    let mut last_applied: Option<(String, EvalSnapshot)> = None;

    let stall_limit = opts.max_consecutive_no_improvement;

    for iteration in 1..=opts.max_iterations {
        if started.elapsed() >= opts.max_runtime {
            status = Some(LoopStatus::PausedRuntimeLimit);
            reason = "max runtime exceeded before iteration start".into();
            break;
        }

        println!(
            "[improve] iteration {}/{} - baseline matrix run",
            iteration, opts.max_iterations
        );
        let baseline = evaluate_current(opts, runner, &datasets)?;
        records.push(record_from_snapshot(iteration, Phase::Baseline, "", &baseline));

        if baseline.objective_score > best_objective + opts.improvement_epsilon {
            best_objective = baseline.objective_score;
            best_snapshot = Some(baseline);
            best_combo_id.clear();
            consecutive_no_improve = 0;
        } else {
            consecutive_no_improve += 1;
        }

        if baseline.target_satisfied && baseline.overall_gate_pass {
            status = Some(LoopStatus::SuccessGatePass);
            reason = "target metrics and overall gate passed on baseline run".into();
            break;
        }

        if opts.skip_tune_phase {
            if stall_limit > 0 && consecutive_no_improve >= stall_limit {
                status = Some(LoopStatus::PausedNoImprovement);
                reason = "no objective improvement within limit while tune phase skipped".into();
                break;
            }
            continue;
        }

        if started.elapsed() >= opts.max_runtime {
            status = Some(LoopStatus::PausedRuntimeLimit);
            reason = "max runtime reached before tune phase".into();
            break;
        }

        println!(
            "[improve] iteration {}/{} - tuning candidates",
            iteration, opts.max_iterations
        );
        let tune_outcome = run_tune(&opts.tune, runner, Some(&lock_handle))?;
        let best_row = select_best_candidate(&tune_outcome.final_rows, &opts.tune.objective, opts)
            .context("tuning produced no candidate rows")?;
        let best_combo = tune_outcome
            .combo_by_id(&best_row.combo_id)
            .context("selected combo id missing from tuning summary")?;
        println!(
            "[improve] iteration {} selected_combo={} objective={}",
            iteration, best_row.combo_id, best_row.objective_score
        );

        let fingerprint = best_combo.fingerprint();
        let post = match &last_applied {
            Some((applied_fp, snapshot)) if *applied_fp == fingerprint => {
                // Same candidate is already live; re-validating it would
                // reproduce the previous run.
                println!(
                    "[improve] iteration {} combo unchanged, reusing previous validation",
                    iteration
                );
                *snapshot
            }
            _ => {
                let current = BaseConfig::load(&opts.tune.build_config_path)?;
                let merged = current.merge_combo(best_combo)?;
                write_config(&opts.tune.build_config_path, &merged)?;
                if opts.sync_source_config {
                    if let Some(source_path) = &opts.source_config_path {
                        if source_path.exists() {
                            let source = BaseConfig::load(source_path)?;
                            let merged = source.merge_combo(best_combo)?;
                            write_config(source_path, &merged)?;
                        }
                    }
                }

                println!(
                    "[improve] iteration {}/{} - post-apply validation run",
                    iteration, opts.max_iterations
                );
                let snapshot = evaluate_current(opts, runner, &datasets)?;
                last_applied = Some((fingerprint, snapshot));
                snapshot
            }
        };
        records.push(record_from_snapshot(
            iteration,
            Phase::PostApply,
            &best_row.combo_id,
            &post,
        ));

        if post.objective_score > best_objective + opts.improvement_epsilon {
            best_objective = post.objective_score;
            best_snapshot = Some(post);
            best_combo_id = best_row.combo_id.clone();
            consecutive_no_improve = 0;
        } else {
            consecutive_no_improve += 1;
        }

        if post.target_satisfied && post.overall_gate_pass {
            status = Some(LoopStatus::SuccessGatePass);
            reason = "target metrics and overall gate passed on post-apply run".into();
            break;
        }

        if stall_limit > 0 && consecutive_no_improve >= stall_limit {
            status = Some(LoopStatus::PausedNoImprovement);
            reason = "objective score did not improve within configured consecutive limit".into();
            break;
        }
    }

    let status = status.unwrap_or_else(|| {
        if records.is_empty() {
            reason = "no iteration rows produced".into();
            LoopStatus::PausedNoData
        } else {
            reason = "reached max iterations without full gate pass".into();
            LoopStatus::PausedMaxIterations
        }
    });
    drop(guard);

    write_iteration_csv(&opts.iteration_csv, &records)?;
    let summary = ImproveSummary {
        generated_at: Utc::now().to_rfc3339(),
        status,
        reason: reason.clone(),
        started_at,
        ended_at: Utc::now().to_rfc3339(),
        max_iterations: opts.max_iterations,
        max_runtime_minutes: opts.max_runtime.as_secs() / 60,
        max_consecutive_no_improvement: opts.max_consecutive_no_improvement,
        targets: opts.targets,
        best_objective_score: best_objective,
        best_combo_id: best_combo_id.clone(),
        best_snapshot,
        iterations: records.clone(),
    };
    if let Some(parent) = opts.summary_json.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(&summary)?;
    text.push('\n');
    std::fs::write(&opts.summary_json, text).with_context(|| {
        format!(
            "failed to write improvement summary {}",
            opts.summary_json.display()
        )
    })?;

    Ok(ImproveOutcome {
        status,
        reason,
        best_objective,
        best_combo_id,
        iterations: records,
        summary_json: opts.summary_json.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combos::ScenarioMode;
    use crate::lock::LockOptions;
    use crate::report::{
        ComparisonGate, GateReport, ProfileSummary, ThresholdReport,
    };
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    /// Emits the same report every time, with configurable feasibility.
    struct FixedStub {
        calls: AtomicU32,
        passing: bool,
    }

    impl FixedStub {
        fn new(passing: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                passing,
            }
        }

        fn count(&self) -> u32 {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        fn summary(&self, profile_id: &str) -> ProfileSummary {
            let passing = self.passing;
            ProfileSummary {
                profile_id: profile_id.to_string(),
                runs: 2,
                runs_used_for_gate: 2,
                excluded_low_trade_runs: 0,
                profitable_runs: if passing { 2 } else { 0 },
                profitable_ratio: if passing { 1.0 } else { 0.0 },
                avg_profit_factor: if passing { 1.3 } else { 0.7 },
                avg_expectancy_krw: if passing { 20.0 } else { -15.0 },
                avg_win_rate_pct: if passing { 56.0 } else { 38.0 },
                peak_max_drawdown_pct: 5.0,
                avg_total_trades: if passing { 25.0 } else { 3.0 },
                total_profit_sum_krw: if passing { 10_000.0 } else { -4_000.0 },
                gate_sample_pass: true,
                gate_profit_factor_pass: passing,
                gate_expectancy_pass: passing,
                gate_drawdown_pass: true,
                gate_profitable_ratio_pass: passing,
                gate_win_rate_pass: passing,
                gate_trades_pass: passing,
                gate_pass: passing,
            }
        }
    }

    impl MatrixRunner for FixedStub {
        fn run(&self, request: &MatrixRequest) -> Result<()> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let report = GateReport {
                generated_at: "2026-08-07T00:00:00Z".into(),
                inputs: serde_json::Value::Null,
                thresholds: ThresholdReport {
                    min_profit_factor: 1.0,
                    min_expectancy_krw: 0.0,
                    max_drawdown_pct: 12.0,
                    min_profitable_ratio: 0.55,
                    min_avg_win_rate_pct: 48.0,
                    min_avg_trades: request.min_avg_trades as f64,
                    exclude_low_trade_runs_for_gate: true,
                    min_trades_per_run_for_gate: 1,
                    hostility_adaptive: None,
                },
                profile_gate_pass: self.passing,
                overall_gate_pass: self.passing,
                core_vs_legacy: ComparisonGate {
                    gate_pass: self.passing,
                    ..Default::default()
                },
                profile_summaries: request
                    .profile_ids
                    .iter()
                    .map(|id| self.summary(id))
                    .collect(),
                matrix_rows: Vec::new(),
            };
            fs::write(
                &request.report_json,
                serde_json::to_string_pretty(&report).unwrap(),
            )?;
            fs::write(&request.matrix_csv, "matrix")?;
            fs::write(&request.profile_csv, "profile")?;
            Ok(())
        }
    }

    fn setup_options(tag: &str) -> ImproveOptions {
        let root = std::env::temp_dir().join(format!("edgetune_improve_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();
        for i in 0..2 {
            fs::write(data.join(format!("sim_{:02}.csv", i)), "close\n1\n").unwrap();
        }
        let config_path = root.join("config.json");
        fs::write(
            &config_path,
            r#"{"trading": {"min_reward_risk": 1.0}, "strategies": {}}"#,
        )
        .unwrap();
        let logs = root.join("logs");

        let tune = TuneOptions {
            scenario_mode: ScenarioMode::QualityFocus,
            max_scenarios: 2,
            data_dirs: vec![data],
            require_higher_tf_companions: false,
            screen_dataset_limit: 0,
            build_config_path: config_path,
            output_dir: logs.clone(),
            summary_csv: logs.join("tune_summary.csv"),
            summary_json: logs.join("tune_summary.json"),
            eval_cache_json: logs.join("cache.json"),
            lock_path: logs.join("verification_run.lock"),
            lock: LockOptions {
                timeout: Duration::from_secs(5),
                stale_after: Duration::from_secs(3600),
                poll_interval: Duration::from_millis(10),
            },
            ..TuneOptions::default()
        };
        ImproveOptions {
            baseline_profile_ids: vec!["core_full".into()],
            gate_report_json: logs.join("gate_report_baseline.json"),
            baseline_matrix_csv: logs.join("matrix_baseline.csv"),
            baseline_profile_csv: logs.join("profile_baseline.csv"),
            iteration_csv: logs.join("iterations.csv"),
            summary_json: logs.join("improve_summary.json"),
            use_adaptive_thresholds: false,
            tune,
            ..ImproveOptions::default()
        }
    }

    #[test]
    fn test_immediate_success() {
        let opts = setup_options("success");
        let stub = FixedStub::new(true);
        let outcome = run_improve(&opts, &stub).unwrap();

        assert_eq!(outcome.status, LoopStatus::SuccessGatePass);
        assert_eq!(outcome.iterations.len(), 1);
        assert_eq!(outcome.iterations[0].phase, Phase::Baseline);
        assert!(outcome.iterations[0].target_satisfied);
        assert_eq!(stub.count(), 1, "success on baseline needs exactly one run");
        assert!(opts.iteration_csv.exists());
        assert!(opts.summary_json.exists());
    }

    #[test]
    fn test_stall_detector_pauses() {
        let mut opts = setup_options("stall");
        opts.skip_tune_phase = true;
        opts.max_iterations = 10;
        opts.max_consecutive_no_improvement = 2;

        let stub = FixedStub::new(false);
        let outcome = run_improve(&opts, &stub).unwrap();

        assert_eq!(outcome.status, LoopStatus::PausedNoImprovement);
        // Iteration 1 sets the best score; 2 and 3 fail to improve.
        assert_eq!(outcome.iterations.len(), 3);
    }

    #[test]
    fn test_disabled_stall_detector_runs_to_iteration_cap() {
        let mut opts = setup_options("cap");
        opts.skip_tune_phase = true;
        opts.max_iterations = 3;
        opts.max_consecutive_no_improvement = 0;

        let stub = FixedStub::new(false);
        let outcome = run_improve(&opts, &stub).unwrap();

        assert_eq!(outcome.status, LoopStatus::PausedMaxIterations);
        assert_eq!(outcome.iterations.len(), 3);
    }

    #[test]
    fn test_runtime_budget_pauses_before_first_iteration() {
        let mut opts = setup_options("runtime");
        opts.max_runtime = Duration::ZERO;

        let stub = FixedStub::new(false);
        let outcome = run_improve(&opts, &stub).unwrap();

        assert_eq!(outcome.status, LoopStatus::PausedRuntimeLimit);
        assert!(outcome.iterations.is_empty());
        assert_eq!(stub.count(), 0);
    }

    #[test]
    fn test_unchanged_candidate_skips_revalidation() {
        let mut opts = setup_options("skip_revalidate");
        opts.max_iterations = 2;
        opts.max_consecutive_no_improvement = 0;
        opts.tune.cache_enabled = true;

        let stub = FixedStub::new(false);
        let outcome = run_improve(&opts, &stub).unwrap();

        assert_eq!(outcome.status, LoopStatus::PausedMaxIterations);
        // Iteration 1: baseline + 2 tune evaluations + post-apply = 4 runs.
        // Iteration 2: baseline only — the tuner serves both combos from
        // cache and re-selects the applied combo, so validation is reused.
        assert_eq!(stub.count(), 5);

        let posts: Vec<_> = outcome
            .iterations
            .iter()
            .filter(|r| r.phase == Phase::PostApply)
            .collect();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].selected_combo, posts[1].selected_combo);
    }

    #[test]
    fn test_lock_released_after_run() {
        let opts = setup_options("lockfree");
        let stub = FixedStub::new(true);
        run_improve(&opts, &stub).unwrap();
        assert!(!opts.tune.lock_path.exists());
    }
}
