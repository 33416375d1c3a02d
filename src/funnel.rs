//! Two-stage screening funnel and tune-run orchestration.
//!
//! Full-set evaluation cost scales with `dataset count x combo count`, so
//! the funnel first ranks every combo on a cheap evenly-spaced dataset
//! subset (stage `screen`), keeps the top K, and only re-evaluates those on
//! the full set (stage `final`). When the screening limit does not actually
//! shrink the dataset set, screening is skipped outright and every combo
//! goes straight to the final stage.
//!
//! Ranking is feasibility-first: rows passing all active floors sort above
//! every infeasible row, then objective score, then metric tie-breaks. The
//! final rows carry their screening score forward so a summary reader can
//! see how the funnel's cheap estimate compared to the full evaluation.
//!
//! A whole tune run — every evaluation of every combo — executes inside one
//! verification-lock critical section, and the shared configuration file is
//! restored from its snapshot on every exit path.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cache::EvalCache;
use crate::combos::{build_combos, ComboSpec, ScenarioMode};
use crate::config::BaseConfig;
use crate::datasets::{discover_datasets, select_evenly_spaced, DatasetSignature};
use crate::evaluator::{evaluate_combo, EvaluationContext, EvaluatorEnv, MatrixRunner};
use crate::lock::{self, LockHandle, LockOptions};
use crate::score::{score_row, ObjectiveMode, ObjectiveThresholds};
use crate::types::{EvaluationRow, Stage};

/// Everything a tune run needs. Defaults mirror the standard deployment
/// layout (`build/Release` tree next to the repository data directories).
#[derive(Debug, Clone)]
pub struct TuneOptions {
    pub scenario_mode: ScenarioMode,
    pub max_scenarios: usize,
    pub include_legacy: bool,

    pub data_dirs: Vec<PathBuf>,
    pub real_data_only: bool,
    pub require_higher_tf_companions: bool,

    pub screen_dataset_limit: usize,
    pub screen_top_k: usize,
    pub screen_profile_ids: Vec<String>,
    pub final_profile_ids: Vec<String>,

    pub gate_min_avg_trades: u32,
    pub objective: ObjectiveThresholds,
    pub objective_mode: ObjectiveMode,
    pub enable_hostility_adaptive_thresholds: bool,
    pub enable_hostility_adaptive_trades_only: bool,
    pub use_effective_thresholds_for_objective: bool,

    pub eval_cache_json: PathBuf,
    pub cache_enabled: bool,
    pub matrix_max_workers: usize,
    pub matrix_backtest_retry_count: u32,

    pub build_config_path: PathBuf,
    pub output_dir: PathBuf,
    pub summary_csv: PathBuf,
    pub summary_json: PathBuf,

    pub lock_path: PathBuf,
    pub lock: LockOptions,
}

impl Default for TuneOptions {
    fn default() -> Self {
        let logs = PathBuf::from("build/Release/logs");
        Self {
            scenario_mode: ScenarioMode::QualityFocus,
            max_scenarios: 0,
            include_legacy: false,
            data_dirs: vec![
                PathBuf::from("data/backtest"),
                PathBuf::from("data/backtest_curated"),
                PathBuf::from("data/backtest_real"),
            ],
            real_data_only: false,
            require_higher_tf_companions: true,
            screen_dataset_limit: 8,
            screen_top_k: 6,
            screen_profile_ids: vec!["core_full".into()],
            final_profile_ids: vec!["core_full".into()],
            gate_min_avg_trades: 8,
            objective: ObjectiveThresholds::default(),
            objective_mode: ObjectiveMode::Balanced,
            enable_hostility_adaptive_thresholds: true,
            enable_hostility_adaptive_trades_only: true,
            use_effective_thresholds_for_objective: true,
            eval_cache_json: logs.join("candidate_tuning_cache.json"),
            cache_enabled: true,
            matrix_max_workers: 1,
            matrix_backtest_retry_count: 2,
            build_config_path: PathBuf::from("build/Release/config/config.json"),
            output_dir: logs.clone(),
            summary_csv: logs.join("candidate_tuning_summary.csv"),
            summary_json: logs.join("candidate_tuning_summary.json"),
            lock_path: logs.join("verification_run.lock"),
            lock: LockOptions::default(),
        }
    }
}

/// Screening configuration echoed into the summary document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningContext {
    pub enabled: bool,
    pub eval_cache_enabled: bool,
    pub eval_cache_json: PathBuf,
    pub screen_dataset_limit: usize,
    pub screen_dataset_count: usize,
    pub screen_top_k: usize,
    pub screen_profile_ids: Vec<String>,
    pub final_profile_ids: Vec<String>,
    pub gate_min_avg_trades: u32,
    pub objective_min_avg_trades: f64,
    pub objective_min_profitable_ratio: f64,
    pub objective_min_avg_win_rate_pct: f64,
    pub objective_min_expectancy_krw: f64,
    pub objective_mode: ObjectiveMode,
    pub enable_hostility_adaptive_thresholds: bool,
    pub enable_hostility_adaptive_trades_only: bool,
    pub use_effective_thresholds_for_objective: bool,
}

/// The structured summary document written once per tune run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneSummary {
    pub generated_at: String,
    pub dataset_mode: String,
    pub require_higher_tf_companions: bool,
    pub dataset_dirs: Vec<PathBuf>,
    pub dataset_count: usize,
    pub datasets: Vec<PathBuf>,
    pub screening: ScreeningContext,
    pub combos: Vec<ComboSpec>,
    pub screen_summary: Vec<EvaluationRow>,
    pub summary: Vec<EvaluationRow>,
}

/// In-memory result of a tune run.
#[derive(Debug)]
pub struct TuneOutcome {
    pub combos: Vec<ComboSpec>,
    pub screen_rows: Vec<EvaluationRow>,
    /// Final-stage rows, best first.
    pub final_rows: Vec<EvaluationRow>,
    pub summary_json: PathBuf,
}

impl TuneOutcome {
    pub fn best(&self) -> Option<&EvaluationRow> {
        self.final_rows.first()
    }

    pub fn combo_by_id(&self, combo_id: &str) -> Option<&ComboSpec> {
        self.combos.iter().find(|c| c.combo_id == combo_id)
    }
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Screening sort: feasibility flag first, then score and metric tie-breaks.
fn screen_order(a: &EvaluationRow, b: &EvaluationRow) -> Ordering {
    b.constraint_pass
        .cmp(&a.constraint_pass)
        .then_with(|| desc(a.objective_score, b.objective_score))
        .then_with(|| desc(a.avg_expectancy_krw, b.avg_expectancy_krw))
        .then_with(|| desc(a.avg_win_rate_pct, b.avg_win_rate_pct))
        .then_with(|| desc(a.profitable_ratio, b.profitable_ratio))
        .then_with(|| desc(a.avg_total_trades, b.avg_total_trades))
}

/// Final sort: pure score ordering with metric tie-breaks.
fn final_order(a: &EvaluationRow, b: &EvaluationRow) -> Ordering {
    desc(a.objective_score, b.objective_score)
        .then_with(|| desc(a.avg_expectancy_krw, b.avg_expectancy_krw))
        .then_with(|| desc(a.avg_win_rate_pct, b.avg_win_rate_pct))
        .then_with(|| desc(a.profitable_ratio, b.profitable_ratio))
        .then_with(|| desc(a.avg_total_trades, b.avg_total_trades))
        .then_with(|| desc(a.avg_profit_factor, b.avg_profit_factor))
}

fn write_rows_csv(path: &PathBuf, rows: &[EvaluationRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open summary csv {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Run the generator → sampler → evaluator → scorer → funnel pipeline.
///
/// `reentry` carries the verification-lock handle when an outer caller (the
/// improvement loop) already holds the lock for this path.
pub fn run_tune(
    opts: &TuneOptions,
    runner: &dyn MatrixRunner,
    reentry: Option<&LockHandle>,
) -> Result<TuneOutcome> {
    let datasets = discover_datasets(
        &opts.data_dirs,
        opts.real_data_only,
        opts.require_higher_tf_companions,
    )?;
    if datasets.is_empty() {
        bail!(
            "no datasets found under {:?} with current filters",
            opts.data_dirs
        );
    }

    let combos = build_combos(opts.scenario_mode, opts.include_legacy, opts.max_scenarios)?;
    println!(
        "[tune] scenario_mode={} combo_count={} dataset_count={}",
        opts.scenario_mode,
        combos.len(),
        datasets.len()
    );

    let screen_datasets = select_evenly_spaced(&datasets, opts.screen_dataset_limit);
    let do_screening =
        opts.screen_dataset_limit > 0 && screen_datasets.len() < datasets.len();
    println!(
        "[tune] screening={} screen_dataset_count={} final_dataset_count={}",
        if do_screening { "on" } else { "off" },
        screen_datasets.len(),
        datasets.len()
    );

    let base = BaseConfig::load(&opts.build_config_path)?;
    let base_config_hash = base.stripped_hash();
    let screen_sig_hash = DatasetSignature::capture(&screen_datasets)?.hash();
    let final_sig_hash = DatasetSignature::capture(&datasets)?.hash();

    std::fs::create_dir_all(&opts.output_dir)
        .with_context(|| format!("failed to create output dir {}", opts.output_dir.display()))?;

    let screen_ctx = EvaluationContext {
        stage: Stage::Screen,
        profile_ids: opts.screen_profile_ids.clone(),
        gate_min_avg_trades: opts.gate_min_avg_trades,
        require_higher_tf_companions: opts.require_higher_tf_companions,
        enable_hostility_adaptive_thresholds: opts.enable_hostility_adaptive_thresholds,
        enable_hostility_adaptive_trades_only: opts.enable_hostility_adaptive_trades_only,
        matrix_max_workers: opts.matrix_max_workers,
        matrix_backtest_retry_count: opts.matrix_backtest_retry_count,
        base_config_hash: base_config_hash.clone(),
        datasets_sig_hash: screen_sig_hash,
    };
    let final_ctx = EvaluationContext {
        stage: Stage::Final,
        profile_ids: opts.final_profile_ids.clone(),
        datasets_sig_hash: final_sig_hash,
        ..screen_ctx.clone()
    };

    // Everything that touches the shared config or the cache happens inside
    // the lock's critical section.
    let guard = lock::acquire(&opts.lock_path, &opts.lock, reentry)?;
    let mut cache = if opts.cache_enabled {
        EvalCache::load(&opts.eval_cache_json)
    } else {
        EvalCache::new()
    };

    let mut restorer = crate::config::ConfigRestorer::capture(&opts.build_config_path)?;
    let mut screen_rows: Vec<EvaluationRow> = Vec::new();
    let mut final_rows: Vec<EvaluationRow> = Vec::new();
    let eval_result = (|| -> Result<()> {
        let env = EvaluatorEnv {
            base: &base,
            shared_config_path: &opts.build_config_path,
            output_dir: &opts.output_dir,
            runner,
            cache_enabled: opts.cache_enabled,
        };

        let selected_ids: Vec<String> = if do_screening {
            for combo in &combos {
                println!("[tune][screen] evaluating {}", combo.combo_id);
                let mut row =
                    evaluate_combo(&env, combo, &screen_datasets, &screen_ctx, &mut cache)?;
                score_row(
                    &mut row,
                    &opts.objective,
                    opts.use_effective_thresholds_for_objective,
                    opts.objective_mode,
                );
                screen_rows.push(row);
            }

            let mut ranked: Vec<&EvaluationRow> = screen_rows.iter().collect();
            ranked.sort_by(|a, b| screen_order(a, b));
            let keep = opts.screen_top_k.max(1);
            let survivors: Vec<String> = ranked
                .iter()
                .take(keep)
                .map(|row| row.combo_id.clone())
                .collect();
            println!("[tune] screened_top_k={}", survivors.len());
            survivors
        } else {
            combos.iter().map(|c| c.combo_id.clone()).collect()
        };

        let screen_by_id: HashMap<&str, &EvaluationRow> = screen_rows
            .iter()
            .map(|row| (row.combo_id.as_str(), row))
            .collect();
        let selected: HashSet<&str> = selected_ids.iter().map(String::as_str).collect();

        for combo in combos.iter().filter(|c| selected.contains(c.combo_id.as_str())) {
            println!("[tune][final] evaluating {}", combo.combo_id);
            let mut row = evaluate_combo(&env, combo, &datasets, &final_ctx, &mut cache)?;
            score_row(
                &mut row,
                &opts.objective,
                opts.use_effective_thresholds_for_objective,
                opts.objective_mode,
            );
            if let Some(screen) = screen_by_id.get(combo.combo_id.as_str()) {
                row.screen_objective_score = screen.objective_score;
                row.screen_avg_total_trades = screen.avg_total_trades;
                row.screen_profitable_ratio = screen.profitable_ratio;
                row.screen_avg_win_rate_pct = screen.avg_win_rate_pct;
            }
            final_rows.push(row);
        }
        Ok(())
    })();

    restorer.restore()?;
    if opts.cache_enabled {
        cache.persist(&opts.eval_cache_json)?;
    }
    drop(guard);
    eval_result?;

    if final_rows.is_empty() {
        bail!("no tuning rows generated");
    }
    final_rows.sort_by(final_order);

    write_rows_csv(&opts.summary_csv, &final_rows)?;
    let summary = TuneSummary {
        generated_at: Utc::now().to_rfc3339(),
        dataset_mode: if opts.real_data_only {
            "realdata_only".into()
        } else {
            "mixed".into()
        },
        require_higher_tf_companions: opts.require_higher_tf_companions,
        dataset_dirs: opts.data_dirs.clone(),
        dataset_count: datasets.len(),
        datasets: datasets.clone(),
        screening: ScreeningContext {
            enabled: do_screening,
            eval_cache_enabled: opts.cache_enabled,
            eval_cache_json: opts.eval_cache_json.clone(),
            screen_dataset_limit: opts.screen_dataset_limit,
            screen_dataset_count: screen_datasets.len(),
            screen_top_k: opts.screen_top_k,
            screen_profile_ids: opts.screen_profile_ids.clone(),
            final_profile_ids: opts.final_profile_ids.clone(),
            gate_min_avg_trades: opts.gate_min_avg_trades,
            objective_min_avg_trades: opts.objective.min_avg_trades,
            objective_min_profitable_ratio: opts.objective.min_profitable_ratio,
            objective_min_avg_win_rate_pct: opts.objective.min_avg_win_rate_pct,
            objective_min_expectancy_krw: opts.objective.min_expectancy_krw,
            objective_mode: opts.objective_mode,
            enable_hostility_adaptive_thresholds: opts.enable_hostility_adaptive_thresholds,
            enable_hostility_adaptive_trades_only: opts.enable_hostility_adaptive_trades_only,
            use_effective_thresholds_for_objective: opts.use_effective_thresholds_for_objective,
        },
        combos: combos.clone(),
        screen_summary: screen_rows.clone(),
        summary: final_rows.clone(),
    };
    if let Some(parent) = opts.summary_json.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(&summary)?;
    text.push('\n');
    std::fs::write(&opts.summary_json, text)
        .with_context(|| format!("failed to write tune summary {}", opts.summary_json.display()))?;

    Ok(TuneOutcome {
        combos,
        screen_rows,
        final_rows,
        summary_json: opts.summary_json.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::MatrixRequest;
    use crate::report::{ComparisonGate, GateReport, ProfileSummary, ThresholdReport};
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    /// Fabricates gate reports whose metrics are a deterministic function of
    /// the shared configuration content, so distinct combos get distinct,
    /// reproducible rankings. Counts screen/final invocations separately.
    struct ConfigDrivenStub {
        config_path: PathBuf,
        screen_calls: AtomicU32,
        final_calls: AtomicU32,
    }

    impl ConfigDrivenStub {
        fn new(config_path: PathBuf) -> Self {
            Self {
                config_path,
                screen_calls: AtomicU32::new(0),
                final_calls: AtomicU32::new(0),
            }
        }

        fn quality_signal(&self) -> f64 {
            let cfg: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&self.config_path).unwrap()).unwrap();
            let strength = |name: &str| {
                cfg["strategies"][name]["min_signal_strength"]
                    .as_f64()
                    .unwrap_or(0.0)
            };
            strength("scalping") * 100.0
                + strength("momentum") * 10.0
                + strength("breakout")
                + cfg["trading"]["min_reward_risk"].as_f64().unwrap_or(0.0)
                + cfg["trading"]["min_expected_edge_pct"].as_f64().unwrap_or(0.0) * 10_000.0
        }
    }

    impl MatrixRunner for ConfigDrivenStub {
        fn run(&self, request: &MatrixRequest) -> anyhow::Result<()> {
            let name = request.report_json.to_string_lossy().into_owned();
            if name.contains("_screen") {
                self.screen_calls.fetch_add(1, AtomicOrdering::SeqCst);
            } else {
                self.final_calls.fetch_add(1, AtomicOrdering::SeqCst);
            }

            let expectancy = self.quality_signal();
            let summary = ProfileSummary {
                profile_id: "core_full".into(),
                runs: request.datasets.len() as u32,
                runs_used_for_gate: request.datasets.len() as u32,
                excluded_low_trade_runs: 0,
                profitable_runs: request.datasets.len() as u32,
                profitable_ratio: 0.8,
                avg_profit_factor: 1.2,
                avg_expectancy_krw: expectancy,
                avg_win_rate_pct: 55.0,
                peak_max_drawdown_pct: 5.0,
                avg_total_trades: 20.0,
                total_profit_sum_krw: 1_000.0,
                gate_sample_pass: true,
                gate_profit_factor_pass: true,
                gate_expectancy_pass: true,
                gate_drawdown_pass: true,
                gate_profitable_ratio_pass: true,
                gate_win_rate_pass: true,
                gate_trades_pass: true,
                gate_pass: true,
            };
            let report = GateReport {
                generated_at: "2026-08-07T00:00:00Z".into(),
                inputs: serde_json::Value::Null,
                thresholds: ThresholdReport {
                    min_profit_factor: 1.0,
                    min_expectancy_krw: 0.0,
                    max_drawdown_pct: 12.0,
                    min_profitable_ratio: 0.5,
                    min_avg_win_rate_pct: 48.0,
                    min_avg_trades: request.min_avg_trades as f64,
                    exclude_low_trade_runs_for_gate: true,
                    min_trades_per_run_for_gate: 1,
                    hostility_adaptive: None,
                },
                profile_gate_pass: true,
                overall_gate_pass: false,
                core_vs_legacy: ComparisonGate::default(),
                profile_summaries: vec![summary],
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

    fn setup_options(tag: &str, dataset_count: usize) -> TuneOptions {
        let root = std::env::temp_dir().join(format!("edgetune_funnel_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();
        for i in 0..dataset_count {
            fs::write(data.join(format!("sim_{:02}.csv", i)), "close\n1\n").unwrap();
        }
        let config_path = root.join("config.json");
        fs::write(
            &config_path,
            r#"{"trading": {"min_reward_risk": 1.0}, "strategies": {}}"#,
        )
        .unwrap();

        TuneOptions {
            scenario_mode: ScenarioMode::QualityFocus,
            data_dirs: vec![data],
            require_higher_tf_companions: false,
            build_config_path: config_path,
            output_dir: root.join("logs"),
            summary_csv: root.join("logs/summary.csv"),
            summary_json: root.join("logs/summary.json"),
            eval_cache_json: root.join("logs/cache.json"),
            lock_path: root.join("logs/verification_run.lock"),
            lock: LockOptions {
                timeout: std::time::Duration::from_secs(5),
                stale_after: std::time::Duration::from_secs(3600),
                poll_interval: std::time::Duration::from_millis(10),
            },
            ..TuneOptions::default()
        }
    }

    #[test]
    fn test_funnel_counts_screen_plus_top_k() {
        // 4 candidates, screening limit 2 of 5 datasets, top-K 2:
        // exactly 4 screen + 2 final evaluations.
        let mut opts = setup_options("counts", 5);
        opts.max_scenarios = 4;
        opts.screen_dataset_limit = 2;
        opts.screen_top_k = 2;
        opts.cache_enabled = false;

        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        let outcome = run_tune(&opts, &stub, None).unwrap();

        assert_eq!(stub.screen_calls.load(AtomicOrdering::SeqCst), 4);
        assert_eq!(stub.final_calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(outcome.screen_rows.len(), 4);
        assert_eq!(outcome.final_rows.len(), 2);
    }

    #[test]
    fn test_funnel_keeps_highest_ranked_screen_rows() {
        let mut opts = setup_options("ranking", 6);
        opts.max_scenarios = 10;
        opts.screen_dataset_limit = 2;
        opts.screen_top_k = 3;
        opts.cache_enabled = false;

        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        let outcome = run_tune(&opts, &stub, None).unwrap();
        assert_eq!(outcome.final_rows.len(), 3);

        let mut ranked = outcome.screen_rows.clone();
        ranked.sort_by(screen_order);
        let expected: HashSet<String> =
            ranked.iter().take(3).map(|r| r.combo_id.clone()).collect();
        let actual: HashSet<String> = outcome
            .final_rows
            .iter()
            .map(|r| r.combo_id.clone())
            .collect();
        assert_eq!(actual, expected);

        // Screen scores were carried onto the final rows.
        for row in &outcome.final_rows {
            assert!(row.screen_objective_score != 0.0);
        }
    }

    #[test]
    fn test_screening_off_goes_straight_to_final() {
        let mut opts = setup_options("noscreen", 3);
        opts.max_scenarios = 4;
        opts.screen_dataset_limit = 0;
        opts.cache_enabled = false;

        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        let outcome = run_tune(&opts, &stub, None).unwrap();

        assert_eq!(stub.screen_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(stub.final_calls.load(AtomicOrdering::SeqCst), 4);
        assert!(outcome.screen_rows.is_empty());
        assert_eq!(outcome.final_rows.len(), 4);
    }

    #[test]
    fn test_config_restored_and_outputs_written() {
        let mut opts = setup_options("restore", 4);
        opts.max_scenarios = 2;
        opts.screen_dataset_limit = 2;
        opts.screen_top_k = 1;

        let original = fs::read_to_string(&opts.build_config_path).unwrap();
        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        let outcome = run_tune(&opts, &stub, None).unwrap();

        assert_eq!(fs::read_to_string(&opts.build_config_path).unwrap(), original);
        assert!(opts.summary_csv.exists());
        assert!(outcome.summary_json.exists());
        assert!(opts.eval_cache_json.exists());
        assert!(!opts.lock_path.exists(), "lock must be released");

        let summary: TuneSummary =
            serde_json::from_str(&fs::read_to_string(&outcome.summary_json).unwrap()).unwrap();
        assert!(summary.screening.enabled);
        assert_eq!(summary.summary.len(), outcome.final_rows.len());
    }

    #[test]
    fn test_second_run_served_from_cache() {
        let mut opts = setup_options("cached", 4);
        opts.max_scenarios = 3;
        opts.screen_dataset_limit = 2;
        opts.screen_top_k = 2;

        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        run_tune(&opts, &stub, None).unwrap();
        let first_total = stub.screen_calls.load(AtomicOrdering::SeqCst)
            + stub.final_calls.load(AtomicOrdering::SeqCst);

        let outcome = run_tune(&opts, &stub, None).unwrap();
        let second_total = stub.screen_calls.load(AtomicOrdering::SeqCst)
            + stub.final_calls.load(AtomicOrdering::SeqCst);
        assert_eq!(first_total, second_total, "second run must be all cache hits");
        assert!(outcome.final_rows.iter().all(|r| r.from_cache));
    }

    #[test]
    fn test_empty_dataset_dirs_fail_fast() {
        let mut opts = setup_options("empty", 2);
        opts.data_dirs = vec![PathBuf::from("/nonexistent/edgetune-data")];
        let stub = ConfigDrivenStub::new(opts.build_config_path.clone());
        assert!(run_tune(&opts, &stub, None).is_err());
    }
}
