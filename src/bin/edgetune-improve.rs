//! edgetune-improve - outer auto-improvement loop.
//!
//! Iteratively evaluates the current configuration, tunes candidates,
//! applies the best one, and re-validates, until the profitability target
//! and overall gate pass or the loop pauses on stagnation, iteration cap,
//! or wall-clock budget. Convergence pauses are normal terminal states and
//! exit 0 with a machine-readable status; only unrecoverable conditions
//! (missing inputs, evaluator failures, lock timeout) exit non-zero.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;

use edgetune::combos::ScenarioMode;
use edgetune::evaluator::CommandMatrixRunner;
use edgetune::improve::{run_improve, ImproveOptions, LoopStatus, TargetFloors};
use edgetune::lock::LockOptions;
use edgetune::score::{ObjectiveMode, ObjectiveThresholds};
use edgetune::settings::Settings;

/// Iteratively tune, apply, and re-validate gate thresholds.
#[derive(Parser, Debug)]
#[command(name = "edgetune-improve")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Iteration cap before pausing
    #[arg(long, default_value_t = 4)]
    max_iterations: u32,

    /// Pause after this many consecutive non-improving evaluations (0 = off)
    #[arg(long, default_value_t = 2)]
    max_consecutive_no_improvement: u32,

    /// Wall-clock budget in minutes
    #[arg(long, default_value_t = 120)]
    max_runtime_minutes: u64,

    /// Minimum objective gain that counts as an improvement
    #[arg(long, default_value_t = 0.05)]
    improvement_epsilon: f64,

    /// Target floor: average profit factor
    #[arg(long, default_value_t = 1.00)]
    min_profit_factor: f64,

    /// Target floor: average expectancy (KRW)
    #[arg(long, default_value_t = 0.0)]
    min_expectancy_krw: f64,

    /// Target floor: profitable-run ratio
    #[arg(long, default_value_t = 0.55)]
    min_profitable_ratio: f64,

    /// Target floor: average win rate (percent)
    #[arg(long, default_value_t = 48.0)]
    min_avg_win_rate_pct: f64,

    /// Target floor: average trades per run
    #[arg(long, default_value_t = 10.0)]
    min_avg_trades: f64,

    /// Scenario mode for the nested tuning runs
    #[arg(long, value_enum, default_value_t = ScenarioMode::DiverseLight)]
    tune_scenario_mode: ScenarioMode,

    /// Candidate cap for the nested tuning runs
    #[arg(long, default_value_t = 16)]
    tune_max_scenarios: usize,

    /// Include the legacy baseline combo in tuning
    #[arg(long)]
    tune_include_legacy_scenarios: bool,

    /// Screening dataset budget for tuning
    #[arg(long, default_value_t = 8)]
    tune_screen_dataset_limit: usize,

    /// Screening survivors for tuning
    #[arg(long, default_value_t = 6)]
    tune_screen_top_k: usize,

    /// Objective weighting profile
    #[arg(long, value_enum, default_value_t = ObjectiveMode::Balanced)]
    objective_mode: ObjectiveMode,

    /// Only use real exchange capture datasets
    #[arg(long)]
    real_data_only: bool,

    /// Accept real datasets without higher-timeframe companions
    #[arg(long)]
    allow_missing_higher_tf_companions: bool,

    /// Skip the tuning phase (baseline evaluations only)
    #[arg(long)]
    skip_tune_phase: bool,

    /// Mirror applied combos into the source configuration
    #[arg(long)]
    sync_source_config: bool,

    /// Evaluate against static floors instead of the report's
    /// hostility-adjusted effective floors
    #[arg(long)]
    static_thresholds: bool,

    /// Dataset directories to scan (defaults from edgetune.toml)
    #[arg(long, value_name = "DIR", num_args = 1..)]
    data_dirs: Vec<PathBuf>,

    /// Matrix runner command (defaults to the sibling edgetune-matrix binary)
    #[arg(long, value_name = "PROGRAM")]
    matrix_command: Option<PathBuf>,

    /// Shared build configuration consumed by the backtest engine
    #[arg(long, value_name = "FILE")]
    build_config_path: Option<PathBuf>,

    /// Source configuration kept in sync with --sync-source-config
    #[arg(long, value_name = "FILE")]
    source_config_path: Option<PathBuf>,

    /// Directory for logs and report artifacts
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

fn build_options(cli: &Cli, settings: &Settings) -> ImproveOptions {
    let logs = cli
        .output_dir
        .clone()
        .unwrap_or_else(|| settings.logs_dir.clone());
    let targets = TargetFloors {
        min_profit_factor: cli.min_profit_factor,
        min_expectancy_krw: cli.min_expectancy_krw,
        min_profitable_ratio: cli.min_profitable_ratio,
        min_avg_win_rate_pct: cli.min_avg_win_rate_pct,
        min_avg_trades: cli.min_avg_trades,
    };

    let tune = edgetune::funnel::TuneOptions {
        scenario_mode: cli.tune_scenario_mode,
        max_scenarios: cli.tune_max_scenarios,
        include_legacy: cli.tune_include_legacy_scenarios,
        data_dirs: if cli.data_dirs.is_empty() {
            settings.data_dirs.clone()
        } else {
            cli.data_dirs.clone()
        },
        real_data_only: cli.real_data_only,
        require_higher_tf_companions: !cli.allow_missing_higher_tf_companions,
        screen_dataset_limit: cli.tune_screen_dataset_limit,
        screen_top_k: cli.tune_screen_top_k,
        // The loop's target floors double as the tuning objective floors.
        objective: ObjectiveThresholds {
            min_avg_trades: cli.min_avg_trades,
            min_profitable_ratio: cli.min_profitable_ratio,
            min_avg_win_rate_pct: cli.min_avg_win_rate_pct,
            min_expectancy_krw: cli.min_expectancy_krw,
        },
        objective_mode: cli.objective_mode,
        eval_cache_json: logs.join("candidate_tuning_cache.json"),
        matrix_max_workers: settings.matrix_max_workers,
        matrix_backtest_retry_count: settings.backtest_retry_count,
        build_config_path: cli
            .build_config_path
            .clone()
            .unwrap_or_else(|| settings.build_config.clone()),
        output_dir: logs.clone(),
        summary_csv: logs.join("candidate_tuning_summary.csv"),
        summary_json: logs.join("candidate_tuning_summary.json"),
        lock_path: settings.lock_path.clone(),
        lock: LockOptions::default(),
        ..edgetune::funnel::TuneOptions::default()
    };

    ImproveOptions {
        max_iterations: cli.max_iterations,
        max_consecutive_no_improvement: cli.max_consecutive_no_improvement,
        max_runtime: Duration::from_secs(cli.max_runtime_minutes * 60),
        improvement_epsilon: cli.improvement_epsilon,
        targets,
        skip_tune_phase: cli.skip_tune_phase,
        sync_source_config: cli.sync_source_config,
        source_config_path: Some(
            cli.source_config_path
                .clone()
                .unwrap_or_else(|| settings.source_config.clone()),
        ),
        use_adaptive_thresholds: !cli.static_thresholds,
        gate_report_json: logs.join("profitability_gate_report_baseline.json"),
        baseline_matrix_csv: logs.join("profitability_matrix_baseline.csv"),
        baseline_profile_csv: logs.join("profitability_profile_summary_baseline.csv"),
        iteration_csv: logs.join("candidate_auto_improvement_iterations.csv"),
        summary_json: logs.join("candidate_auto_improvement_summary.json"),
        tune,
        ..ImproveOptions::default()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&std::env::current_dir()?);
    let options = build_options(&cli, &settings);
    let runner = match &cli.matrix_command {
        Some(program) => CommandMatrixRunner::new(program.clone()),
        None => CommandMatrixRunner::discover(),
    };

    let outcome = run_improve(&options, &runner)?;

    println!();
    match outcome.status {
        LoopStatus::SuccessGatePass => println!("status={}", outcome.status.green().bold()),
        _ => println!("status={}", outcome.status.yellow().bold()),
    }
    println!("reason={}", outcome.reason);
    if !outcome.best_combo_id.is_empty() {
        println!("best_combo_id={}", outcome.best_combo_id);
    }
    if outcome.best_objective.is_finite() {
        println!("best_objective={}", outcome.best_objective);
    }
    println!("iteration_csv={}", options.iteration_csv.display());
    println!("summary_json={}", outcome.summary_json.display());

    Ok(())
}
