//! edgetune CLI - candidate threshold tuning.
//!
//! Runs the full tuning pipeline against the shared build configuration:
//!
//! 1. Generate candidate combos for the chosen scenario mode
//! 2. Screen every combo on a cheap evenly-spaced dataset subset
//! 3. Re-evaluate the top K on the full dataset set
//! 4. Rank by the profitability objective and write the summary documents
//!
//! Evaluation happens through the `edgetune-matrix` collaborator, invoked as
//! a subprocess per combo and stage; results are cached so repeated runs
//! only pay for what changed. The whole run holds the verification lock.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;

use edgetune::combos::ScenarioMode;
use edgetune::evaluator::CommandMatrixRunner;
use edgetune::funnel::{run_tune, TuneOptions};
use edgetune::lock::LockOptions;
use edgetune::score::{ObjectiveMode, ObjectiveThresholds};
use edgetune::settings::Settings;

/// Tune backtest gate thresholds by screening candidate combos.
#[derive(Parser, Debug)]
#[command(name = "edgetune")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Candidate generation mode
    ///
    /// `legacy_only` re-evaluates the current baseline (rollback /
    /// comparison runs), the `diverse_*` modes sweep an edge x reward/risk
    /// grid, and `quality_focus` perturbs hand-picked quality profiles.
    #[arg(long, value_enum, default_value_t = ScenarioMode::QualityFocus)]
    scenario_mode: ScenarioMode,

    /// Maximum candidate count (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_scenarios: usize,

    /// Prepend the legacy baseline combo to the generated set
    #[arg(long)]
    include_legacy_scenarios: bool,

    /// Only use real exchange capture datasets
    #[arg(long)]
    real_data_only: bool,

    /// Accept real datasets without higher-timeframe companion files
    ///
    /// By default a 1m capture is skipped unless its 5m/60m/240m siblings
    /// exist, because multi-timeframe strategies refuse to trade blind.
    #[arg(long)]
    allow_missing_higher_tf_companions: bool,

    /// Dataset directories to scan (defaults from edgetune.toml)
    #[arg(long, value_name = "DIR", num_args = 1..)]
    data_dirs: Vec<PathBuf>,

    /// Screening-stage dataset budget (0 disables screening)
    #[arg(long, default_value_t = 8)]
    screen_dataset_limit: usize,

    /// Candidates surviving the screening stage
    #[arg(long, default_value_t = 6)]
    screen_top_k: usize,

    /// Profiles evaluated at the screening stage
    #[arg(long, value_name = "ID", num_args = 1.., default_values_t = vec!["core_full".to_string()])]
    screen_profile_ids: Vec<String>,

    /// Profiles evaluated at the final stage
    #[arg(long, value_name = "ID", num_args = 1.., default_values_t = vec!["core_full".to_string()])]
    final_profile_ids: Vec<String>,

    /// Minimum average trades enforced by the matrix gate
    #[arg(long, default_value_t = 8)]
    gate_min_avg_trades: u32,

    /// Objective floor: average trades
    #[arg(long, default_value_t = 8.0)]
    objective_min_avg_trades: f64,

    /// Objective floor: profitable-run ratio
    #[arg(long, default_value_t = 0.50)]
    objective_min_profitable_ratio: f64,

    /// Objective floor: average win rate (percent)
    #[arg(long, default_value_t = 48.0)]
    objective_min_avg_win_rate_pct: f64,

    /// Objective floor: average expectancy (KRW)
    #[arg(long, default_value_t = 0.0)]
    objective_min_expectancy_krw: f64,

    /// Objective weighting profile
    #[arg(long, value_enum, default_value_t = ObjectiveMode::Balanced)]
    objective_mode: ObjectiveMode,

    /// Evaluate against statically configured floors even in hostile markets
    #[arg(long)]
    disable_hostility_adaptive_thresholds: bool,

    /// Let hostility relax every floor, not just the trade-count floor
    #[arg(long)]
    disable_hostility_adaptive_trades_only: bool,

    /// Score candidates against requested floors instead of the effective
    /// (hostility-adjusted) floors the evaluator actually enforced
    #[arg(long)]
    disable_effective_thresholds_for_objective: bool,

    /// Evaluation cache document
    #[arg(long, value_name = "FILE")]
    eval_cache_json: Option<PathBuf>,

    /// Bypass the evaluation cache entirely
    #[arg(long)]
    disable_eval_cache: bool,

    /// Worker cap for the matrix runner's dataset fan-out
    #[arg(long)]
    matrix_max_workers: Option<usize>,

    /// Per-backtest retry attempts inside the matrix runner
    #[arg(long)]
    matrix_backtest_retry_count: Option<u32>,

    /// Matrix runner command (defaults to the sibling edgetune-matrix binary)
    #[arg(long, value_name = "PROGRAM")]
    matrix_command: Option<PathBuf>,

    /// Shared build configuration consumed by the backtest engine
    #[arg(long, value_name = "FILE")]
    build_config_path: Option<PathBuf>,

    /// Directory for per-combo report artifacts
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Ranked summary CSV
    #[arg(long, value_name = "FILE")]
    summary_csv: Option<PathBuf>,

    /// Structured summary JSON
    #[arg(long, value_name = "FILE")]
    summary_json: Option<PathBuf>,

    /// Verification lock marker file
    #[arg(long, value_name = "FILE")]
    lock_path: Option<PathBuf>,

    /// Seconds to wait for the verification lock
    #[arg(long, default_value_t = 1800)]
    lock_timeout_sec: u64,

    /// Lock files older than this many seconds are reclaimed as stale
    #[arg(long, default_value_t = 14_400)]
    lock_stale_sec: u64,
}

fn build_options(cli: &Cli, settings: &Settings) -> TuneOptions {
    let logs_dir = cli
        .output_dir
        .clone()
        .unwrap_or_else(|| settings.logs_dir.clone());
    TuneOptions {
        scenario_mode: cli.scenario_mode,
        max_scenarios: cli.max_scenarios,
        include_legacy: cli.include_legacy_scenarios,
        data_dirs: if cli.data_dirs.is_empty() {
            settings.data_dirs.clone()
        } else {
            cli.data_dirs.clone()
        },
        real_data_only: cli.real_data_only,
        require_higher_tf_companions: !cli.allow_missing_higher_tf_companions,
        screen_dataset_limit: cli.screen_dataset_limit,
        screen_top_k: cli.screen_top_k,
        screen_profile_ids: cli.screen_profile_ids.clone(),
        final_profile_ids: cli.final_profile_ids.clone(),
        gate_min_avg_trades: cli.gate_min_avg_trades,
        objective: ObjectiveThresholds {
            min_avg_trades: cli.objective_min_avg_trades,
            min_profitable_ratio: cli.objective_min_profitable_ratio,
            min_avg_win_rate_pct: cli.objective_min_avg_win_rate_pct,
            min_expectancy_krw: cli.objective_min_expectancy_krw,
        },
        objective_mode: cli.objective_mode,
        enable_hostility_adaptive_thresholds: !cli.disable_hostility_adaptive_thresholds,
        enable_hostility_adaptive_trades_only: !cli.disable_hostility_adaptive_trades_only,
        use_effective_thresholds_for_objective: !cli.disable_effective_thresholds_for_objective,
        eval_cache_json: cli
            .eval_cache_json
            .clone()
            .unwrap_or_else(|| logs_dir.join("candidate_tuning_cache.json")),
        cache_enabled: !cli.disable_eval_cache,
        matrix_max_workers: cli.matrix_max_workers.unwrap_or(settings.matrix_max_workers),
        matrix_backtest_retry_count: cli
            .matrix_backtest_retry_count
            .unwrap_or(settings.backtest_retry_count),
        build_config_path: cli
            .build_config_path
            .clone()
            .unwrap_or_else(|| settings.build_config.clone()),
        output_dir: logs_dir.clone(),
        summary_csv: cli
            .summary_csv
            .clone()
            .unwrap_or_else(|| logs_dir.join("candidate_tuning_summary.csv")),
        summary_json: cli
            .summary_json
            .clone()
            .unwrap_or_else(|| logs_dir.join("candidate_tuning_summary.json")),
        lock_path: cli
            .lock_path
            .clone()
            .unwrap_or_else(|| settings.lock_path.clone()),
        lock: LockOptions {
            timeout: std::time::Duration::from_secs(cli.lock_timeout_sec),
            stale_after: std::time::Duration::from_secs(cli.lock_stale_sec),
            poll_interval: std::time::Duration::from_secs(1),
        },
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&std::env::current_dir()?);
    if let Some(source) = &settings.source {
        println!("[tune] settings from {}", source.display());
    }

    let options = build_options(&cli, &settings);
    let runner = match &cli.matrix_command {
        Some(program) => CommandMatrixRunner::new(program.clone()),
        None => CommandMatrixRunner::discover(),
    };

    let outcome = run_tune(&options, &runner, None)?;

    println!();
    println!("{}", "=== Tuning Top 10 ===".bold());
    for (rank, row) in outcome.final_rows.iter().take(10).enumerate() {
        let line = format!(
            "#{:<2} {}  score={:<12} pf={:.3} exp={:.1} trades={:.1} win={:.1}% ratio={:.2}{}",
            rank + 1,
            row.combo_id,
            row.objective_score,
            row.avg_profit_factor,
            row.avg_expectancy_krw,
            row.avg_total_trades,
            row.avg_win_rate_pct,
            row.profitable_ratio,
            if row.from_cache { "  (cached)" } else { "" },
        );
        if row.constraint_pass {
            println!("{}", line.green());
        } else {
            println!("{}", line.yellow());
        }
    }
    if let Some(best) = outcome.best() {
        println!();
        println!("best_combo={}", best.combo_id.bold());
    }
    println!("summary_csv={}", options.summary_csv.display());
    println!("summary_json={}", outcome.summary_json.display());

    Ok(())
}
