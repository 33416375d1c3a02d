//! edgetune-matrix - the profitability matrix collaborator.
//!
//! Evaluates the shared configuration across evaluation profiles x datasets
//! by invoking the backtest executable per cell on a bounded worker pool,
//! then writes the matrix CSV, the per-profile summary CSV, and the gate
//! report JSON consumed by `edgetune` and `edgetune-improve`.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use owo_colors::OwoColorize;

use edgetune::matrix::{run_matrix, ComparisonDeltas, GateThresholds, MatrixOptions};
use edgetune::settings::Settings;

/// Evaluate profiles x datasets and emit the gate report.
#[derive(Parser, Debug)]
#[command(name = "edgetune-matrix")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Backtest engine executable
    #[arg(long, value_name = "FILE")]
    exe_path: Option<PathBuf>,

    /// Shared configuration the engine reads
    #[arg(long, value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Base directory for relative dataset names
    #[arg(long, value_name = "DIR", default_value = "data/backtest")]
    data_dir: PathBuf,

    /// Dataset files (absolute, or relative to --data-dir)
    #[arg(long, value_name = "FILE", num_args = 1..)]
    dataset_names: Vec<PathBuf>,

    /// Profiles to evaluate
    #[arg(long, value_name = "ID", num_args = 1.., default_values_t = [
        "legacy_default".to_string(),
        "core_bridge_only".to_string(),
        "core_policy_risk".to_string(),
        "core_full".to_string(),
    ])]
    profile_ids: Vec<String>,

    /// Gate floor: average profit factor
    #[arg(long, default_value_t = 1.00)]
    min_profit_factor: f64,

    /// Gate floor: average expectancy (KRW)
    #[arg(long, default_value_t = 0.0)]
    min_expectancy_krw: f64,

    /// Gate ceiling: peak max drawdown (percent)
    #[arg(long, default_value_t = 12.0)]
    max_drawdown_pct: f64,

    /// Gate floor: profitable-run ratio
    #[arg(long, default_value_t = 0.55)]
    min_profitable_ratio: f64,

    /// Gate floor: average win rate (percent)
    #[arg(long, default_value_t = 0.0)]
    min_avg_win_rate_pct: f64,

    /// Gate floor: average trades per run
    #[arg(long, default_value_t = 10)]
    min_avg_trades: u32,

    /// Drop runs below the per-run trade floor from gate aggregates
    #[arg(long)]
    exclude_low_trade_runs_for_gate: bool,

    /// Per-run trade floor used with --exclude-low-trade-runs-for-gate
    #[arg(long, default_value_t = 5)]
    min_trades_per_run_for_gate: u64,

    /// Core-vs-legacy tolerance: profit factor delta
    #[arg(long, default_value_t = -0.05)]
    core_vs_legacy_min_profit_factor_delta: f64,

    /// Core-vs-legacy tolerance: expectancy delta (KRW)
    #[arg(long, default_value_t = -5.0)]
    core_vs_legacy_min_expectancy_delta_krw: f64,

    /// Core-vs-legacy tolerance: total profit delta (KRW)
    #[arg(long, default_value_t = -10_000.0)]
    core_vs_legacy_min_total_profit_delta_krw: f64,

    /// Forward the higher-timeframe companion requirement to the engine
    #[arg(long)]
    require_higher_tf_companions: bool,

    /// Relax gate floors when the dataset set is hostile
    #[arg(long)]
    enable_hostility_adaptive_thresholds: bool,

    /// Limit hostile relaxation to the trade-count floor
    #[arg(long)]
    enable_hostility_adaptive_trades_only: bool,

    /// Worker cap for the dataset fan-out
    #[arg(long)]
    max_workers: Option<usize>,

    /// Attempts per backtest invocation
    #[arg(long)]
    backtest_retry_count: Option<u32>,

    /// Matrix rows CSV
    #[arg(long, value_name = "FILE")]
    output_csv: Option<PathBuf>,

    /// Per-profile summary CSV
    #[arg(long, value_name = "FILE")]
    output_profile_csv: Option<PathBuf>,

    /// Gate report JSON
    #[arg(long, value_name = "FILE")]
    output_json: Option<PathBuf>,

    /// Exit non-zero when the overall gate fails
    #[arg(long)]
    fail_on_gate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&std::env::current_dir()?);
    let logs = settings.logs_dir.clone();

    let mut datasets = Vec::new();
    for name in &cli.dataset_names {
        let path = if name.is_absolute() {
            name.clone()
        } else {
            cli.data_dir.join(name)
        };
        if !path.exists() {
            bail!("dataset not found: {}", path.display());
        }
        datasets.push(path);
    }
    if datasets.is_empty() {
        bail!("no datasets configured; set --dataset-names");
    }

    let options = MatrixOptions {
        exe_path: cli.exe_path.clone().unwrap_or_else(|| settings.exe_path.clone()),
        config_path: cli
            .config_path
            .clone()
            .unwrap_or_else(|| settings.build_config.clone()),
        datasets,
        profile_ids: cli.profile_ids.clone(),
        thresholds: GateThresholds {
            min_profit_factor: cli.min_profit_factor,
            min_expectancy_krw: cli.min_expectancy_krw,
            max_drawdown_pct: cli.max_drawdown_pct,
            min_profitable_ratio: cli.min_profitable_ratio,
            min_avg_win_rate_pct: cli.min_avg_win_rate_pct,
            min_avg_trades: cli.min_avg_trades as f64,
        },
        exclude_low_trade_runs_for_gate: cli.exclude_low_trade_runs_for_gate,
        min_trades_per_run_for_gate: cli.min_trades_per_run_for_gate,
        comparison: ComparisonDeltas {
            min_profit_factor_delta: cli.core_vs_legacy_min_profit_factor_delta,
            min_expectancy_delta_krw: cli.core_vs_legacy_min_expectancy_delta_krw,
            min_total_profit_delta_krw: cli.core_vs_legacy_min_total_profit_delta_krw,
        },
        require_higher_tf_companions: cli.require_higher_tf_companions,
        enable_hostility_adaptive_thresholds: cli.enable_hostility_adaptive_thresholds,
        enable_hostility_adaptive_trades_only: cli.enable_hostility_adaptive_trades_only,
        max_workers: cli.max_workers.unwrap_or(settings.matrix_max_workers),
        backtest_retry_count: cli
            .backtest_retry_count
            .unwrap_or(settings.backtest_retry_count),
        output_csv: cli
            .output_csv
            .clone()
            .unwrap_or_else(|| logs.join("profitability_matrix.csv")),
        output_profile_csv: cli
            .output_profile_csv
            .clone()
            .unwrap_or_else(|| logs.join("profitability_profile_summary.csv")),
        output_json: cli
            .output_json
            .clone()
            .unwrap_or_else(|| logs.join("profitability_gate_report.json")),
    };

    let outcome = run_matrix(&options)?;

    println!("gate_report={}", outcome.report_json.display());
    if outcome.overall_gate_pass {
        println!("overall_gate_pass={}", "true".green());
    } else {
        println!("overall_gate_pass={}", "false".yellow());
    }
    if cli.fail_on_gate && !outcome.overall_gate_pass {
        eprintln!("{}", "overall gate failed".red());
        std::process::exit(1);
    }
    Ok(())
}
