//! Candidate evaluation through the external matrix runner.
//!
//! Evaluating one combo means: merge it into the base configuration, write
//! the shared config file the backtest engine reads, invoke the matrix
//! runner once over the stage's dataset set, then lift the target profile's
//! summary out of the gate report into an [`EvaluationRow`].
//!
//! The matrix runner sits behind the [`MatrixRunner`] trait. Production uses
//! [`CommandMatrixRunner`], which spawns the `edgetune-matrix` binary (or
//! any compatible command) as a subprocess; tests substitute stubs that
//! fabricate gate reports. The runner owns its own retry policy — a failed
//! invocation is fatal here, because silently dropping one candidate would
//! bias the whole ranking.
//!
//! Results are memoized in the [`EvalCache`] keyed by combo fingerprint plus
//! the full evaluation context, so re-running a tuning session skips every
//! evaluation whose inputs are unchanged.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::cache::{EvalCache, CACHE_SCHEMA_VERSION};
use crate::combos::ComboSpec;
use crate::config::{write_config, BaseConfig};
use crate::fingerprint::{
    canonical_hash, encode_bool, encode_string, encode_string_seq, encode_u32, encode_u8,
    CanonicalBytes, FINGERPRINT_ENCODING_VERSION,
};
use crate::report::GateReport;
use crate::types::{EvaluationRow, Stage};

/// Fallback profile evaluated when the preferred `core_full` was not
/// requested.
pub const TARGET_PROFILE: &str = "core_full";

/// Everything besides the combo that determines an evaluation's outcome.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub stage: Stage,
    pub profile_ids: Vec<String>,
    pub gate_min_avg_trades: u32,
    pub require_higher_tf_companions: bool,
    pub enable_hostility_adaptive_thresholds: bool,
    pub enable_hostility_adaptive_trades_only: bool,
    pub matrix_max_workers: usize,
    pub matrix_backtest_retry_count: u32,
    /// Hash of the base configuration with tunable keys stripped.
    pub base_config_hash: String,
    /// Hash of the stage's dataset signature.
    pub datasets_sig_hash: String,
}

struct CacheKeyMaterial<'a> {
    ctx: &'a EvaluationContext,
    combo_fingerprint: &'a str,
}

impl CanonicalBytes for CacheKeyMaterial<'_> {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_u8(&mut buf, FINGERPRINT_ENCODING_VERSION);
        encode_u32(&mut buf, CACHE_SCHEMA_VERSION);
        encode_string(&mut buf, &self.ctx.base_config_hash);
        encode_string(&mut buf, self.combo_fingerprint);
        encode_string(&mut buf, self.ctx.stage.as_str());
        encode_string_seq(&mut buf, &self.ctx.profile_ids);
        encode_u32(&mut buf, self.ctx.gate_min_avg_trades);
        encode_bool(&mut buf, self.ctx.require_higher_tf_companions);
        encode_bool(&mut buf, self.ctx.enable_hostility_adaptive_thresholds);
        encode_bool(&mut buf, self.ctx.enable_hostility_adaptive_trades_only);
        encode_u32(&mut buf, self.ctx.matrix_max_workers as u32);
        encode_u32(&mut buf, self.ctx.matrix_backtest_retry_count);
        encode_string(&mut buf, &self.ctx.datasets_sig_hash);
        buf
    }
}

impl EvaluationContext {
    /// Cache key for this context applied to one combo.
    pub fn cache_key(&self, combo_fingerprint: &str) -> String {
        canonical_hash(&CacheKeyMaterial {
            ctx: self,
            combo_fingerprint,
        })
    }

    /// Profile whose summary becomes the evaluation row.
    pub fn target_profile(&self) -> &str {
        self.profile_ids
            .iter()
            .find(|id| *id == TARGET_PROFILE)
            .map(String::as_str)
            .or_else(|| self.profile_ids.first().map(String::as_str))
            .unwrap_or(TARGET_PROFILE)
    }
}

/// One matrix invocation: inputs plus where the artifacts must land.
#[derive(Debug, Clone)]
pub struct MatrixRequest {
    pub datasets: Vec<PathBuf>,
    pub profile_ids: Vec<String>,
    pub min_avg_trades: u32,
    pub exclude_low_trade_runs_for_gate: bool,
    pub min_trades_per_run_for_gate: u32,
    pub require_higher_tf_companions: bool,
    pub enable_hostility_adaptive_thresholds: bool,
    pub enable_hostility_adaptive_trades_only: bool,
    pub max_workers: usize,
    pub backtest_retry_count: u32,
    pub matrix_csv: PathBuf,
    pub profile_csv: PathBuf,
    pub report_json: PathBuf,
}

/// Seam to the external matrix collaborator.
pub trait MatrixRunner {
    fn run(&self, request: &MatrixRequest) -> Result<()>;
}

/// Spawns the matrix runner as a subprocess with the documented CLI surface.
#[derive(Debug, Clone)]
pub struct CommandMatrixRunner {
    pub program: PathBuf,
}

impl CommandMatrixRunner {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// Default to the `edgetune-matrix` binary installed next to the
    /// current executable, falling back to PATH lookup.
    pub fn discover() -> Self {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("edgetune-matrix")))
            .filter(|path| path.exists());
        Self {
            program: sibling.unwrap_or_else(|| PathBuf::from("edgetune-matrix")),
        }
    }
}

impl MatrixRunner for CommandMatrixRunner {
    fn run(&self, request: &MatrixRequest) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--dataset-names").args(&request.datasets);
        cmd.arg("--profile-ids").args(&request.profile_ids);
        cmd.arg("--min-avg-trades")
            .arg(request.min_avg_trades.to_string());
        if request.exclude_low_trade_runs_for_gate {
            cmd.arg("--exclude-low-trade-runs-for-gate");
            cmd.arg("--min-trades-per-run-for-gate")
                .arg(request.min_trades_per_run_for_gate.to_string());
        }
        if request.require_higher_tf_companions {
            cmd.arg("--require-higher-tf-companions");
        }
        if request.enable_hostility_adaptive_thresholds {
            cmd.arg("--enable-hostility-adaptive-thresholds");
        }
        if request.enable_hostility_adaptive_trades_only {
            cmd.arg("--enable-hostility-adaptive-trades-only");
        }
        cmd.arg("--max-workers")
            .arg(request.max_workers.max(1).to_string());
        cmd.arg("--backtest-retry-count")
            .arg(request.backtest_retry_count.max(1).to_string());
        cmd.arg("--output-csv").arg(&request.matrix_csv);
        cmd.arg("--output-profile-csv").arg(&request.profile_csv);
        cmd.arg("--output-json").arg(&request.report_json);

        let status = cmd
            .status()
            .with_context(|| format!("failed to spawn matrix runner {}", self.program.display()))?;
        if !status.success() {
            bail!(
                "matrix runner {} exited with {}",
                self.program.display(),
                status
            );
        }
        Ok(())
    }
}

/// Where this evaluation's artifacts land, derived from combo id and stage.
fn artifact_paths(output_dir: &Path, combo_id: &str, stage: Stage) -> (PathBuf, PathBuf, PathBuf) {
    let suffix = format!("{}_{}", combo_id, stage);
    (
        output_dir.join(format!("profitability_matrix_{}.csv", suffix)),
        output_dir.join(format!("profitability_profile_summary_{}.csv", suffix)),
        output_dir.join(format!("profitability_gate_report_{}.json", suffix)),
    )
}

/// Static collaborator wiring for a tuning run.
pub struct EvaluatorEnv<'a> {
    pub base: &'a BaseConfig,
    pub shared_config_path: &'a Path,
    pub output_dir: &'a Path,
    pub runner: &'a dyn MatrixRunner,
    pub cache_enabled: bool,
}

/// Evaluate one combo at one stage, consulting and feeding the cache.
pub fn evaluate_combo(
    env: &EvaluatorEnv<'_>,
    combo: &ComboSpec,
    datasets: &[PathBuf],
    ctx: &EvaluationContext,
    cache: &mut EvalCache,
) -> Result<EvaluationRow> {
    let cache_key = ctx.cache_key(&combo.fingerprint());
    if env.cache_enabled {
        if let Some(row) = cache.lookup(&cache_key) {
            return Ok(row);
        }
    }

    let merged = env.base.merge_combo(combo)?;
    write_config(env.shared_config_path, &merged)?;

    let (matrix_csv, profile_csv, report_json) =
        artifact_paths(env.output_dir, &combo.combo_id, ctx.stage);
    let request = MatrixRequest {
        datasets: datasets.to_vec(),
        profile_ids: ctx.profile_ids.clone(),
        min_avg_trades: ctx.gate_min_avg_trades,
        exclude_low_trade_runs_for_gate: true,
        min_trades_per_run_for_gate: 1,
        require_higher_tf_companions: ctx.require_higher_tf_companions,
        enable_hostility_adaptive_thresholds: ctx.enable_hostility_adaptive_thresholds,
        enable_hostility_adaptive_trades_only: ctx.enable_hostility_adaptive_trades_only,
        max_workers: ctx.matrix_max_workers,
        backtest_retry_count: ctx.matrix_backtest_retry_count,
        matrix_csv: matrix_csv.clone(),
        profile_csv: profile_csv.clone(),
        report_json: report_json.clone(),
    };
    env.runner.run(&request).with_context(|| {
        format!(
            "matrix evaluation failed for combo={} stage={}",
            combo.combo_id, ctx.stage
        )
    })?;

    let report = GateReport::load(&report_json).with_context(|| {
        format!(
            "gate report unreadable after combo={} stage={}",
            combo.combo_id, ctx.stage
        )
    })?;
    let target_profile = ctx.target_profile().to_string();
    let summary = report.find_profile(&target_profile).with_context(|| {
        format!(
            "combo={} stage={} produced no `{}` summary",
            combo.combo_id, ctx.stage, target_profile
        )
    })?;

    let effective = report.effective_floors();
    let hostility = report.hostility();

    let row = EvaluationRow {
        combo_id: combo.combo_id.clone(),
        description: combo.description.clone(),
        stage: ctx.stage,
        target_profile,
        overall_gate_pass: report.overall_gate_pass,
        profile_gate_pass: report.profile_gate_pass,
        runs_used_for_gate: summary.runs_used_for_gate,
        excluded_low_trade_runs: summary.excluded_low_trade_runs,
        avg_profit_factor: summary.avg_profit_factor,
        avg_expectancy_krw: summary.avg_expectancy_krw,
        avg_total_trades: summary.avg_total_trades,
        avg_win_rate_pct: summary.avg_win_rate_pct,
        profitable_ratio: summary.profitable_ratio,
        gate_profit_factor_pass: summary.gate_profit_factor_pass,
        gate_trades_pass: summary.gate_trades_pass,
        gate_profitable_ratio_pass: summary.gate_profitable_ratio_pass,
        gate_expectancy_pass: summary.gate_expectancy_pass,
        effective_min_profit_factor: effective.min_profit_factor,
        effective_min_expectancy_krw: effective.min_expectancy_krw,
        effective_min_profitable_ratio: effective.min_profitable_ratio,
        effective_min_avg_win_rate_pct: effective.min_avg_win_rate_pct,
        effective_min_avg_trades: effective.min_avg_trades,
        hostility_level: hostility.map(|h| h.hostility_level).unwrap_or_default(),
        hostility_avg_score: hostility.map(|h| h.avg_adversarial_score).unwrap_or(0.0),
        report_json,
        profile_csv,
        matrix_csv,
        from_cache: false,
        ..Default::default()
    };

    if env.cache_enabled {
        cache.store(cache_key, row.clone());
    }
    Ok(row)
}
