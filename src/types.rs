//! Core vocabulary shared across the tuning pipeline.
//!
//! An [`EvaluationRow`] is the unit of record: one candidate combo evaluated
//! at one stage over one dataset set. Rows are produced by the evaluator,
//! annotated by the scorer, ranked by the funnel, and persisted verbatim in
//! the evaluation cache and the tune summary. They are never mutated after
//! scoring.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Evaluation stage. Screening runs on the subsampled dataset set, the final
/// stage on the full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Screen,
    Final,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Screen => "screen",
            Stage::Final => "final",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dataset-set hostility classification embedded in gate reports when
/// adaptive thresholds are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostilityLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl HostilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostilityLevel::Low => "low",
            HostilityLevel::Medium => "medium",
            HostilityLevel::High => "high",
        }
    }
}

impl std::fmt::Display for HostilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five aggregate metrics the objective function consumes.
///
/// Extracted from a profile summary (baseline runs) or an evaluation row
/// (tuning runs) so the scorer has a single input shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricSummary {
    pub avg_profit_factor: f64,
    pub avg_expectancy_krw: f64,
    pub avg_total_trades: f64,
    pub avg_win_rate_pct: f64,
    pub profitable_ratio: f64,
}

/// One candidate's outcome for one stage.
///
/// Metric fields come straight from the gate report's target-profile summary.
/// The `effective_min_*` fields are the floors the evaluator actually
/// enforced (hostility-adjusted when adaptive thresholds are on), kept so a
/// later scoring pass can reproduce the feasibility decision. The
/// `objective_*` fields are attached by the scorer after evaluation, and the
/// `screen_*` fields only on final-stage rows that survived screening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationRow {
    pub combo_id: String,
    pub description: String,
    pub stage: Stage,
    pub target_profile: String,

    pub overall_gate_pass: bool,
    pub profile_gate_pass: bool,
    pub runs_used_for_gate: u32,
    pub excluded_low_trade_runs: u32,

    pub avg_profit_factor: f64,
    pub avg_expectancy_krw: f64,
    pub avg_total_trades: f64,
    pub avg_win_rate_pct: f64,
    pub profitable_ratio: f64,

    pub gate_profit_factor_pass: bool,
    pub gate_trades_pass: bool,
    pub gate_profitable_ratio_pass: bool,
    pub gate_expectancy_pass: bool,

    pub effective_min_profit_factor: f64,
    pub effective_min_expectancy_krw: f64,
    pub effective_min_profitable_ratio: f64,
    pub effective_min_avg_win_rate_pct: f64,
    pub effective_min_avg_trades: f64,

    pub hostility_level: HostilityLevel,
    pub hostility_avg_score: f64,

    /// Artifact references. A cache entry is only valid while all three
    /// still exist on disk.
    pub report_json: PathBuf,
    pub profile_csv: PathBuf,
    pub matrix_csv: PathBuf,

    pub from_cache: bool,

    // Attached by the scorer.
    pub objective_score: f64,
    pub objective_min_avg_trades: f64,
    pub objective_min_profitable_ratio: f64,
    pub objective_min_avg_win_rate_pct: f64,
    pub objective_min_expectancy_krw: f64,
    pub constraint_pass: bool,

    // Carried forward from the screening stage for traceability.
    pub screen_objective_score: f64,
    pub screen_avg_total_trades: f64,
    pub screen_profitable_ratio: f64,
    pub screen_avg_win_rate_pct: f64,
}

impl Default for EvaluationRow {
    fn default() -> Self {
        Self {
            combo_id: String::new(),
            description: String::new(),
            stage: Stage::Screen,
            target_profile: String::new(),
            overall_gate_pass: false,
            profile_gate_pass: false,
            runs_used_for_gate: 0,
            excluded_low_trade_runs: 0,
            avg_profit_factor: 0.0,
            avg_expectancy_krw: 0.0,
            avg_total_trades: 0.0,
            avg_win_rate_pct: 0.0,
            profitable_ratio: 0.0,
            gate_profit_factor_pass: false,
            gate_trades_pass: false,
            gate_profitable_ratio_pass: false,
            gate_expectancy_pass: false,
            effective_min_profit_factor: 0.0,
            effective_min_expectancy_krw: 0.0,
            effective_min_profitable_ratio: 0.0,
            effective_min_avg_win_rate_pct: 0.0,
            effective_min_avg_trades: 0.0,
            hostility_level: HostilityLevel::Low,
            hostility_avg_score: 0.0,
            report_json: PathBuf::new(),
            profile_csv: PathBuf::new(),
            matrix_csv: PathBuf::new(),
            from_cache: false,
            objective_score: 0.0,
            objective_min_avg_trades: 0.0,
            objective_min_profitable_ratio: 0.0,
            objective_min_avg_win_rate_pct: 0.0,
            objective_min_expectancy_krw: 0.0,
            constraint_pass: false,
            screen_objective_score: 0.0,
            screen_avg_total_trades: 0.0,
            screen_profitable_ratio: 0.0,
            screen_avg_win_rate_pct: 0.0,
        }
    }
}

impl EvaluationRow {
    /// The metric slice the objective function consumes.
    pub fn metrics(&self) -> MetricSummary {
        MetricSummary {
            avg_profit_factor: self.avg_profit_factor,
            avg_expectancy_krw: self.avg_expectancy_krw,
            avg_total_trades: self.avg_total_trades,
            avg_win_rate_pct: self.avg_win_rate_pct,
            profitable_ratio: self.profitable_ratio,
        }
    }

    /// All referenced artifact files still exist on disk.
    pub fn artifacts_present(&self) -> bool {
        self.report_json.exists() && self.profile_csv.exists() && self.matrix_csv.exists()
    }
}
