//! Objective scoring of evaluation rows.
//!
//! The score folds five aggregate metrics and four feasibility floors into a
//! single ranked number with one invariant above all: **a feasible candidate
//! always outranks an infeasible one**. Infeasible candidates accumulate an
//! additive penalty per violated floor — a fixed base plus a term growing
//! with the shortfall — and end up with `-penalty + pf * 10`, which keeps
//! them strictly negative territory while still ordering "almost feasible"
//! above "hopeless". Feasible candidates get a weighted sum of expectancy,
//! profitable ratio, win rate, profit-factor excess over 1.0, and a capped
//! trade-count bonus.
//!
//! Two objective modes shift the weights:
//!
//! | Mode                       | Emphasis                                  |
//! |----------------------------|-------------------------------------------|
//! | `balanced`                 | Even spread, rewards trade volume          |
//! | `profitable_ratio_priority`| Profitable-run ratio dominates, volume     |
//! |                            | capped low                                 |

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::report::FloorSet;
use crate::types::{EvaluationRow, MetricSummary};

/// Which weighting profile the objective uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ObjectiveMode {
    #[default]
    Balanced,
    ProfitableRatioPriority,
}

impl ObjectiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveMode::Balanced => "balanced",
            ObjectiveMode::ProfitableRatioPriority => "profitable_ratio_priority",
        }
    }
}

impl std::fmt::Display for ObjectiveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four floors the objective penalizes against. (The profit-factor
/// floor of 1.0 is built into the formula itself.)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveThresholds {
    pub min_avg_trades: f64,
    pub min_profitable_ratio: f64,
    pub min_avg_win_rate_pct: f64,
    pub min_expectancy_krw: f64,
}

impl Default for ObjectiveThresholds {
    fn default() -> Self {
        Self {
            min_avg_trades: 8.0,
            min_profitable_ratio: 0.50,
            min_avg_win_rate_pct: 48.0,
            min_expectancy_krw: 0.0,
        }
    }
}

impl From<FloorSet> for ObjectiveThresholds {
    fn from(floors: FloorSet) -> Self {
        Self {
            min_avg_trades: floors.min_avg_trades,
            min_profitable_ratio: floors.min_profitable_ratio,
            min_avg_win_rate_pct: floors.min_avg_win_rate_pct,
            min_expectancy_krw: floors.min_expectancy_krw,
        }
    }
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// All four floors met.
pub fn is_feasible(metrics: &MetricSummary, thresholds: &ObjectiveThresholds) -> bool {
    metrics.avg_total_trades >= thresholds.min_avg_trades
        && metrics.profitable_ratio >= thresholds.min_profitable_ratio
        && metrics.avg_win_rate_pct >= thresholds.min_avg_win_rate_pct
        && metrics.avg_expectancy_krw >= thresholds.min_expectancy_krw
}

/// Rank a metrics row against its feasibility floors. Larger is better.
pub fn compute_objective(
    metrics: &MetricSummary,
    thresholds: &ObjectiveThresholds,
    mode: ObjectiveMode,
) -> f64 {
    let mut penalty = 0.0;
    match mode {
        ObjectiveMode::ProfitableRatioPriority => {
            if metrics.avg_total_trades < thresholds.min_avg_trades {
                penalty += 2_200.0 + (thresholds.min_avg_trades - metrics.avg_total_trades) * 420.0;
            }
            if metrics.profitable_ratio < thresholds.min_profitable_ratio {
                penalty += 12_000.0
                    + (thresholds.min_profitable_ratio - metrics.profitable_ratio) * 22_000.0;
            }
        }
        ObjectiveMode::Balanced => {
            if metrics.avg_total_trades < thresholds.min_avg_trades {
                penalty += 6_000.0 + (thresholds.min_avg_trades - metrics.avg_total_trades) * 800.0;
            }
            if metrics.profitable_ratio < thresholds.min_profitable_ratio {
                penalty += 6_000.0
                    + (thresholds.min_profitable_ratio - metrics.profitable_ratio) * 9_000.0;
            }
        }
    }
    if metrics.avg_win_rate_pct < thresholds.min_avg_win_rate_pct {
        penalty += 4_000.0 + (thresholds.min_avg_win_rate_pct - metrics.avg_win_rate_pct) * 180.0;
    }
    if metrics.avg_expectancy_krw < thresholds.min_expectancy_krw {
        penalty += 6_000.0 + (thresholds.min_expectancy_krw - metrics.avg_expectancy_krw) * 120.0;
    }
    if metrics.avg_profit_factor < 1.0 {
        penalty += (1.0 - metrics.avg_profit_factor) * 2_500.0;
    }

    if penalty > 0.0 {
        // Infeasible rows stay below every feasible row while the small
        // profit-factor term preserves an ordering among themselves.
        return round6(-penalty + metrics.avg_profit_factor * 10.0);
    }

    let score = match mode {
        ObjectiveMode::ProfitableRatioPriority => {
            metrics.profitable_ratio * 9_000.0
                + metrics.avg_expectancy_krw * 32.0
                + metrics.avg_win_rate_pct * 42.0
                + (metrics.avg_profit_factor - 1.0) * 220.0
                + metrics.avg_total_trades.min(20.0) * 12.0
        }
        ObjectiveMode::Balanced => {
            metrics.avg_expectancy_krw * 25.0
                + metrics.profitable_ratio * 4_000.0
                + metrics.avg_win_rate_pct * 40.0
                + (metrics.avg_profit_factor - 1.0) * 300.0
                + metrics.avg_total_trades.min(30.0) * 40.0
        }
    };
    round6(score)
}

/// Floors a row should be scored against: the statically requested set, or
/// the row's recorded effective (hostility-adjusted) set when the caller
/// opted into effective thresholds.
pub fn objective_thresholds_for_row(
    row: &EvaluationRow,
    requested: &ObjectiveThresholds,
    use_effective: bool,
) -> ObjectiveThresholds {
    if !use_effective {
        return *requested;
    }
    ObjectiveThresholds {
        min_avg_trades: row.effective_min_avg_trades,
        min_profitable_ratio: row.effective_min_profitable_ratio,
        min_avg_win_rate_pct: row.effective_min_avg_win_rate_pct,
        min_expectancy_krw: row.effective_min_expectancy_krw,
    }
}

/// Attach the objective score, the floors it used, and the feasibility flag
/// to a freshly evaluated row.
pub fn score_row(
    row: &mut EvaluationRow,
    requested: &ObjectiveThresholds,
    use_effective: bool,
    mode: ObjectiveMode,
) {
    let thresholds = objective_thresholds_for_row(row, requested, use_effective);
    let metrics = row.metrics();
    row.objective_score = compute_objective(&metrics, &thresholds, mode);
    row.objective_min_avg_trades = thresholds.min_avg_trades;
    row.objective_min_profitable_ratio = thresholds.min_profitable_ratio;
    row.objective_min_avg_win_rate_pct = thresholds.min_avg_win_rate_pct;
    row.objective_min_expectancy_krw = thresholds.min_expectancy_krw;
    row.constraint_pass = is_feasible(&metrics, &thresholds);
}
