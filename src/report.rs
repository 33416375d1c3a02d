//! Typed gate-report and backtest-output documents.
//!
//! The matrix runner writes one JSON gate report per invocation; the tuner
//! and the improvement loop both consume it. Every field the pipeline
//! depends on is declared here with serde and validated at parse time, so a
//! missing profile summary or a truncated document surfaces as a typed
//! [`ReportError`] instead of a silently-defaulted metric skewing the
//! ranking.
//!
//! [`BacktestOutcome`] is the one-line JSON object the opaque backtest
//! executable prints after a run. The executable also logs freely to both
//! streams, so extraction scans the combined output backwards for the last
//! parseable JSON line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HostilityLevel, MetricSummary};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("gate report not found: {0}")]
    NotFound(PathBuf),

    #[error("malformed gate report {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("profile summary `{profile}` missing from gate report {path}")]
    MissingProfile { profile: String, path: PathBuf },

    #[error("failed to read gate report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The feasibility floors the gate enforces, as one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorSet {
    pub min_profit_factor: f64,
    pub min_expectancy_krw: f64,
    pub min_profitable_ratio: f64,
    pub min_avg_win_rate_pct: f64,
    pub min_avg_trades: f64,
}

/// Dataset-set hostility assessment attached when adaptive thresholds are
/// enabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostilityAssessment {
    pub hostility_level: HostilityLevel,
    pub avg_adversarial_score: f64,
}

/// Requested vs. effective floors plus the hostility assessment behind the
/// adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostilityAdaptive {
    pub requested: FloorSet,
    pub effective: FloorSet,
    pub hostility: HostilityAssessment,
}

/// Threshold context the matrix runner evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub min_profit_factor: f64,
    pub min_expectancy_krw: f64,
    pub max_drawdown_pct: f64,
    pub min_profitable_ratio: f64,
    pub min_avg_win_rate_pct: f64,
    pub min_avg_trades: f64,
    #[serde(default)]
    pub exclude_low_trade_runs_for_gate: bool,
    #[serde(default)]
    pub min_trades_per_run_for_gate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostility_adaptive: Option<HostilityAdaptive>,
}

impl ThresholdReport {
    /// The statically requested floors as a bundle.
    pub fn requested_floors(&self) -> FloorSet {
        FloorSet {
            min_profit_factor: self.min_profit_factor,
            min_expectancy_krw: self.min_expectancy_krw,
            min_profitable_ratio: self.min_profitable_ratio,
            min_avg_win_rate_pct: self.min_avg_win_rate_pct,
            min_avg_trades: self.min_avg_trades,
        }
    }
}

/// Candidate-vs-legacy regression gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComparisonGate {
    pub comparison_available: bool,
    pub baseline_profile: String,
    pub candidate_profile: String,
    pub delta_avg_profit_factor: f64,
    pub delta_avg_expectancy_krw: f64,
    pub delta_total_profit_sum_krw: f64,
    pub gate_profit_factor_delta_pass: bool,
    pub gate_expectancy_delta_pass: bool,
    pub gate_total_profit_delta_pass: bool,
    pub gate_pass: bool,
}

/// Aggregates for one profile across the dataset set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub profile_id: String,
    pub runs: u32,
    pub runs_used_for_gate: u32,
    pub excluded_low_trade_runs: u32,
    pub profitable_runs: u32,
    pub profitable_ratio: f64,
    pub avg_profit_factor: f64,
    pub avg_expectancy_krw: f64,
    pub avg_win_rate_pct: f64,
    pub peak_max_drawdown_pct: f64,
    pub avg_total_trades: f64,
    pub total_profit_sum_krw: f64,
    pub gate_sample_pass: bool,
    pub gate_profit_factor_pass: bool,
    pub gate_expectancy_pass: bool,
    pub gate_drawdown_pass: bool,
    pub gate_profitable_ratio_pass: bool,
    pub gate_win_rate_pass: bool,
    pub gate_trades_pass: bool,
    pub gate_pass: bool,
}

impl ProfileSummary {
    pub fn metrics(&self) -> MetricSummary {
        MetricSummary {
            avg_profit_factor: self.avg_profit_factor,
            avg_expectancy_krw: self.avg_expectancy_krw,
            avg_total_trades: self.avg_total_trades,
            avg_win_rate_pct: self.avg_win_rate_pct,
            profitable_ratio: self.profitable_ratio,
        }
    }
}

/// One backtest run inside the matrix (profile x dataset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    pub profile_id: String,
    pub profile_description: String,
    pub dataset: String,
    pub total_profit_krw: f64,
    pub profit_factor: f64,
    pub expectancy_krw: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub win_rate_pct: f64,
    pub profitable: bool,
    pub gate_trade_eligible: bool,
}

/// The structured report document the matrix runner writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub generated_at: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub thresholds: ThresholdReport,
    pub profile_gate_pass: bool,
    pub overall_gate_pass: bool,
    #[serde(default)]
    pub core_vs_legacy: ComparisonGate,
    pub profile_summaries: Vec<ProfileSummary>,
    #[serde(default)]
    pub matrix_rows: Vec<MatrixRow>,
}

impl GateReport {
    /// Load and validate a gate report document.
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReportError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ReportError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(text.trim_start_matches('\u{feff}')).map_err(|source| {
            ReportError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Summary for a specific profile; missing profiles are a typed error,
    /// never a default.
    pub fn find_profile(&self, profile_id: &str) -> Result<&ProfileSummary, ReportError> {
        self.profile_summaries
            .iter()
            .find(|summary| summary.profile_id == profile_id)
            .ok_or_else(|| ReportError::MissingProfile {
                profile: profile_id.to_string(),
                path: PathBuf::new(),
            })
    }

    /// The floors actually enforced: the hostility-adjusted set when the
    /// adaptive bundle is present, the requested set otherwise.
    pub fn effective_floors(&self) -> FloorSet {
        match &self.thresholds.hostility_adaptive {
            Some(adaptive) => adaptive.effective,
            None => self.thresholds.requested_floors(),
        }
    }

    pub fn hostility(&self) -> Option<HostilityAssessment> {
        self.thresholds
            .hostility_adaptive
            .as_ref()
            .map(|adaptive| adaptive.hostility)
    }
}

/// The single-line JSON result of one backtest invocation.
///
/// `max_drawdown` and `win_rate` arrive as fractions; the matrix runner
/// converts them to percentages when building rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestOutcome {
    #[serde(default)]
    pub final_balance: f64,
    pub total_profit: f64,
    pub max_drawdown: f64,
    pub total_trades: u64,
    #[serde(default)]
    pub winning_trades: u64,
    #[serde(default)]
    pub losing_trades: u64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy_krw: f64,
    #[serde(default)]
    pub avg_win_krw: f64,
    #[serde(default)]
    pub avg_loss_krw: f64,
}

/// Scan mixed stdout/stderr text backwards for the last line that parses as
/// a [`BacktestOutcome`]. Log lines, progress output, and partial braces are
/// skipped.
pub fn parse_last_json_line(text: &str) -> Option<BacktestOutcome> {
    for line in text.lines().rev() {
        let trimmed = line.trim();
        if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
            continue;
        }
        if let Ok(outcome) = serde_json::from_str::<BacktestOutcome>(trimmed) {
            return Some(outcome);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary(profile_id: &str) -> ProfileSummary {
        ProfileSummary {
            profile_id: profile_id.to_string(),
            runs: 4,
            runs_used_for_gate: 4,
            excluded_low_trade_runs: 0,
            profitable_runs: 3,
            profitable_ratio: 0.75,
            avg_profit_factor: 1.1,
            avg_expectancy_krw: 12.0,
            avg_win_rate_pct: 52.0,
            peak_max_drawdown_pct: 6.0,
            avg_total_trades: 18.0,
            total_profit_sum_krw: 40_000.0,
            gate_sample_pass: true,
            gate_profit_factor_pass: true,
            gate_expectancy_pass: true,
            gate_drawdown_pass: true,
            gate_profitable_ratio_pass: true,
            gate_win_rate_pass: true,
            gate_trades_pass: true,
            gate_pass: true,
        }
    }

    fn sample_report() -> GateReport {
        GateReport {
            generated_at: "2026-08-07T00:00:00Z".into(),
            inputs: serde_json::Value::Null,
            thresholds: ThresholdReport {
                min_profit_factor: 1.0,
                min_expectancy_krw: 0.0,
                max_drawdown_pct: 12.0,
                min_profitable_ratio: 0.55,
                min_avg_win_rate_pct: 48.0,
                min_avg_trades: 10.0,
                exclude_low_trade_runs_for_gate: true,
                min_trades_per_run_for_gate: 1,
                hostility_adaptive: None,
            },
            profile_gate_pass: true,
            overall_gate_pass: true,
            core_vs_legacy: ComparisonGate::default(),
            profile_summaries: vec![sample_summary("core_full")],
            matrix_rows: Vec::new(),
        }
    }

    #[test]
    fn test_find_profile_missing_is_typed_error() {
        let report = sample_report();
        assert!(report.find_profile("core_full").is_ok());
        match report.find_profile("legacy_default") {
            Err(ReportError::MissingProfile { profile, .. }) => {
                assert_eq!(profile, "legacy_default")
            }
            other => panic!("expected MissingProfile, got {:?}", other),
        }
    }

    #[test]
    fn test_effective_floors_fall_back_to_requested() {
        let mut report = sample_report();
        assert_eq!(report.effective_floors().min_avg_trades, 10.0);

        report.thresholds.hostility_adaptive = Some(HostilityAdaptive {
            requested: report.thresholds.requested_floors(),
            effective: FloorSet {
                min_avg_trades: 5.0,
                ..report.thresholds.requested_floors()
            },
            hostility: HostilityAssessment {
                hostility_level: HostilityLevel::High,
                avg_adversarial_score: 67.0,
            },
        });
        assert_eq!(report.effective_floors().min_avg_trades, 5.0);
    }

    #[test]
    fn test_report_roundtrip() {
        let report = sample_report();
        let text = serde_json::to_string_pretty(&report).unwrap();
        let parsed: GateReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = std::env::temp_dir().join(format!("edgetune_report_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        match GateReport::load(&dir.join("absent.json")) {
            Err(ReportError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }

        let broken = dir.join("broken.json");
        std::fs::write(&broken, "{\"generated_at\": 1").unwrap();
        match GateReport::load(&broken) {
            Err(ReportError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_parse_last_json_line_skips_noise() {
        let text = concat!(
            "loading candles...\n",
            "{\"partial\": true}\n",
            "progress 50%\n",
            "{\"total_profit\": 1200.5, \"max_drawdown\": 0.08, \"total_trades\": 42, ",
            "\"win_rate\": 0.55, \"profit_factor\": 1.3, \"expectancy_krw\": 28.6}\n",
            "done\n",
        );
        let outcome = parse_last_json_line(text).expect("outcome line present");
        assert_eq!(outcome.total_trades, 42);
        assert_eq!(outcome.profit_factor, 1.3);
    }

    #[test]
    fn test_parse_last_json_line_requires_required_fields() {
        assert!(parse_last_json_line("{\"total_profit\": 1.0}\n").is_none());
        assert!(parse_last_json_line("no json here\n").is_none());
    }
}
