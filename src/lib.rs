//! edgetune - candidate tuning and auto-improvement for backtest-gated
//! trading thresholds.
//!
//! The trading engine's decision thresholds (edge floors, reward/risk bands,
//! per-strategy signal-strength minimums, hostility response) are tuned
//! against historical market data by repeatedly invoking the opaque backtest
//! executable and gating candidates on a multi-factor profitability
//! objective.
//!
//! # Architecture
//!
//! ```text
//! Combo Generator → Screening Funnel → Objective Scorer → best candidate
//!       ↓                 ↓                  ↓                  ↓
//!   scenario grids   screen/final      feasibility-first   Auto-Improvement
//!   + fingerprints   two-stage eval    penalty scoring     Loop (apply,
//!                        ↓                                  re-validate)
//!                 Candidate Evaluator ←── Evaluation Cache
//!                        ↓
//!                 Matrix Runner (subprocess) → backtest exe per dataset
//! ```
//!
//! # Coordination
//!
//! - One cross-process [`lock`] serializes every run that mutates the shared
//!   configuration file; the improvement loop holds it across all nested
//!   tuning work via an explicit reentrancy handle.
//! - Evaluations are memoized in a content-addressed [`cache`] keyed by
//!   canonical [`fingerprint`]s, so repeated runs skip unchanged work.
//! - The shared configuration is snapshotted and restored on every exit
//!   path of a tuning run.

pub mod cache;
pub mod combos;
pub mod config;
pub mod datasets;
pub mod evaluator;
pub mod fingerprint;
pub mod funnel;
pub mod improve;
pub mod lock;
pub mod matrix;
pub mod report;
pub mod score;
pub mod settings;
pub mod types;

// Re-export the core vocabulary.
pub use combos::{ComboSpec, ScenarioMode};
pub use evaluator::{CommandMatrixRunner, EvaluationContext, MatrixRequest, MatrixRunner};
pub use funnel::{TuneOptions, TuneOutcome};
pub use improve::{ImproveOptions, ImproveOutcome, LoopStatus};
pub use score::{ObjectiveMode, ObjectiveThresholds};
pub use types::{EvaluationRow, MetricSummary, Stage};
