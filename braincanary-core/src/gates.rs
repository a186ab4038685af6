use std::sync::Arc;

use serde::Serialize;

use crate::config::{Gate, GateComparison};
use crate::stats::{welch_t_test, SampleSummary};

/// Baseline observations required before any statistical verdict.
pub const MIN_BASELINE_SAMPLES: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passing,
    Failing,
    InsufficientData,
}

/// Outcome of evaluating one gate against the current score snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    pub scorer: String,
    pub status: GateStatus,
    pub p_value: Option<f64>,
    pub baseline_mean: f64,
    pub canary_mean: f64,
    pub baseline_n: u64,
    pub canary_n: u64,
    pub absolute_check: bool,
    pub comparison_check: bool,
    pub confidence_required: f64,
}

/// One version's view of a scorer: exact moments plus the retained raw
/// samples the t-test runs on.
#[derive(Debug, Clone)]
pub struct VersionSample {
    pub summary: SampleSummary,
    pub samples: Arc<[f64]>,
}

impl VersionSample {
    pub fn empty() -> Self {
        Self {
            summary: SampleSummary::default(),
            samples: Arc::from(Vec::new()),
        }
    }

    pub fn n(&self) -> u64 {
        self.summary.n
    }

    pub fn mean(&self) -> f64 {
        self.summary.mean
    }
}

/// Pure gate evaluation.
///
/// The comparison modes read the one-sided Welch value as the mass in favor
/// of the canary: `not_worse_than_baseline` holds unless that mass drops
/// below `1 - confidence`, `better_than_baseline` requires it to reach
/// `confidence`, and `absolute_only` skips the comparison entirely.
pub fn evaluate_gate(
    gate: &Gate,
    min_samples: u64,
    baseline: &VersionSample,
    canary: &VersionSample,
) -> GateResult {
    let base = GateResult {
        scorer: gate.scorer.clone(),
        status: GateStatus::InsufficientData,
        p_value: None,
        baseline_mean: baseline.mean(),
        canary_mean: canary.mean(),
        baseline_n: baseline.n(),
        canary_n: canary.n(),
        absolute_check: false,
        comparison_check: false,
        confidence_required: gate.confidence,
    };

    if canary.n() < min_samples || baseline.n() < MIN_BASELINE_SAMPLES {
        return base;
    }

    let absolute_check = canary.mean() >= gate.threshold;

    let (p_value, comparison_check) = match gate.comparison {
        GateComparison::AbsoluteOnly => (None, true),
        comparison => match welch_t_test(&baseline.samples, &canary.samples) {
            Ok(test) => {
                let p = test.p_one_sided;
                let check = match comparison {
                    GateComparison::NotWorseThanBaseline => p >= 1.0 - gate.confidence,
                    GateComparison::BetterThanBaseline => p >= gate.confidence,
                    GateComparison::AbsoluteOnly => unreachable!(),
                };
                (Some(p), check)
            }
            // Counts cleared the bar but too few raw samples survived for a
            // comparison; report the same verdict as a thin snapshot.
            Err(_) => return base,
        },
    };

    let status = if absolute_check && comparison_check {
        GateStatus::Passing
    } else {
        GateStatus::Failing
    };

    GateResult {
        status,
        p_value,
        absolute_check,
        comparison_check,
        ..base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RunningStats;

    fn version(values: &[f64]) -> VersionSample {
        let mut stats = RunningStats::new();
        for value in values {
            stats.add(*value);
        }
        VersionSample {
            summary: stats.summary(),
            samples: Arc::from(stats.samples().to_vec()),
        }
    }

    fn gate(comparison: GateComparison) -> Gate {
        Gate {
            scorer: "Quality".into(),
            threshold: 0.5,
            comparison,
            confidence: 0.95,
        }
    }

    #[test]
    fn short_canary_yields_insufficient_data() {
        let baseline = version(&[0.9; 12]);
        let canary = version(&[0.9; 4]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 5, &baseline, &canary);
        assert_eq!(result.status, GateStatus::InsufficientData);
        assert_eq!(result.p_value, None);
        assert!(!result.absolute_check);
        assert!(!result.comparison_check);
        assert_eq!(result.canary_n, 4);
    }

    #[test]
    fn short_baseline_yields_insufficient_data() {
        let baseline = version(&[0.9; 9]);
        let canary = version(&[0.9; 50]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 5, &baseline, &canary);
        assert_eq!(result.status, GateStatus::InsufficientData);
    }

    #[test]
    fn equivalent_sides_pass_not_worse() {
        let baseline = version(&[0.9, 0.91, 0.89, 0.9, 0.91, 0.88, 0.9, 0.9, 0.91, 0.89]);
        let canary = version(&[0.9, 0.89, 0.9, 0.9, 0.88, 0.91, 0.9, 0.89, 0.91, 0.9]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 2, &baseline, &canary);
        assert_eq!(result.status, GateStatus::Passing);
        assert!(result.absolute_check);
        assert!(result.comparison_check);
        let p = result.p_value.unwrap();
        assert!(p > 0.05, "p = {p}");
    }

    #[test]
    fn clear_regression_fails_with_strong_evidence() {
        let baseline = version(&[0.9, 0.91, 0.89, 0.9, 0.91, 0.88, 0.9, 0.9, 0.91, 0.89]);
        let canary = version(&[0.78, 0.75, 0.8, 0.76, 0.79, 0.77, 0.75, 0.78, 0.76, 0.77]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 2, &baseline, &canary);
        assert_eq!(result.status, GateStatus::Failing);
        assert!(!result.comparison_check);
        assert!(result.p_value.unwrap() < 0.01);
    }

    #[test]
    fn better_than_baseline_requires_clear_improvement() {
        let baseline = version(&[0.70, 0.72, 0.69, 0.71, 0.70, 0.68, 0.71, 0.72, 0.70, 0.69]);
        let improved = version(&[0.85, 0.86, 0.84, 0.85, 0.87, 0.86, 0.85, 0.84, 0.86, 0.85]);
        let result = evaluate_gate(&gate(GateComparison::BetterThanBaseline), 2, &baseline, &improved);
        assert_eq!(result.status, GateStatus::Passing);
        assert!(result.p_value.unwrap() > 0.95);

        let flat = version(&[0.70, 0.71, 0.70, 0.69, 0.72, 0.70, 0.71, 0.69, 0.70, 0.71]);
        let result = evaluate_gate(&gate(GateComparison::BetterThanBaseline), 2, &baseline, &flat);
        assert_eq!(result.status, GateStatus::Failing);
    }

    #[test]
    fn absolute_only_ignores_the_comparison() {
        let baseline = version(&[0.95; 20]);
        let weak_but_above = version(&[0.6; 20]);
        let result = evaluate_gate(&gate(GateComparison::AbsoluteOnly), 2, &baseline, &weak_but_above);
        assert_eq!(result.status, GateStatus::Passing);
        assert_eq!(result.p_value, None);
        assert!(result.comparison_check);

        let below = version(&[0.4; 20]);
        let result = evaluate_gate(&gate(GateComparison::AbsoluteOnly), 2, &baseline, &below);
        assert_eq!(result.status, GateStatus::Failing);
        assert!(!result.absolute_check);
    }

    #[test]
    fn boundary_at_min_samples() {
        let baseline = version(&[0.9; 15]);
        let canary = version(&[0.9; 29]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 30, &baseline, &canary);
        assert_eq!(result.status, GateStatus::InsufficientData);

        let canary = version(&[0.9; 30]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 30, &baseline, &canary);
        assert_ne!(result.status, GateStatus::InsufficientData);
    }

    #[test]
    fn constant_sides_hit_the_degenerate_welch_path() {
        let baseline = version(&[0.9; 15]);
        let canary = version(&[0.9; 15]);
        let result = evaluate_gate(&gate(GateComparison::NotWorseThanBaseline), 2, &baseline, &canary);
        assert_eq!(result.status, GateStatus::Passing);
        assert_eq!(result.p_value, Some(0.5));
    }
}
