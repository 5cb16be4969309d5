//! Score aggregation.
//!
//! Combines a [`Verdict`]'s sub-signals into a bounded score and a pass
//! decision. Inapplicable signals (`None`) drop out and the remaining
//! weights are renormalized, so a static-check task and a sanitizer task
//! are scored on the same 0.0-1.0 scale.

use serde::{Deserialize, Serialize};

use crate::verification::Verdict;

/// Scores are rounded to this precision before comparison.
const SCORE_EPSILON: f64 = 1e-9;

/// Weight of each verdict sub-signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub compiles: f64,
    pub sanitizer_clean: f64,
    pub tests_pass: f64,
    pub structure_matches: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            compiles: 0.2,
            sanitizer_clean: 0.2,
            tests_pass: 0.4,
            structure_matches: 0.2,
        }
    }
}

impl ScoreWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.compiles + self.sanitizer_clean + self.tests_pass + self.structure_matches
    }

    /// Returns true if the weights are non-negative and sum to 1.0.
    pub fn is_normalized(&self) -> bool {
        let all_non_negative = [
            self.compiles,
            self.sanitizer_clean,
            self.tests_pass,
            self.structure_matches,
        ]
        .iter()
        .all(|w| *w >= 0.0);
        all_non_negative && (self.total() - 1.0).abs() < 1e-6
    }
}

/// How a score is turned into a pass/fail decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringPolicy {
    /// Pass only when every applicable signal is true.
    BinaryGate,
    /// Pass when the weighted score reaches the threshold.
    Threshold { threshold: f64 },
}

impl ScoringPolicy {
    /// The score a candidate must reach to pass.
    pub fn threshold(&self) -> f64 {
        match self {
            ScoringPolicy::BinaryGate => 1.0,
            ScoringPolicy::Threshold { threshold } => *threshold,
        }
    }
}

impl std::fmt::Display for ScoringPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoringPolicy::BinaryGate => write!(f, "binary_gate"),
            ScoringPolicy::Threshold { threshold } => write!(f, "threshold({threshold})"),
        }
    }
}

/// Final score of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Weighted score in [0.0, 1.0].
    pub value: f64,
    /// Whether the candidate passed under `policy`.
    pub pass: bool,
    /// Policy the decision was made under.
    pub policy: ScoringPolicy,
}

impl Score {
    /// Zero score, used for rejected patches and missing candidates.
    pub fn zero(policy: ScoringPolicy) -> Self {
        Self {
            value: 0.0,
            pass: false,
            policy,
        }
    }
}

/// Computes the score for a verdict.
///
/// Pure: the same verdict, policy and weights always give the same score.
pub fn score(verdict: &Verdict, policy: ScoringPolicy, weights: &ScoreWeights) -> Score {
    let signals = [
        (verdict.compiles, weights.compiles),
        (verdict.sanitizer_clean, weights.sanitizer_clean),
        (verdict.tests_pass, weights.tests_pass),
        (verdict.structure_matches, weights.structure_matches),
    ];

    let mut applicable_weight = 0.0;
    let mut earned = 0.0;
    for (signal, weight) in signals {
        if let Some(ok) = signal {
            applicable_weight += weight;
            if ok {
                earned += weight;
            }
        }
    }

    if applicable_weight <= 0.0 {
        return Score::zero(policy);
    }

    let value = round(earned / applicable_weight).clamp(0.0, 1.0);
    let threshold = round(policy.threshold());
    Score {
        value,
        pass: value >= threshold,
        policy,
    }
}

fn round(value: f64) -> f64 {
    (value / SCORE_EPSILON).round() * SCORE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(
        compiles: Option<bool>,
        sanitizer_clean: Option<bool>,
        tests_pass: Option<bool>,
        structure_matches: Option<bool>,
    ) -> Verdict {
        Verdict {
            compiles,
            sanitizer_clean,
            tests_pass,
            structure_matches,
        }
    }

    #[test]
    fn test_structure_miss_scores_point_eight() {
        let v = verdict(Some(true), Some(true), Some(true), Some(false));
        let weights = ScoreWeights::default();

        let gated = score(&v, ScoringPolicy::BinaryGate, &weights);
        assert!((gated.value - 0.8).abs() < 1e-9);
        assert!(!gated.pass);

        let threshold = score(&v, ScoringPolicy::Threshold { threshold: 0.7 }, &weights);
        assert!((threshold.value - 0.8).abs() < 1e-9);
        assert!(threshold.pass);
    }

    #[test]
    fn test_renormalizes_inapplicable_signals() {
        // Scripted runner: only tests_pass and structure_matches apply.
        let v = verdict(None, None, Some(true), Some(false));
        let s = score(&v, ScoringPolicy::BinaryGate, &ScoreWeights::default());
        assert!((s.value - 0.4 / 0.6).abs() < 1e-9);
        assert!(!s.pass);

        let v = verdict(None, None, Some(true), None);
        let s = score(&v, ScoringPolicy::BinaryGate, &ScoreWeights::default());
        assert_eq!(s.value, 1.0);
        assert!(s.pass);
    }

    #[test]
    fn test_no_applicable_signal_is_zero() {
        let s = score(
            &Verdict::default(),
            ScoringPolicy::Threshold { threshold: 0.0 },
            &ScoreWeights::default(),
        );
        assert_eq!(s.value, 0.0);
        assert!(!s.pass);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // 0.2 + 0.4 + 0.2 of 1.0 lands exactly on 0.8 after rounding.
        let v = verdict(Some(true), Some(false), Some(true), Some(true));
        let s = score(
            &v,
            ScoringPolicy::Threshold { threshold: 0.8 },
            &ScoreWeights::default(),
        );
        assert!(s.pass);
    }

    #[test]
    fn test_score_is_idempotent() {
        let v = verdict(Some(true), None, Some(false), Some(true));
        let weights = ScoreWeights::default();
        let a = score(&v, ScoringPolicy::BinaryGate, &weights);
        let b = score(&v, ScoringPolicy::BinaryGate, &weights);
        assert_eq!(a, b);
    }

    #[test]
    fn test_weights_normalization_check() {
        assert!(ScoreWeights::default().is_normalized());
        let skewed = ScoreWeights {
            tests_pass: 0.9,
            ..Default::default()
        };
        assert!(!skewed.is_normalized());
    }
}
