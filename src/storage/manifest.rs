//! Run manifest: aggregate view over a run's records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::RunRecord;
use crate::scheduler::JobState;

/// Totals for one slice of a run (all jobs, or one category, tier, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub jobs: usize,
    pub passed: usize,
    /// Evaluated and not passed, including rejected patches.
    pub failed: usize,
    /// Failed because the patch was rejected or missing.
    pub rejected: usize,
    /// Infrastructure errors and cancellations.
    pub not_evaluated: usize,
    /// Mean score over evaluated jobs; `None` when nothing was evaluated.
    pub mean_score: Option<f64>,
    #[serde(skip)]
    score_sum: f64,
}

impl GroupStats {
    fn add(&mut self, record: &RunRecord) {
        self.jobs += 1;
        if record.evaluated() {
            self.score_sum += record.score.value;
            if record.passed() {
                self.passed += 1;
            } else {
                self.failed += 1;
            }
            if record.rejection.is_some() {
                self.rejected += 1;
            }
            let evaluated = (self.passed + self.failed) as f64;
            self.mean_score = Some(self.score_sum / evaluated);
        } else {
            self.not_evaluated += 1;
        }
    }

    pub fn evaluated(&self) -> usize {
        self.passed + self.failed
    }
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: usize,
    pub candidates: Vec<String>,
    pub totals: GroupStats,
    /// Job count per terminal state.
    pub states: BTreeMap<JobState, usize>,
    pub by_category: BTreeMap<String, GroupStats>,
    pub by_tier: BTreeMap<u8, GroupStats>,
    pub by_engine: BTreeMap<String, GroupStats>,
    pub by_candidate: BTreeMap<String, GroupStats>,
}

impl RunManifest {
    /// Aggregates `records`.
    pub fn from_records(
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        tasks: usize,
        candidates: Vec<String>,
        records: &[RunRecord],
    ) -> Self {
        let mut manifest = Self {
            run_id: run_id.into(),
            started_at,
            finished_at: Utc::now(),
            tasks,
            candidates,
            totals: GroupStats::default(),
            states: BTreeMap::new(),
            by_category: BTreeMap::new(),
            by_tier: BTreeMap::new(),
            by_engine: BTreeMap::new(),
            by_candidate: BTreeMap::new(),
        };

        for record in records {
            manifest.totals.add(record);
            *manifest.states.entry(record.state).or_default() += 1;
            manifest
                .by_category
                .entry(record.task.category.clone())
                .or_default()
                .add(record);
            manifest.by_tier.entry(record.task.tier).or_default().add(record);
            manifest
                .by_engine
                .entry(record.task.engine.clone())
                .or_default()
                .add(record);
            manifest
                .by_candidate
                .entry(record.candidate.source.clone())
                .or_default()
                .add(record);
        }
        manifest
    }

    /// Jobs that could not be evaluated because of infrastructure errors.
    pub fn infrastructure_errors(&self) -> usize {
        self.states
            .get(&JobState::InfrastructureError)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Provenance;
    use crate::patch::PatchRejected;
    use crate::scoring::{Score, ScoringPolicy};
    use crate::storage::record::TaskRef;
    use crate::task::StrategyKind;

    fn record(category: &str, tier: u8, candidate: &str, state: JobState, value: f64) -> RunRecord {
        RunRecord {
            record_id: format!("{category}.{candidate}.1"),
            run_id: "run".to_string(),
            task: TaskRef {
                id: category.to_string(),
                category: category.to_string(),
                engine: "julius".to_string(),
                tier,
                strategy: StrategyKind::ScriptedTestRunner,
                digest: String::new(),
            },
            candidate: Provenance {
                source: candidate.to_string(),
                model: None,
                timestamp: Utc::now(),
                path: None,
            },
            state,
            attempts: 1,
            patch: None,
            applied_diff_blob: None,
            executions: Vec::new(),
            samples: 0,
            verdict: None,
            score: Score {
                value,
                pass: state == JobState::Succeeded,
                policy: ScoringPolicy::BinaryGate,
            },
            structure: None,
            detail: None,
            rejection: None,
            infrastructure_error: None,
            infrastructure_errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_aggregates_by_group() {
        let mut rejected = record("bounds", 1, "model-x", JobState::Failed, 0.0);
        rejected.rejection = Some(PatchRejected::NoCandidate);
        let records = vec![
            record("bounds", 1, "reference", JobState::Succeeded, 1.0),
            record("bounds", 1, "baseline", JobState::Failed, 0.5),
            rejected,
            record("leak", 2, "reference", JobState::InfrastructureError, 0.0),
            record("leak", 2, "baseline", JobState::Cancelled, 0.0),
        ];
        let manifest = RunManifest::from_records("run", Utc::now(), 2, vec![], &records);

        assert_eq!(manifest.totals.jobs, 5);
        assert_eq!(manifest.totals.passed, 1);
        assert_eq!(manifest.totals.failed, 2);
        assert_eq!(manifest.totals.rejected, 1);
        assert_eq!(manifest.totals.not_evaluated, 2);
        assert_eq!(manifest.totals.mean_score, Some(0.5));
        assert_eq!(manifest.infrastructure_errors(), 1);

        assert_eq!(manifest.by_category["bounds"].jobs, 3);
        assert_eq!(manifest.by_tier[&2].mean_score, None);
        assert_eq!(manifest.by_candidate["reference"].passed, 1);
        assert_eq!(manifest.by_engine["julius"].jobs, 5);
        assert_eq!(manifest.states[&JobState::Cancelled], 1);
    }

    #[test]
    fn test_serializes_state_keys() {
        let records = vec![record("c", 1, "reference", JobState::Succeeded, 1.0)];
        let manifest =
            RunManifest::from_records("run", Utc::now(), 1, vec!["reference".into()], &records);
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(json["states"]["succeeded"], 1);
        assert_eq!(json["by_tier"]["1"]["passed"], 1);
    }
}
