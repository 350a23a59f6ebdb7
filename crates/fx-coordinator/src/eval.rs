//! Merging of per-participant evaluation reports.

use fx_types::{EvalReport, ParticipantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Evaluation results of one round, merged across participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub round: u64,
    pub participants: usize,
    /// Per-metric average weighted by participant sample size.
    pub weighted_avg: BTreeMap<String, f64>,
    /// Per-metric plain average.
    pub avg: BTreeMap<String, f64>,
}

impl EvalSummary {
    /// Merge reports. A metric is averaged over the participants that reported it.
    pub fn merge(round: u64, reports: &BTreeMap<ParticipantId, EvalReport>) -> Self {
        let mut sums: BTreeMap<&str, (f64, f64, f64, usize)> = BTreeMap::new();
        for report in reports.values() {
            for (name, value) in &report.metrics {
                let entry = sums.entry(name.as_str()).or_default();
                entry.0 += report.sample_size * value;
                entry.1 += report.sample_size;
                entry.2 += value;
                entry.3 += 1;
            }
        }

        let mut weighted_avg = BTreeMap::new();
        let mut avg = BTreeMap::new();
        for (name, (weighted_sum, weight, sum, count)) in sums {
            if weight > 0.0 {
                weighted_avg.insert(name.to_string(), weighted_sum / weight);
            }
            avg.insert(name.to_string(), sum / count as f64);
        }

        Self {
            round,
            participants: reports.len(),
            weighted_avg,
            avg,
        }
    }

    /// The value of `metric`, preferring the weighted average.
    pub fn tracked_value(&self, metric: &str) -> Option<f64> {
        self.weighted_avg
            .get(metric)
            .or_else(|| self.avg.get(metric))
            .copied()
    }
}
