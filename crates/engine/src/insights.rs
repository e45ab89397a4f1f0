//! Portfolio view across experiments, grouped by experiment type.

use chrono::{DateTime, Duration, Utc};
use experiment_core::types::{Experiment, ExperimentStatus, ExperimentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInsight {
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub count: u64,
    /// Mean improvement over experiments with a declared winner.
    pub avg_improvement: Option<f64>,
    /// Share of experiments whose declared winner improved on control.
    pub success_rate: f64,
}

/// Running or completed experiments that started within the last
/// `timeframe_days`, grouped by type.
pub fn experiment_insights(
    experiments: &[Experiment],
    now: DateTime<Utc>,
    timeframe_days: i64,
) -> Vec<TypeInsight> {
    let since = now - Duration::days(timeframe_days);

    #[derive(Default)]
    struct Acc {
        count: u64,
        improvements: Vec<f64>,
        successes: u64,
    }

    let mut groups: BTreeMap<ExperimentType, Acc> = BTreeMap::new();
    for exp in experiments.iter().filter(|e| {
        matches!(e.status, ExperimentStatus::Running | ExperimentStatus::Completed)
            && e.schedule.start_date >= since
    }) {
        let acc = groups.entry(exp.experiment_type).or_default();
        acc.count += 1;
        if let Some(improvement) = exp.results.winner.as_ref().and_then(|w| w.improvement) {
            acc.improvements.push(improvement);
            if improvement > 0.0 {
                acc.successes += 1;
            }
        }
    }

    groups
        .into_iter()
        .map(|(experiment_type, acc)| TypeInsight {
            experiment_type,
            count: acc.count,
            avg_improvement: (!acc.improvements.is_empty())
                .then(|| acc.improvements.iter().sum::<f64>() / acc.improvements.len() as f64),
            success_rate: acc.successes as f64 / acc.count as f64,
        })
        .collect()
}
