//! Schedule-driven status transitions.

use chrono::{DateTime, Utc};
use experiment_core::types::{Experiment, ExperimentStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The status the scheduler should move `experiment` to at `now`, if any.
///
/// Only `draft → running` (start date reached, end not passed) and
/// `running → completed` (end date passed) happen automatically.
pub fn next_status(experiment: &Experiment, now: DateTime<Utc>) -> Option<ExperimentStatus> {
    let schedule = &experiment.schedule;
    match experiment.status {
        ExperimentStatus::Draft if schedule.contains(now) => Some(ExperimentStatus::Running),
        ExperimentStatus::Running if schedule.has_ended(now) => Some(ExperimentStatus::Completed),
        _ => None,
    }
}

/// One applied scheduler transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub experiment_id: Uuid,
    pub experiment_name: String,
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
}
