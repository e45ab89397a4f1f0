//! Results aggregation: metric derivation from tracked events, per-variant
//! performance against the control, significance and recommendations.

use chrono::{DateTime, Utc};
use experiment_core::types::{Experiment, Goal, GoalType, MetricRecord, Participant, ParticipantEvent, Winner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::stats::{ArmSample, SignificanceOutcome, SignificanceTest};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReport {
    pub experiment_id: Uuid,
    pub experiment_name: String,
    /// Name of the significance method behind `confidence` values.
    pub method: String,
    pub summary: ResultsSummary,
    pub variant_performance: BTreeMap<String, VariantPerformance>,
    pub recommendations: Vec<Recommendation>,
    pub winner: Option<Winner>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSummary {
    pub total_participants: u64,
    /// Every declared variant, including those with no participants.
    pub variant_distribution: BTreeMap<String, u64>,
    pub overall_improvement: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantPerformance {
    pub participant_count: u64,
    pub is_control: bool,
    pub metrics: Vec<MetricRecord>,
    /// Percent change of the primary-goal metric against the control.
    pub improvement: Option<f64>,
    pub significance: Option<SignificanceOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    CollectMoreData,
    Promote,
    Discard,
    KeepRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub action: RecommendationAction,
    pub variant: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ReportSettings {
    pub alpha: f64,
    pub min_sample_size: u64,
}

/// Derive one metric per (goal, variant) from the participants' events.
pub fn derive_metrics(experiment: &Experiment, participants: &[Participant]) -> Vec<MetricRecord> {
    let mut metrics = Vec::with_capacity(experiment.goals.len() * experiment.variants.len());
    for goal in &experiment.goals {
        for variant in &experiment.variants {
            let members: Vec<&Participant> = participants
                .iter()
                .filter(|p| p.assigned_variant == variant.name)
                .collect();
            metrics.push(MetricRecord {
                name: goal.name.clone(),
                variant: variant.name.clone(),
                value: goal_value(goal, &members),
                confidence: None,
                sample_size: members.len() as u64,
            });
        }
    }
    metrics
}

fn goal_value(goal: &Goal, members: &[&Participant]) -> f64 {
    let n = members.len() as f64;
    let matching = || {
        members
            .iter()
            .flat_map(|p| p.events.iter())
            .filter(|e| e.event_type == goal.event_type())
    };
    match goal.goal_type {
        GoalType::Conversion => {
            if members.is_empty() {
                return 0.0;
            }
            converters(members, goal) as f64 / n
        }
        GoalType::Revenue => {
            if members.is_empty() {
                return 0.0;
            }
            matching().filter_map(event_value).sum::<f64>() / n
        }
        GoalType::Engagement => {
            if members.is_empty() {
                return 0.0;
            }
            matching().count() as f64 / n
        }
        GoalType::Custom => {
            let values: Vec<f64> = matching().filter_map(event_value).collect();
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
    }
}

fn converters(members: &[&Participant], goal: &Goal) -> u64 {
    members
        .iter()
        .filter(|p| p.events.iter().any(|e| e.event_type == goal.event_type()))
        .count() as u64
}

/// Numeric payload of an event: `data.value`, `data.amount`, or a bare number.
fn event_value(event: &ParticipantEvent) -> Option<f64> {
    event
        .data
        .get("value")
        .or_else(|| event.data.get("amount"))
        .and_then(|v| v.as_f64())
        .or_else(|| event.data.as_f64())
}

/// Relative change in percent; `None` when the baseline is zero or either
/// side is missing.
pub fn relative_improvement(value: Option<f64>, control: Option<f64>) -> Option<f64> {
    match (value, control) {
        (Some(v), Some(c)) if c != 0.0 => {
            let improvement = (v - c) / c * 100.0;
            improvement.is_finite().then_some(improvement)
        }
        _ => None,
    }
}

pub fn compute_results(
    experiment: &Experiment,
    participants: &[Participant],
    metrics: &[MetricRecord],
    test: &dyn SignificanceTest,
    settings: ReportSettings,
    now: DateTime<Utc>,
) -> ExperimentReport {
    let mut distribution: BTreeMap<String, u64> = experiment
        .variants
        .iter()
        .map(|v| (v.name.clone(), 0))
        .collect();
    for participant in participants {
        *distribution
            .entry(participant.assigned_variant.clone())
            .or_default() += 1;
    }

    let primary = experiment.primary_goal();
    let control = experiment.control_variant();
    let primary_value = |variant: &str| {
        primary.and_then(|goal| {
            metrics
                .iter()
                .find(|m| m.name == goal.name && m.variant == variant)
                .map(|m| m.value)
        })
    };
    let control_value = control.and_then(|c| primary_value(&c.name));

    // Conversion counts only make sense for a conversion goal.
    let arm = |variant: &str| -> Option<ArmSample> {
        let goal = primary.filter(|g| g.goal_type == GoalType::Conversion)?;
        let members: Vec<&Participant> = participants
            .iter()
            .filter(|p| p.assigned_variant == variant)
            .collect();
        Some(ArmSample {
            participants: members.len() as u64,
            conversions: converters(&members, goal),
        })
    };
    let control_arm = control.and_then(|c| arm(&c.name));

    let mut performance = BTreeMap::new();
    for variant in &experiment.variants {
        let is_control = control.is_some_and(|c| c.name == variant.name);
        let significance = if is_control {
            None
        } else {
            control_arm
                .zip(arm(&variant.name))
                .filter(|(c, t)| {
                    let floor = settings.min_sample_size.max(1);
                    c.participants >= floor && t.participants >= floor
                })
                .and_then(|(c, t)| test.compare(c, t))
        };
        performance.insert(
            variant.name.clone(),
            VariantPerformance {
                participant_count: distribution.get(&variant.name).copied().unwrap_or(0),
                is_control,
                metrics: metrics
                    .iter()
                    .filter(|m| m.variant == variant.name)
                    .cloned()
                    .collect(),
                improvement: relative_improvement(primary_value(&variant.name), control_value),
                significance,
            },
        );
    }

    let best = performance
        .iter()
        .filter(|(_, p)| !p.is_control)
        .filter_map(|(name, p)| p.improvement.map(|i| (name, i, p.significance)))
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let summary = ResultsSummary {
        total_participants: participants.len() as u64,
        variant_distribution: distribution,
        overall_improvement: best.map(|(_, i, _)| i),
        confidence: best.and_then(|(_, _, s)| s.map(|s| s.confidence)),
    };

    let recommendations = recommend(&summary, &performance, settings);

    ExperimentReport {
        experiment_id: experiment.id,
        experiment_name: experiment.name.clone(),
        method: test.name().to_string(),
        summary,
        variant_performance: performance,
        recommendations,
        winner: experiment.results.winner.clone(),
        generated_at: now,
    }
}

fn recommend(
    summary: &ResultsSummary,
    performance: &BTreeMap<String, VariantPerformance>,
    settings: ReportSettings,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if summary.total_participants == 0 {
        out.push(Recommendation {
            action: RecommendationAction::CollectMoreData,
            variant: None,
            message: "No participants yet.".to_string(),
        });
        return out;
    }

    for (name, perf) in performance {
        if perf.participant_count < settings.min_sample_size {
            out.push(Recommendation {
                action: RecommendationAction::CollectMoreData,
                variant: Some(name.clone()),
                message: format!(
                    "{name} has {} of {} participants needed.",
                    perf.participant_count, settings.min_sample_size
                ),
            });
        }
    }

    let mut decided = false;
    for (name, perf) in performance.iter().filter(|(_, p)| !p.is_control) {
        let Some(sig) = perf.significance.filter(|s| s.is_significant(settings.alpha)) else {
            continue;
        };
        decided = true;
        let lift = perf
            .improvement
            .map(|i| format!("{i:+.1}%"))
            .unwrap_or_else(|| "n/a".to_string());
        let (action, verdict) = if sig.z_score > 0.0 {
            (RecommendationAction::Promote, "outperforms")
        } else {
            (RecommendationAction::Discard, "underperforms")
        };
        out.push(Recommendation {
            action,
            variant: Some(name.clone()),
            message: format!(
                "{name} {verdict} control ({lift}, confidence {:.1}%).",
                sig.confidence * 100.0
            ),
        });
    }

    if !decided && out.is_empty() {
        out.push(Recommendation {
            action: RecommendationAction::KeepRunning,
            variant: None,
            message: "No significant difference yet. Keep running the experiment.".to_string(),
        });
    }
    out
}
