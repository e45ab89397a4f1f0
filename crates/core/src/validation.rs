//! Definition checks run on every experiment create/update. A definition that
//! fails here is rejected before it reaches the store.

use crate::error::{ExperimentError, ExperimentResult};
use crate::types::{Experiment, ExperimentType, Segment, SegmentType};
use std::collections::HashSet;

pub fn validate_experiment(experiment: &Experiment) -> ExperimentResult<()> {
    if experiment.name.trim().is_empty() {
        return Err(config_err("experiment name must not be empty"));
    }
    if experiment.metadata.creator.trim().is_empty() {
        return Err(config_err("metadata.creator is required"));
    }

    validate_variants(experiment)?;

    let percentage = experiment.audience.percentage;
    if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
        return Err(config_err(format!(
            "audience.percentage must be within 0..=100, got {percentage}"
        )));
    }
    for segment in &experiment.audience.segments {
        validate_segment(segment)?;
    }

    let mut goal_names = HashSet::new();
    for goal in &experiment.goals {
        if goal.name.trim().is_empty() {
            return Err(config_err("goal name must not be empty"));
        }
        if !goal_names.insert(goal.name.as_str()) {
            return Err(config_err(format!("duplicate goal name '{}'", goal.name)));
        }
    }

    if let Some(end) = experiment.schedule.end_date {
        if end <= experiment.schedule.start_date {
            return Err(config_err("schedule.endDate must be after schedule.startDate"));
        }
    }

    match (&experiment.feature_flag, experiment.experiment_type) {
        (None, ExperimentType::FeatureFlag) => {
            return Err(config_err("feature_flag experiments require a featureFlag block"));
        }
        (Some(flag), _) => {
            if flag.key.trim().is_empty() {
                return Err(config_err("featureFlag.key must not be empty"));
            }
            for rule in &flag.rules {
                for segment in &rule.condition {
                    validate_segment(segment)?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_variants(experiment: &Experiment) -> ExperimentResult<()> {
    if experiment.variants.is_empty() {
        return Err(config_err("an experiment needs at least one variant"));
    }

    let mut names = HashSet::new();
    let mut total = 0.0;
    for variant in &experiment.variants {
        if variant.name.trim().is_empty() {
            return Err(config_err("variant name must not be empty"));
        }
        if !names.insert(variant.name.as_str()) {
            return Err(config_err(format!("duplicate variant name '{}'", variant.name)));
        }
        if !variant.weight.is_finite() || variant.weight < 0.0 {
            return Err(config_err(format!(
                "variant '{}' has invalid weight {}",
                variant.name, variant.weight
            )));
        }
        total += variant.weight;
    }
    if total <= 0.0 {
        return Err(config_err("variant weights must not all be zero"));
    }

    let controls = experiment.variants.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        return Err(config_err("at most one variant may be flagged as control"));
    }
    Ok(())
}

/// Reject segments the audience evaluator could never satisfy.
pub fn validate_segment(segment: &Segment) -> ExperimentResult<()> {
    if segment.operator.is_numeric() && segment.value.as_f64().is_none() {
        return Err(config_err(format!(
            "{:?} segment with operator {:?} needs a numeric value",
            segment.segment_type, segment.operator
        )));
    }
    match segment.segment_type {
        SegmentType::Custom => {
            if segment.field.as_deref().map_or(true, |f| f.trim().is_empty()) {
                return Err(config_err("custom segments must name an attribute in 'field'"));
            }
        }
        SegmentType::Usage => {
            let field = segment.field.as_deref().unwrap_or("listings");
            if !matches!(field, "listings" | "api_calls" | "apiCalls" | "storage") {
                return Err(config_err(format!("unknown usage counter '{field}'")));
            }
        }
        _ => {}
    }
    Ok(())
}

fn config_err(msg: impl Into<String>) -> ExperimentError {
    ExperimentError::Config(msg.into())
}
