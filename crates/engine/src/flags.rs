//! Feature flag resolution on top of an experiment.

use experiment_core::types::{Experiment, FlagRule, UserProfile};
use serde::{Deserialize, Serialize};

use crate::audience::segments_match;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// Experiment not running or outside its schedule.
    Inactive,
    /// A targeting rule matched.
    Rule,
    /// User failed the audience segments or percentage gate.
    NotTargeted,
    /// Value taken from the user's assigned variant.
    Variant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagEvaluation {
    pub key: String,
    pub value: serde_json::Value,
    pub variant: Option<String>,
    pub reason: FlagReason,
}

/// Rules ordered by descending priority; ties keep declaration order.
pub fn ordered_rules(experiment: &Experiment) -> Vec<&FlagRule> {
    let mut rules: Vec<&FlagRule> = experiment
        .feature_flag
        .as_ref()
        .map(|f| f.rules.iter().collect())
        .unwrap_or_default();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

/// First rule whose condition matches `user`.
pub fn matching_rule<'a>(experiment: &'a Experiment, user: &UserProfile) -> Option<&'a FlagRule> {
    ordered_rules(experiment)
        .into_iter()
        .find(|rule| segments_match(&rule.condition, user, &experiment.name))
}

/// Flag value for a user bucketed into `variant`: the variant's config, or
/// the flag default when the variant carries none.
pub fn variant_value(experiment: &Experiment, variant: &str) -> serde_json::Value {
    let default = experiment
        .feature_flag
        .as_ref()
        .map(|f| f.default_value.clone())
        .unwrap_or_default();
    match experiment.variant(variant) {
        Some(v) if !v.config.is_null() => v.config.clone(),
        _ => default,
    }
}
