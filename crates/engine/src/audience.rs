//! Audience evaluation: segment predicates, schedule window and the
//! percentage gate.

use chrono::{DateTime, Utc};
use experiment_core::types::{Experiment, Segment, SegmentOperator, SegmentType, UserProfile};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::hashing::{gate_key, StableHash};

/// A segment that cannot be evaluated. Treated as "no match".
#[derive(Debug, Error, PartialEq)]
pub enum SegmentError {
    #[error("operator {0:?} needs a numeric value")]
    NonNumericOperand(SegmentOperator),
    #[error("custom segment has no attribute name")]
    MissingField,
    #[error("unknown usage counter '{0}'")]
    UnknownUsageCounter(String),
}

/// Full eligibility check: active window, every segment, then the
/// percentage gate.
pub fn is_eligible(
    experiment: &Experiment,
    user: &UserProfile,
    now: DateTime<Utc>,
    hasher: &dyn StableHash,
) -> bool {
    if !experiment.is_active_at(now) {
        return false;
    }
    if !segments_match(&experiment.audience.segments, user, &experiment.name) {
        return false;
    }
    passes_percentage_gate(experiment, &user.id, hasher)
}

/// Logical AND over `segments`. Malformed segments fail closed.
pub fn segments_match(segments: &[Segment], user: &UserProfile, context: &str) -> bool {
    segments.iter().all(|segment| match evaluate_segment(segment, user) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(
                experiment = context,
                segment_type = ?segment.segment_type,
                error = %e,
                "Segment misconfigured, excluding user"
            );
            false
        }
    })
}

/// Sticky inclusion: a user's bucket for this experiment never changes, so
/// they are consistently in or out.
pub fn passes_percentage_gate(experiment: &Experiment, user_id: &str, hasher: &dyn StableHash) -> bool {
    let bucket = hasher.bucket(&gate_key(user_id, &experiment.name));
    (bucket as f64) < experiment.audience.percentage
}

pub fn evaluate_segment(segment: &Segment, user: &UserProfile) -> Result<bool, SegmentError> {
    let actual = resolve_field(segment, user)?;
    compare(&actual, segment.operator, &segment.value)
}

fn resolve_field(segment: &Segment, user: &UserProfile) -> Result<Value, SegmentError> {
    Ok(match segment.segment_type {
        SegmentType::UserType => Value::String(user.role.clone()),
        SegmentType::Subscription => Value::String(user.subscription.plan.clone()),
        SegmentType::Location => user
            .location
            .as_ref()
            .map(|l| Value::String(l.clone()))
            .unwrap_or(Value::Null),
        SegmentType::Usage => {
            let counter = segment.field.as_deref().unwrap_or("listings");
            let count = user
                .usage
                .counter(counter)
                .ok_or_else(|| SegmentError::UnknownUsageCounter(counter.to_string()))?;
            Value::from(count)
        }
        SegmentType::Custom => {
            let key = segment
                .field
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or(SegmentError::MissingField)?;
            user.attributes.get(key).cloned().unwrap_or(Value::Null)
        }
    })
}

pub fn compare(actual: &Value, operator: SegmentOperator, expected: &Value) -> Result<bool, SegmentError> {
    match operator {
        SegmentOperator::Equals => Ok(values_equal(actual, expected)),
        SegmentOperator::NotEquals => Ok(!values_equal(actual, expected)),
        SegmentOperator::Contains => Ok(contains(actual, expected)),
        SegmentOperator::NotContains => Ok(!contains(actual, expected)),
        SegmentOperator::GreaterThan | SegmentOperator::LessThan => {
            let threshold = expected
                .as_f64()
                .ok_or(SegmentError::NonNumericOperand(operator))?;
            let Some(value) = as_number(actual) else {
                return Ok(false);
            };
            Ok(match operator {
                SegmentOperator::GreaterThan => value > threshold,
                _ => value < threshold,
            })
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Substring for strings, membership for arrays on either side.
fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a.contains(e.as_str()),
        (Value::Array(items), e) => items.iter().any(|item| values_equal(item, e)),
        (a, Value::Array(items)) if !a.is_null() => items.iter().any(|item| values_equal(a, item)),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
