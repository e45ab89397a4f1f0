use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Experiment ─────────────────────────────────────────────────────────

/// An experiment definition. Participants are stored separately, keyed by
/// `(experiment id, user id)`; the definition only carries aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub audience: Audience,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub schedule: Schedule,
    #[serde(default)]
    pub results: ExperimentResults,
    #[serde(default)]
    pub feature_flag: Option<FeatureFlag>,
    pub metadata: ExperimentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// The baseline for improvement: the flagged control, else the first variant.
    pub fn control_variant(&self) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.is_control)
            .or_else(|| self.variants.first())
    }

    /// The goal improvement is measured on: first primary goal, else the first goal.
    pub fn primary_goal(&self) -> Option<&Goal> {
        self.goals
            .iter()
            .find(|g| g.importance == GoalImportance::Primary)
            .or_else(|| self.goals.first())
    }

    /// Running and inside the schedule window at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ExperimentStatus::Running && self.schedule.contains(now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    #[serde(alias = "a/b_test")]
    AbTest,
    Multivariate,
    FeatureFlag,
    Rollout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    /// Whether an explicit status write from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Draft, Running)
                | (Draft, Archived)
                | (Running, Paused)
                | (Running, Completed)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Archived)
                | (Completed, Archived)
        )
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

// ─── Targeting ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Share of otherwise-matching users to include, 0–100.
    #[serde(default = "default_percentage")]
    pub percentage: f64,
}

fn default_percentage() -> f64 {
    100.0
}

impl Default for Audience {
    fn default() -> Self {
        Self {
            segments: Vec::new(),
            percentage: default_percentage(),
        }
    }
}

/// A single targeting predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(rename = "type")]
    pub segment_type: SegmentType,
    /// Usage counter (`usage`) or attribute name (`custom`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub value: serde_json::Value,
    #[serde(default)]
    pub operator: SegmentOperator,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    UserType,
    Subscription,
    Usage,
    Location,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
}

impl SegmentOperator {
    pub fn is_numeric(self) -> bool {
        matches!(self, SegmentOperator::GreaterThan | SegmentOperator::LessThan)
    }
}

// ─── Variants & goals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Relative weight; weights need not sum to 100.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub is_control: bool,
}

fn default_weight() -> f64 {
    50.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub name: String,
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    /// Event type counted by this goal; defaults to the goal name.
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub target_value: Option<f64>,
    #[serde(default)]
    pub importance: GoalImportance,
}

impl Goal {
    pub fn event_type(&self) -> &str {
        self.metric.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Conversion,
    Revenue,
    Engagement,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GoalImportance {
    #[default]
    Primary,
    Secondary,
}

// ─── Schedule ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Schedule {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_date
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| now > end)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.has_started(now) && !self.has_ended(now)
    }
}

// ─── Results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResults {
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
    #[serde(default)]
    pub winner: Option<Winner>,
}

/// Aggregate of one goal for one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub name: String,
    pub variant: String,
    pub value: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub sample_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub variant: String,
    pub confidence: Option<f64>,
    pub improvement: Option<f64>,
    pub declared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub assigned_variant: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<ParticipantEvent>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, variant: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            assigned_variant: variant.into(),
            first_seen: now,
            last_seen: now,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ─── Feature flags ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub default_value: serde_json::Value,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
}

/// Override applied when every segment in `condition` matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub condition: Vec<Segment>,
    pub value: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

// ─── Metadata ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentMetadata {
    pub creator: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ─── Requests ───────────────────────────────────────────────────────────

/// Definition submitted when creating an experiment. New experiments always
/// start in `draft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    #[serde(default)]
    pub audience: Audience,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub schedule: Schedule,
    #[serde(default)]
    pub feature_flag: Option<FeatureFlag>,
    pub metadata: ExperimentMetadata,
}

/// Partial definition update. Absent fields are left unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentUpdate {
    pub description: Option<String>,
    pub audience: Option<Audience>,
    pub variants: Option<Vec<Variant>>,
    pub goals: Option<Vec<Goal>>,
    pub schedule: Option<Schedule>,
    /// Absent: unchanged. `null`: flag block removed.
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub feature_flag: Option<Option<FeatureFlag>>,
    pub metadata: Option<ExperimentMetadata>,
}

/// Maps a present field to `Some`, keeping an explicit `null` as `Some(None)`.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ─── Users ──────────────────────────────────────────────────────────────

/// Read-only view of a user, as served by the user directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub subscription: Subscription,
    #[serde(default)]
    pub usage: UsageStats,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn default_role() -> String {
    "user".to_string()
}

impl UserProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: default_role(),
            subscription: Subscription::default(),
            usage: UsageStats::default(),
            location: None,
            attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub plan: String,
    pub status: String,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            plan: "free".to_string(),
            status: "inactive".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub listings: u64,
    #[serde(default)]
    pub api_calls: u64,
    #[serde(default)]
    pub storage: u64,
}

impl UsageStats {
    /// Look up a counter by the name used in `usage` segments.
    pub fn counter(&self, name: &str) -> Option<u64> {
        match name {
            "listings" => Some(self.listings),
            "api_calls" | "apiCalls" => Some(self.api_calls),
            "storage" => Some(self.storage),
            _ => None,
        }
    }
}
