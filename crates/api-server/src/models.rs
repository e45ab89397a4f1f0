//! Request and response bodies for the REST API.

use experiment_core::types::ExperimentStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: ExperimentStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WinnerRequest {
    pub variant: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InsightsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResponse {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub eligible: bool,
}

/// `variant` is absent when the experiment is not accepting the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResponse {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventResponse {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub recorded: bool,
}
