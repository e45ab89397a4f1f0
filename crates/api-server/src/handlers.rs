//! Axum REST handlers for the experiment API.
//!
//! The engine is synchronous; every call runs on the blocking pool under
//! the configured request timeout.

use crate::models::*;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use experiment_core::types::{Experiment, ExperimentUpdate, NewExperiment, UserProfile, Winner};
use experiment_core::{ExperimentError, ExperimentResult};
use experiment_engine::{
    CommitFence, ExperimentEngine, ExperimentReport, FlagEvaluation, InMemoryUserDirectory, TypeInsight,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

/// Shared state for REST handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ExperimentEngine>,
    /// Development user directory backing `PUT /api/v1/users/:user_id`.
    pub users: Arc<InMemoryUserDirectory>,
    pub node_id: String,
    pub start_time: Instant,
    pub request_timeout: Duration,
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub ExperimentError);

impl From<ExperimentError> for ApiError {
    fn from(err: ExperimentError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ExperimentError::Config(_) => StatusCode::BAD_REQUEST,
            ExperimentError::NotFound { .. } => StatusCode::NOT_FOUND,
            ExperimentError::Conflict(_) | ExperimentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ExperimentError::StorageUnavailable(_) | ExperimentError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ExperimentError::Serialization(_) | ExperimentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            ExperimentError::Config(_) => "invalid_request",
            ExperimentError::NotFound { .. } => "not_found",
            ExperimentError::Conflict(_) => "conflict",
            ExperimentError::InvalidTransition { .. } => "invalid_transition",
            ExperimentError::StorageUnavailable(_) => "storage_unavailable",
            ExperimentError::Timeout(_) => "timeout",
            ExperimentError::Serialization(_) | ExperimentError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Experiment request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            if status == StatusCode::SERVICE_UNAVAILABLE {
                warn!(error = %self.0, "Experiment request unavailable");
                metrics::counter!("api.unavailable").increment(1);
            }
            self.0.to_string()
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Run `op` on the blocking pool under the request timeout.
///
/// The call carries a [`CommitFence`]. A timeout before the engine starts
/// writing abandons the call, which then never writes, and is reported as a
/// retryable `Timeout`. A timeout after writing started waits one more
/// timeout period for the real outcome; if that also lapses the outcome is
/// unknown and reported as a non-retryable internal error.
async fn run_engine<T, F>(state: &ApiState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&ExperimentEngine) -> ExperimentResult<T> + Send + 'static,
    T: Send + 'static,
{
    let fence = Arc::new(CommitFence::new());
    let engine = state.engine.with_fence(fence.clone());
    let mut task = tokio::task::spawn_blocking(move || op(&engine));

    let joined = match tokio::time::timeout(state.request_timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) if fence.abandon() => {
            metrics::counter!("api.timeouts").increment(1);
            return Err(ExperimentError::Timeout(format!(
                "engine call exceeded {}ms",
                state.request_timeout.as_millis()
            ))
            .into());
        }
        Err(_) => match tokio::time::timeout(state.request_timeout, task).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(ExperimentError::Internal(anyhow::anyhow!(
                    "engine call still committing after {}ms, outcome unknown",
                    2 * state.request_timeout.as_millis()
                ))
                .into())
            }
        },
    };

    match joined {
        Ok(result) => result.map_err(ApiError::from),
        Err(join) => Err(ExperimentError::Internal(anyhow::anyhow!("engine task failed: {join}")).into()),
    }
}

// ─── Experiments ───────────────────────────────────────────────────────────

pub async fn list_experiments(State(state): State<ApiState>) -> Result<Json<Vec<Experiment>>, ApiError> {
    run_engine(&state, |engine| engine.list_experiments()).await.map(Json)
}

pub async fn get_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Experiment>, ApiError> {
    run_engine(&state, move |engine| engine.get_experiment(id)).await.map(Json)
}

pub async fn create_experiment(
    State(state): State<ApiState>,
    Json(req): Json<NewExperiment>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    let experiment = run_engine(&state, move |engine| engine.create_experiment(req)).await?;
    Ok((StatusCode::CREATED, Json(experiment)))
}

pub async fn update_experiment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExperimentUpdate>,
) -> Result<Json<Experiment>, ApiError> {
    run_engine(&state, move |engine| engine.update_experiment(id, req)).await.map(Json)
}

pub async fn set_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Experiment>, ApiError> {
    run_engine(&state, move |engine| engine.set_status(id, req.status)).await.map(Json)
}

// ─── Participation ─────────────────────────────────────────────────────────

pub async fn check_eligibility(
    State(state): State<ApiState>,
    Path((id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<EligibilityResponse>, ApiError> {
    let uid = user_id.clone();
    let eligible = run_engine(&state, move |engine| engine.is_user_in_experiment(id, &uid)).await?;
    Ok(Json(EligibilityResponse {
        experiment_id: id,
        user_id,
        eligible,
    }))
}

/// POST assignment: sticky variant without audience filtering.
pub async fn assign_variant(
    State(state): State<ApiState>,
    Path((id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    let uid = user_id.clone();
    let variant = run_engine(&state, move |engine| engine.assign_variant(id, &uid)).await?;
    Ok(Json(AssignmentResponse {
        experiment_id: id,
        user_id,
        variant,
    }))
}

/// POST enrollment: eligibility check, then assignment.
pub async fn enroll(
    State(state): State<ApiState>,
    Path((id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    let uid = user_id.clone();
    let variant = run_engine(&state, move |engine| engine.enroll(id, &uid)).await?;
    Ok(Json(AssignmentResponse {
        experiment_id: id,
        user_id,
        variant,
    }))
}

pub async fn track_event(
    State(state): State<ApiState>,
    Path((id, user_id)): Path<(Uuid, String)>,
    Json(req): Json<TrackEventRequest>,
) -> Result<Json<TrackEventResponse>, ApiError> {
    let uid = user_id.clone();
    let recorded = run_engine(&state, move |engine| {
        engine.track_event(id, &uid, &req.event_type, req.data)
    })
    .await?;
    Ok(Json(TrackEventResponse {
        experiment_id: id,
        user_id,
        recorded,
    }))
}

// ─── Results ───────────────────────────────────────────────────────────────

pub async fn get_results(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExperimentReport>, ApiError> {
    run_engine(&state, move |engine| engine.get_results(id)).await.map(Json)
}

pub async fn declare_winner(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<WinnerRequest>,
) -> Result<Json<Winner>, ApiError> {
    run_engine(&state, move |engine| engine.declare_winner(id, &req.variant)).await.map(Json)
}

pub async fn insights(
    State(state): State<ApiState>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<Vec<TypeInsight>>, ApiError> {
    if matches!(query.days, Some(d) if d <= 0) {
        return Err(ExperimentError::Config("days must be positive".to_string()).into());
    }
    run_engine(&state, move |engine| engine.insights(query.days)).await.map(Json)
}

// ─── Users & flags ─────────────────────────────────────────────────────────

pub async fn user_experiments(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Experiment>>, ApiError> {
    run_engine(&state, move |engine| engine.active_experiments_for_user(&user_id)).await.map(Json)
}

pub async fn evaluate_flag(
    State(state): State<ApiState>,
    Path((key, user_id)): Path<(String, String)>,
) -> Result<Json<FlagEvaluation>, ApiError> {
    run_engine(&state, move |engine| engine.evaluate_flag(&key, &user_id)).await.map(Json)
}

/// PUT a profile into the development user directory. The path id wins
/// over any id in the body.
pub async fn upsert_user(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(mut profile): Json<UserProfile>,
) -> Json<UserProfile> {
    profile.id = user_id;
    state.users.upsert(profile.clone());
    Json(profile)
}

// ─── Operational ───────────────────────────────────────────────────────────

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: the store answers a listing.
pub async fn readiness(State(state): State<ApiState>) -> StatusCode {
    match run_engine(&state, |engine| engine.list_experiments().map(|_| ())).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
