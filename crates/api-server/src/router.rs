//! Experiment API router. Everything except health checks lives under /api/v1.

use crate::handlers::{self, ApiState};
use axum::routing::{get, post, put};
use axum::Router;

/// Build the REST router over `state`.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        // Experiments
        .route("/api/v1/experiments", get(handlers::list_experiments).post(handlers::create_experiment))
        .route("/api/v1/experiments/insights", get(handlers::insights))
        .route("/api/v1/experiments/:id", get(handlers::get_experiment).put(handlers::update_experiment))
        .route("/api/v1/experiments/:id/status", post(handlers::set_status))
        .route("/api/v1/experiments/:id/results", get(handlers::get_results))
        .route("/api/v1/experiments/:id/winner", post(handlers::declare_winner))
        // Participation
        .route("/api/v1/experiments/:id/users/:user_id/eligibility", get(handlers::check_eligibility))
        .route("/api/v1/experiments/:id/users/:user_id/assignment", post(handlers::assign_variant))
        .route("/api/v1/experiments/:id/users/:user_id/enrollment", post(handlers::enroll))
        .route("/api/v1/experiments/:id/users/:user_id/events", post(handlers::track_event))
        // Flags & users
        .route("/api/v1/flags/:key/users/:user_id", get(handlers::evaluate_flag))
        .route("/api/v1/users/:user_id", put(handlers::upsert_user))
        .route("/api/v1/users/:user_id/experiments", get(handlers::user_experiments))
        // Operational endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness))
        .route("/live", get(handlers::liveness))
        .with_state(state)
}
