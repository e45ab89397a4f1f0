#![warn(clippy::unwrap_used)]

pub mod handlers;
pub mod models;
pub mod router;
pub mod server;

pub use handlers::{ApiError, ApiState};
pub use router::api_router;
pub use server::ApiServer;
