//! Shared experiment domain: types, errors, configuration and definition
//! validation.

pub mod config;
pub mod error;
pub mod types;
pub mod validation;

pub use config::AppConfig;
pub use error::{ExperimentError, ExperimentResult};
pub use validation::validate_experiment;
