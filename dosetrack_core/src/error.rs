//! Error types for the dosetrack_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for dosetrack_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity lookup failure (patient, sale, vial, cash-flow entry)
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Stock depletion could not be covered by the available lots
    #[error("Insufficient stock: short {shortfall_mg} mg")]
    InsufficientStock { shortfall_mg: f64 },

    /// Points redemption exceeds the patient's balance
    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: i64, available: i64 },

    /// Malformed input (dates, amounts, quantities)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dataset state error
    #[error("State error: {0}")]
    State(String),
}
