use thiserror::Error;
use uuid::Uuid;

use crate::models::RecordStatus;

/// Errors surfaced by the store, the cache, and the request coordinator.
///
/// Payloads are owned strings so a single outcome can be handed to every
/// request coalesced onto the same in-flight prediction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QclassError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record {0} not found")]
    NotFound(Uuid),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: RecordStatus, to: RecordStatus },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Prediction failed: {0}")]
    PredictionFailed(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl QclassError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QclassError::Validation(_) => "validation_error",
            QclassError::NotFound(_) => "not_found",
            QclassError::InvalidTransition { .. } => "invalid_transition",
            QclassError::Storage(_) => "storage_error",
            QclassError::PredictionFailed(_) => "prediction_failed",
            QclassError::Cache(_) => "cache_error",
        }
    }
}

impl From<sqlx::Error> for QclassError {
    fn from(e: sqlx::Error) -> Self {
        QclassError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QclassError>;
