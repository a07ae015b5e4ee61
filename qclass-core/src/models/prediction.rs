use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QclassError, Result};

/// A label and its confidence, as produced by a predictor and held in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f64,
}

impl Prediction {
    pub fn new(label: impl Into<String>, probability: f64) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }

    /// Reject empty labels and probabilities outside [0, 1] (NaN included).
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(QclassError::Validation("label must not be empty".to_string()));
        }
        validate_probability(self.probability)
    }
}

pub(crate) fn validate_probability(p: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(QclassError::Validation(format!(
            "probability must be within [0, 1], got {p}"
        )));
    }
    Ok(())
}

/// Where a prediction result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    /// Served from the result cache; no record was written.
    Cache,
    /// This request ran the predictor and completed its own record.
    Predicted,
    /// Another in-flight request for the same key ran the predictor.
    Coalesced,
}

/// Result of a predict call as returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    /// Record that holds this result. `None` for cache hits.
    pub record_id: Option<Uuid>,
    pub session_id: Uuid,
    pub query_text: String,
    pub label: String,
    pub probability: f64,
    pub source: PredictionSource,
}

impl PredictionOutcome {
    pub fn prediction(&self) -> Prediction {
        Prediction::new(self.label.clone(), self.probability)
    }
}
