use async_trait::async_trait;

use super::{PredictionError, Predictor};
use crate::models::Prediction;

/// Answers every query with the same prediction.
#[derive(Debug, Clone)]
pub struct StaticPredictor {
    prediction: Prediction,
}

impl StaticPredictor {
    pub fn new(prediction: Prediction) -> Self {
        Self { prediction }
    }
}

#[async_trait]
impl Predictor for StaticPredictor {
    async fn predict(&self, _text: &str) -> Result<Prediction, PredictionError> {
        Ok(self.prediction.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
