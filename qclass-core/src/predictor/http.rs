//! HTTP predictor — calls a remote model server
//!
//! Request:  `POST {url}` with `{"user_query": "..."}`
//! Response: `{"prediction_label": "...", "prediction_probability": 0.92}`
//!
//! Transport errors, 429 and 5xx are retried with jittered exponential backoff;
//! other failures return immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{PredictionError, Predictor};
use crate::config::PredictorConfig;
use crate::models::Prediction;

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    user_query: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    prediction_label: String,
    prediction_probability: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "detail")]
    message: Option<String>,
}

/// Remote model-server client.
#[derive(Debug, Clone)]
pub struct HttpPredictor {
    client: Client,
    config: PredictorConfig,
}

impl HttpPredictor {
    pub fn new(config: PredictorConfig) -> Result<Self, PredictionError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    /// Create a client pointed at a different endpoint (for testing / integration)
    pub fn with_url(config: PredictorConfig, url: String) -> Result<Self, PredictionError> {
        Self::new(PredictorConfig { url, ..config })
    }

    async fn predict_once(&self, text: &str) -> Result<Prediction, PredictionError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&PredictRequest { user_query: text })
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or(body);

            tracing::error!(code = status.as_u16(), message = %message, "Model server error");

            return Err(PredictionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: PredictResponse = response.json().await?;
        let prediction = Prediction::new(body.prediction_label, body.prediction_probability);
        prediction
            .validate()
            .map_err(|e| PredictionError::InvalidOutput(e.to_string()))?;
        Ok(prediction)
    }
}

fn is_retryable(err: &PredictionError) -> bool {
    match err {
        PredictionError::Http(_) => true,
        PredictionError::Api { code, .. } => *code == 429 || *code >= 500,
        _ => false,
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, text: &str) -> Result<Prediction, PredictionError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(retry_strategy, || self.predict_once(text), is_retryable).await;

        match result {
            Ok(p) => Ok(p),
            Err(e) if is_retryable(&e) => {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All prediction retry attempts failed"
                );
                Err(PredictionError::RetryExhausted {
                    attempts: self.config.max_retries,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
