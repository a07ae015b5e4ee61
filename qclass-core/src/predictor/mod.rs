//! Predictor backends — the classifier behind the request coordinator
//!
//! Provides a `Predictor` trait with implementations for:
//! - **HTTP** — a remote model server, with retry and backoff
//! - **ONNX** — a local BERT binary classifier via ONNX Runtime
//! - **Static** — a fixed answer, for smoke tests and demos

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PredictorConfig;
use crate::models::Prediction;

pub mod fixed;
pub mod http;
pub mod onnx;

pub use fixed::StaticPredictor;
pub use http::HttpPredictor;
pub use onnx::{OnnxConfig, OnnxPredictor};

/// Abstraction over classification backends.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Classify one query. May be slow; callers apply their own timeout.
    async fn predict(&self, text: &str) -> Result<Prediction, PredictionError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Prediction backend errors
#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model server error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid prediction: {0}")]
    InvalidOutput(String),

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },

    #[error("ONNX model not found at {path}")]
    ModelNotFound { path: String },

    #[error("ONNX inference error: {0}")]
    OnnxInference(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Unknown predictor backend '{0}'")]
    UnknownBackend(String),
}

/// Create the predictor selected by `[predictor] backend`.
pub fn create_predictor(config: &PredictorConfig) -> Result<Box<dyn Predictor>, PredictionError> {
    match config.backend.as_str() {
        "http" => Ok(Box::new(HttpPredictor::new(config.clone())?)),
        "onnx" => Ok(Box::new(OnnxPredictor::new(OnnxConfig::from(config))?)),
        "static" => Ok(Box::new(StaticPredictor::new(Prediction::new(
            config.labels.first().cloned().unwrap_or_else(|| "SIMPLE".to_string()),
            1.0,
        )))),
        other => Err(PredictionError::UnknownBackend(other.to_string())),
    }
}
