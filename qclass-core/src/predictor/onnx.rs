//! ONNX predictor — local BERT binary question classifier
//!
//! Uses the `ort` crate for ONNX Runtime and `tokenizers` for WordPiece
//! tokenization. The model emits one logit; its sigmoid is the probability of
//! the second label.

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokenizers::TruncationParams;

use super::{PredictionError, Predictor};
use crate::config::PredictorConfig;
use crate::models::Prediction;

/// ONNX backend configuration
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_length: usize,
    pub threshold: f64,
    /// `[negative, positive]`
    pub labels: [String; 2],
}

impl From<&PredictorConfig> for OnnxConfig {
    fn from(config: &PredictorConfig) -> Self {
        let (model_path, tokenizer_path) = resolve_onnx_paths(&config.model_path);
        let negative = config.labels.first().cloned().unwrap_or_else(|| "SIMPLE".to_string());
        let positive = config.labels.get(1).cloned().unwrap_or_else(|| "COMPLEX".to_string());
        Self {
            model_path,
            tokenizer_path,
            max_length: config.max_length,
            threshold: config.threshold,
            labels: [negative, positive],
        }
    }
}

/// Local ONNX question classifier.
pub struct OnnxPredictor {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    threshold: f64,
    labels: [String; 2],
}

impl std::fmt::Debug for OnnxPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxPredictor")
            .field("threshold", &self.threshold)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

impl OnnxPredictor {
    /// Load the model and tokenizer. Returns `ModelNotFound` if either file is missing.
    pub fn new(config: OnnxConfig) -> Result<Self, PredictionError> {
        if !config.model_path.exists() {
            return Err(PredictionError::ModelNotFound {
                path: config.model_path.display().to_string(),
            });
        }
        if !config.tokenizer_path.exists() {
            return Err(PredictionError::ModelNotFound {
                path: config.tokenizer_path.display().to_string(),
            });
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(&config.model_path))
            .map_err(|e| PredictionError::OnnxInference(e.to_string()))?;

        let mut tokenizer = tokenizers::Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| PredictionError::Tokenizer(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_length,
                ..Default::default()
            }))
            .map_err(|e| PredictionError::Tokenizer(e.to_string()))?;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            threshold: config.threshold,
            labels: config.labels,
        })
    }
}

#[async_trait]
impl Predictor for OnnxPredictor {
    async fn predict(&self, text: &str) -> Result<Prediction, PredictionError> {
        // Inference is CPU-bound — run on the blocking thread pool.
        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let text = text.to_string();

        let logit = tokio::task::spawn_blocking(move || {
            let mut session_guard = session.lock().map_err(|e| {
                PredictionError::OnnxInference(format!("session lock poisoned: {e}"))
            })?;
            logit_sync(&mut session_guard, &tokenizer, &text)
        })
        .await
        .map_err(|e| PredictionError::OnnxInference(format!("spawn_blocking join error: {e}")))??;

        Ok(classify(logit, self.threshold, &self.labels))
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Map a raw logit to a label and a probability rounded to three decimals.
pub fn classify(logit: f32, threshold: f64, labels: &[String; 2]) -> Prediction {
    let probability = 1.0 / (1.0 + (-(logit as f64)).exp());
    let probability = (probability * 1000.0).round() / 1000.0;
    let label = if probability > threshold {
        &labels[1]
    } else {
        &labels[0]
    };
    Prediction::new(label.clone(), probability)
}

/// Run ONNX inference synchronously and return the single output logit.
fn logit_sync(
    session: &mut Session,
    tokenizer: &tokenizers::Tokenizer,
    text: &str,
) -> Result<f32, PredictionError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| PredictionError::Tokenizer(e.to_string()))?;

    let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
    let attention_mask: Vec<i64> = encoding
        .get_attention_mask()
        .iter()
        .map(|&m| m as i64)
        .collect();

    let shape = vec![1i64, input_ids.len() as i64];

    let input_ids_tensor = Tensor::from_array((shape.clone(), input_ids))
        .map_err(|e| PredictionError::OnnxInference(e.to_string()))?;
    let attention_mask_tensor = Tensor::from_array((shape, attention_mask))
        .map_err(|e| PredictionError::OnnxInference(e.to_string()))?;

    let inputs = ort::inputs! {
        "input_ids" => input_ids_tensor,
        "attention_mask" => attention_mask_tensor,
    };

    let outputs = session
        .run(inputs)
        .map_err(|e| PredictionError::OnnxInference(e.to_string()))?;

    // Expected shape: [1, 1] (or [1])
    let (_, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| PredictionError::OnnxInference(e.to_string()))?;

    data.first()
        .copied()
        .ok_or_else(|| PredictionError::InvalidOutput("model returned an empty tensor".to_string()))
}

/// Resolve the default model directory.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("qclass/models")
}

/// Resolve paths for the ONNX model and its tokenizer.
///
/// An empty `model_path` means the default location. `~` is expanded.
pub fn resolve_onnx_paths(model_path: &str) -> (PathBuf, PathBuf) {
    if model_path.is_empty() {
        let dir = default_model_dir();
        (
            dir.join("question-classifier.onnx"),
            dir.join("question-classifier-tokenizer.json"),
        )
    } else {
        let model = PathBuf::from(shellexpand::tilde(model_path).into_owned());
        let stem = model
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let tokenizer = model.with_file_name(format!("{stem}-tokenizer.json"));
        (model, tokenizer)
    }
}
