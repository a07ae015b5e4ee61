pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;
pub mod predictor;
pub mod store;

pub use cache::{CacheStats, ResultCache};
pub use config::QclassConfig;
pub use coordinator::{Phase, RequestCoordinator};
pub use error::{QclassError, Result};
pub use models::{
    InteractionRecord, Prediction, PredictionOutcome, PredictionSource, RecordStatus,
};
pub use predictor::{
    create_predictor, HttpPredictor, OnnxConfig, OnnxPredictor, PredictionError, Predictor,
    StaticPredictor,
};
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore};
