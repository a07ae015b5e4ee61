pub mod prediction;
pub mod query;
pub mod record;

pub use prediction::{Prediction, PredictionSource, PredictionOutcome};
pub use query::normalize_query;
pub use record::{InteractionRecord, RecordDraft, RecordStatus, RecordUpdate};
