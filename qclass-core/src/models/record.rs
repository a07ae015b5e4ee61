use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::prediction::{validate_probability, Prediction};
use super::query::normalize_query;
use crate::error::{QclassError, Result};

/// Lifecycle state of an interaction record. Moves once from `Pending` to
/// `Completed` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = QclassError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "completed" => Ok(RecordStatus::Completed),
            other => Err(QclassError::Storage(format!("unknown record status '{other}'"))),
        }
    }
}

/// A persisted query/prediction interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub query_text: String,
    pub query_key: String,
    pub status: RecordStatus,
    pub label: Option<String>,
    pub probability: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InteractionRecord {
    /// The completed prediction, if this record has one.
    pub fn prediction(&self) -> Option<Prediction> {
        match (self.status, &self.label, self.probability) {
            (RecordStatus::Completed, Some(label), Some(p)) => Some(Prediction::new(label.clone(), p)),
            _ => None,
        }
    }

    /// `Completed` iff both label and probability are present.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            RecordStatus::Completed => self.label.is_some() && self.probability.is_some(),
            RecordStatus::Pending => self.label.is_none() && self.probability.is_none(),
        }
    }
}

/// Input to `RecordStore::create`.
///
/// Only a pending draft with no label or probability is accepted; ids are
/// generated by the store when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub record_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub query_text: String,
    pub status: RecordStatus,
    pub label: Option<String>,
    pub probability: Option<f64>,
}

impl RecordDraft {
    pub fn pending(query_text: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self {
            record_id: None,
            session_id,
            query_text: query_text.into(),
            status: RecordStatus::Pending,
            label: None,
            probability: None,
        }
    }

    pub fn with_record_id(mut self, record_id: Uuid) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.status != RecordStatus::Pending {
            return Err(QclassError::Validation(format!(
                "new records must be pending, got {}",
                self.status
            )));
        }
        if self.label.is_some() || self.probability.is_some() {
            return Err(QclassError::Validation(
                "pending records must not carry a label or probability".to_string(),
            ));
        }
        if normalize_query(&self.query_text).is_empty() {
            return Err(QclassError::Validation("query text must not be empty".to_string()));
        }
        Ok(())
    }

    /// Materialize the draft into a full record, filling generated fields.
    pub fn into_record(self, now: DateTime<Utc>) -> InteractionRecord {
        let query_key = normalize_query(&self.query_text);
        InteractionRecord {
            record_id: self.record_id.unwrap_or_else(Uuid::new_v4),
            session_id: self.session_id.unwrap_or_else(Uuid::new_v4),
            query_text: self.query_text,
            query_key,
            status: self.status,
            label: self.label,
            probability: self.probability,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The closed set of fields `RecordStore::update` may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub status: RecordStatus,
    pub label: Option<String>,
    pub probability: Option<f64>,
}

impl RecordUpdate {
    pub fn complete(prediction: &Prediction) -> Self {
        Self {
            status: RecordStatus::Completed,
            label: Some(prediction.label.clone()),
            probability: Some(prediction.probability),
        }
    }

    /// Check this update against a record's current status.
    ///
    /// Returns `Ok(false)` for a pending-to-pending no-op, `Ok(true)` when the
    /// update must be written.
    pub fn check_transition(&self, current: RecordStatus) -> Result<bool> {
        match (current, self.status) {
            (RecordStatus::Completed, to) => Err(QclassError::InvalidTransition {
                from: RecordStatus::Completed,
                to,
            }),
            (RecordStatus::Pending, RecordStatus::Pending) => {
                if self.label.is_some() || self.probability.is_some() {
                    return Err(QclassError::Validation(
                        "pending records must not carry a label or probability".to_string(),
                    ));
                }
                Ok(false)
            }
            (RecordStatus::Pending, RecordStatus::Completed) => {
                let (label, probability) = match (&self.label, self.probability) {
                    (Some(l), Some(p)) => (l, p),
                    _ => {
                        return Err(QclassError::Validation(
                            "completing a record requires both label and probability".to_string(),
                        ))
                    }
                };
                if label.trim().is_empty() {
                    return Err(QclassError::Validation("label must not be empty".to_string()));
                }
                validate_probability(probability)?;
                Ok(true)
            }
        }
    }

    /// Apply an already-checked update to a record in place.
    pub fn apply(&self, record: &mut InteractionRecord, now: DateTime<Utc>) {
        record.status = self.status;
        record.label = self.label.clone();
        record.probability = self.probability;
        record.updated_at = now;
    }
}
