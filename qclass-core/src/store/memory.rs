//! In-process record store — one map behind one lock.
//!
//! Used by tests and by `database.backend = "memory"`. Contents are lost on
//! restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{QclassError, Result};
use crate::models::{normalize_query, InteractionRecord, RecordDraft, RecordUpdate};

#[derive(Default)]
struct Table {
    rows: HashMap<Uuid, (u64, InteractionRecord)>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    table: RwLock<Table>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every record, oldest first.
    pub async fn all(&self) -> Vec<InteractionRecord> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table.rows.values().cloned().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, r)| r).collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, draft: RecordDraft) -> Result<Uuid> {
        draft.validate()?;
        let record = draft.into_record(Utc::now());
        let id = record.record_id;

        let mut table = self.table.write().await;
        if table.rows.contains_key(&id) {
            return Err(QclassError::Validation(format!("record {id} already exists")));
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(id, (seq, record));
        Ok(id)
    }

    async fn update(&self, record_id: Uuid, update: RecordUpdate) -> Result<InteractionRecord> {
        let mut table = self.table.write().await;
        let (_, record) = table
            .rows
            .get_mut(&record_id)
            .ok_or(QclassError::NotFound(record_id))?;

        if update.check_transition(record.status)? {
            update.apply(record, Utc::now());
        }
        Ok(record.clone())
    }

    async fn get_by_id(&self, record_id: Uuid) -> Result<InteractionRecord> {
        self.table
            .read()
            .await
            .rows
            .get(&record_id)
            .map(|(_, r)| r.clone())
            .ok_or(QclassError::NotFound(record_id))
    }

    async fn delete(&self, record_id: Uuid) -> Result<()> {
        self.table
            .write()
            .await
            .rows
            .remove(&record_id)
            .map(|_| ())
            .ok_or(QclassError::NotFound(record_id))
    }

    async fn find_by_query(&self, query: &str) -> Result<Vec<InteractionRecord>> {
        let key = normalize_query(query);
        let table = self.table.read().await;
        let mut matches: Vec<_> = table
            .rows
            .values()
            .filter(|(_, r)| r.query_key == key)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matches.into_iter().map(|(_, r)| r).collect())
    }

    async fn health(&self) -> Result<String> {
        Ok(format!("memory ({} records)", self.len().await))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
