//! PostgreSQL record store (sqlx)
//!
//! Updates run in a transaction that row-locks the target with
//! `SELECT ... FOR UPDATE`, so the transition check and the write commit together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{QclassError, Result};
use crate::models::{normalize_query, InteractionRecord, RecordDraft, RecordUpdate};

const COLUMNS: &str = "record_id, session_id, query_text, query_key, status, label, probability, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct RecordRow {
    record_id: Uuid,
    session_id: Uuid,
    query_text: String,
    query_key: String,
    status: String,
    label: Option<String>,
    probability: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for InteractionRecord {
    type Error = QclassError;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(InteractionRecord {
            record_id: row.record_id,
            session_id: row.session_id,
            query_text: row.query_text,
            query_key: row.query_key,
            status: row.status.parse()?,
            label: row.label,
            probability: row.probability,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, draft: RecordDraft) -> Result<Uuid> {
        draft.validate()?;
        let record = draft.into_record(Utc::now());

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO interaction_records
                (record_id, session_id, query_text, query_key, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (record_id) DO NOTHING
            RETURNING record_id
            "#,
        )
        .bind(record.record_id)
        .bind(record.session_id)
        .bind(&record.query_text)
        .bind(&record.query_key)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some((id,)) => {
                tracing::debug!(record_id = %id, "Inserted pending record");
                Ok(id)
            }
            None => Err(QclassError::Validation(format!(
                "record {} already exists",
                record.record_id
            ))),
        }
    }

    async fn update(&self, record_id: Uuid, update: RecordUpdate) -> Result<InteractionRecord> {
        let mut tx = self.pool.begin().await?;

        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM interaction_records WHERE record_id = $1 FOR UPDATE"
        ))
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current: InteractionRecord = row.ok_or(QclassError::NotFound(record_id))?.try_into()?;

        // Dropping `tx` on an early return rolls back and releases the row lock.
        if !update.check_transition(current.status)? {
            tx.commit().await?;
            return Ok(current);
        }

        let row: RecordRow = sqlx::query_as(&format!(
            r#"
            UPDATE interaction_records
            SET status = $2, label = $3, probability = $4, updated_at = now()
            WHERE record_id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(record_id)
        .bind(update.status.as_str())
        .bind(&update.label)
        .bind(update.probability)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_by_id(&self, record_id: Uuid) -> Result<InteractionRecord> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM interaction_records WHERE record_id = $1"
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(QclassError::NotFound(record_id))?.try_into()
    }

    async fn delete(&self, record_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM interaction_records WHERE record_id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QclassError::NotFound(record_id));
        }
        Ok(())
    }

    async fn find_by_query(&self, query: &str) -> Result<Vec<InteractionRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM interaction_records WHERE query_key = $1 ORDER BY created_at DESC"
        ))
        .bind(normalize_query(query))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InteractionRecord::try_from).collect()
    }

    async fn health(&self) -> Result<String> {
        Ok(crate::db::health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
