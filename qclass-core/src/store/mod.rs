//! Persistent store for interaction records
//!
//! `RecordStore` is the system of record. Every operation commits fully or
//! not at all; callers never hold locks across operations.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{InteractionRecord, RecordDraft, RecordUpdate};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a pending record. Fails with `Validation` for a non-pending draft
    /// or a `record_id` that already exists.
    async fn create(&self, draft: RecordDraft) -> Result<Uuid>;

    /// Apply a status transition. Fails with `NotFound`, `InvalidTransition`
    /// or `Validation`; a failed update leaves the record untouched.
    async fn update(&self, record_id: Uuid, update: RecordUpdate) -> Result<InteractionRecord>;

    async fn get_by_id(&self, record_id: Uuid) -> Result<InteractionRecord>;

    async fn delete(&self, record_id: Uuid) -> Result<()>;

    /// All records whose normalized query matches `query`, newest first.
    async fn find_by_query(&self, query: &str) -> Result<Vec<InteractionRecord>>;

    /// Backend description for health reporting.
    async fn health(&self) -> Result<String>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
