use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS interaction_records (
        record_id   UUID PRIMARY KEY,
        session_id  UUID NOT NULL,
        query_text  TEXT NOT NULL,
        query_key   TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'completed')),
        label       TEXT,
        probability DOUBLE PRECISION
                    CHECK (probability IS NULL OR (probability >= 0 AND probability <= 1)),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT completed_has_prediction CHECK (
            (status = 'completed' AND label IS NOT NULL AND probability IS NOT NULL)
            OR (status = 'pending' AND label IS NULL AND probability IS NULL)
        )
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_interaction_records_session ON interaction_records (session_id)",
    "CREATE INDEX IF NOT EXISTS idx_interaction_records_query_key ON interaction_records (query_key)",
];

/// Create the interaction table and its indexes if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema is up to date");
    Ok(())
}
