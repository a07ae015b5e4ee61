//! Wiring — builds the store, cache, predictor and coordinator from config

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use qclass_core::config::DatabaseConfig;
use qclass_core::{
    create_predictor, MemoryRecordStore, PgRecordStore, QclassConfig, RecordStore,
    RequestCoordinator, ResultCache,
};

/// Everything the IPC server, HTTP server and background tasks share.
#[derive(Clone)]
pub struct Services {
    pub coordinator: Arc<RequestCoordinator>,
    pub cache: Arc<ResultCache>,
    pub config: QclassConfig,
}

/// Open the record store selected by `[database] backend`.
///
/// Postgres schema is created idempotently before the store is returned.
pub async fn build_store(config: &DatabaseConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend.as_str() {
        "postgres" => {
            let pool = qclass_core::db::create_pool(config)
                .await
                .context("Failed to connect to database")?;
            qclass_core::db::migrate(&pool)
                .await
                .context("Failed to apply schema")?;
            Ok(Arc::new(PgRecordStore::new(pool)))
        }
        "memory" => {
            tracing::warn!("Using in-memory record store; records are lost on restart");
            Ok(Arc::new(MemoryRecordStore::new()))
        }
        other => bail!("Unknown database backend '{}'", other),
    }
}

pub async fn build_services(config: QclassConfig) -> Result<Services> {
    let store = build_store(&config.database).await?;
    build_services_with_store(config, store)
}

/// Same as [`build_services`] but with a caller-supplied store.
pub fn build_services_with_store(
    config: QclassConfig,
    store: Arc<dyn RecordStore>,
) -> Result<Services> {
    let cache = Arc::new(ResultCache::from_config(&config.cache));
    let predictor = create_predictor(&config.predictor).context("Failed to create predictor")?;

    tracing::info!(
        store = store.name(),
        predictor = predictor.name(),
        capacity = config.cache.capacity,
        ttl_seconds = config.cache.ttl_seconds,
        "Services ready"
    );

    let coordinator = Arc::new(RequestCoordinator::new(
        Arc::clone(&cache),
        store,
        Arc::from(predictor),
        config.predictor.timeout(),
    ));

    Ok(Services {
        coordinator,
        cache,
        config,
    })
}
