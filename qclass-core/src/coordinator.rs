//! Request coordinator — cache-or-predict with a two-phase persisted record
//!
//! For each query:
//! 1. Normalize and look the key up in the result cache (hit → return, no writes)
//! 2. On a miss, create a `Pending` record
//! 3. Call the predictor under a timeout
//! 4. Mark the record `Completed` with the label and probability
//! 5. Cache the prediction and return it
//!
//! A caller may name a pending record it created earlier; that record is
//! completed instead of writing a new one, including on a cache hit.
//!
//! Concurrent requests for one key coalesce onto a single in-flight
//! prediction: the first becomes the leader, later arrivals wait on its
//! outcome. The cache is written only after the record commits as
//! `Completed`, and always before the in-flight marker is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::{QclassError, Result};
use crate::models::{
    normalize_query, InteractionRecord, Prediction, PredictionOutcome, PredictionSource,
    RecordDraft, RecordStatus, RecordUpdate,
};
use crate::predictor::Predictor;
use crate::store::RecordStore;

/// Where a request is in the cache-or-predict lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Checking,
    CacheHit,
    Building,
    Predicting,
    PersistingCompleted,
    Caching,
    Done,
}

/// What a leader publishes to the requests waiting on it.
#[derive(Debug, Clone)]
struct Completed {
    record_id: Uuid,
    session_id: Uuid,
    prediction: Prediction,
}

type FlightResult = Result<Completed>;
type FlightSlot = watch::Receiver<Option<FlightResult>>;

struct Flight {
    id: u64,
    rx: FlightSlot,
}

enum Entry<'a> {
    Hit(Prediction),
    Lead(FlightGuard<'a>),
    Follow(FlightSlot),
}

/// Held by the leader of a key. Dropping it — after publishing or because the
/// leader was cancelled — removes the in-flight marker.
struct FlightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, Flight>>,
    key: String,
    id: u64,
    tx: watch::Sender<Option<FlightResult>>,
}

impl FlightGuard<'_> {
    fn publish(self, result: FlightResult) {
        self.tx.send_replace(Some(result));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = lock_inflight(self.inflight);
        if inflight.get(&self.key).is_some_and(|f| f.id == self.id) {
            inflight.remove(&self.key);
        }
    }
}

fn lock_inflight(m: &Mutex<HashMap<String, Flight>>) -> MutexGuard<'_, HashMap<String, Flight>> {
    // The map stays consistent even if a holder panicked.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct RequestCoordinator {
    cache: Arc<ResultCache>,
    store: Arc<dyn RecordStore>,
    predictor: Arc<dyn Predictor>,
    predict_timeout: Duration,
    inflight: Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
}

impl RequestCoordinator {
    pub fn new(
        cache: Arc<ResultCache>,
        store: Arc<dyn RecordStore>,
        predictor: Arc<dyn Predictor>,
        predict_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            predictor,
            predict_timeout,
            inflight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn predictor_name(&self) -> &str {
        self.predictor.name()
    }

    /// Number of keys with a prediction currently in flight.
    pub fn inflight_len(&self) -> usize {
        lock_inflight(&self.inflight).len()
    }

    /// Classify a query, serving from cache when possible.
    ///
    /// With `record_id` the outcome completes that existing pending record,
    /// typically one made by [`create`](Self::create), instead of writing a
    /// new one. The record must still be pending and hold the same query.
    pub async fn predict(
        &self,
        query_text: &str,
        session_id: Option<Uuid>,
        record_id: Option<Uuid>,
    ) -> Result<PredictionOutcome> {
        let key = normalize_query(query_text);
        if key.is_empty() {
            return Err(QclassError::Validation("query text must not be empty".to_string()));
        }
        let target = match record_id {
            Some(id) => Some(self.pending_target(id, &key, session_id).await?),
            None => None,
        };
        let session_id = target
            .as_ref()
            .map(|t| t.session_id)
            .or(session_id)
            .unwrap_or_else(Uuid::new_v4);

        let outcome = |record_id, session_id, prediction: Prediction, source| PredictionOutcome {
            record_id,
            session_id,
            query_text: query_text.to_string(),
            label: prediction.label,
            probability: prediction.probability,
            source,
        };

        loop {
            tracing::debug!(key = %key, phase = ?Phase::Checking, "Looking up result cache");
            let hit = match self.cache_get(&key) {
                Some(hit) => Some(hit),
                None => match self.enter(&key) {
                    Entry::Hit(hit) => Some(hit),
                    Entry::Lead(guard) => {
                        tracing::info!(key = %key, "Cache miss, running prediction");
                        let existing = target.as_ref().map(|t| t.record_id);
                        let result = self.build(&key, query_text, session_id, existing).await;
                        guard.publish(result.clone());
                        let done = result?;
                        return Ok(outcome(
                            Some(done.record_id),
                            done.session_id,
                            done.prediction,
                            PredictionSource::Predicted,
                        ));
                    }
                    Entry::Follow(mut rx) => {
                        tracing::debug!(key = %key, "Prediction already in flight, waiting");
                        let published = match rx.wait_for(|slot| slot.is_some()).await {
                            Ok(slot) => (*slot).clone(),
                            Err(_) => None,
                        };
                        let Some(result) = published else {
                            // Leader went away without an outcome; start over.
                            tracing::debug!(key = %key, "In-flight leader cancelled, retrying");
                            continue;
                        };
                        let done = result?;
                        return Ok(match &target {
                            Some(own) => {
                                self.adopt(own, &done.prediction).await?;
                                outcome(
                                    Some(own.record_id),
                                    own.session_id,
                                    done.prediction,
                                    PredictionSource::Coalesced,
                                )
                            }
                            None => outcome(
                                Some(done.record_id),
                                done.session_id,
                                done.prediction,
                                PredictionSource::Coalesced,
                            ),
                        });
                    }
                },
            };

            if let Some(hit) = hit {
                tracing::info!(key = %key, phase = ?Phase::CacheHit, "Cache hit");
                let record_id = match &target {
                    Some(own) => {
                        self.adopt(own, &hit).await?;
                        Some(own.record_id)
                    }
                    None => None,
                };
                return Ok(outcome(record_id, session_id, hit, PredictionSource::Cache));
            }
        }
    }

    /// Load the pending record a prediction should complete.
    async fn pending_target(
        &self,
        record_id: Uuid,
        key: &str,
        session_id: Option<Uuid>,
    ) -> Result<InteractionRecord> {
        let record = self.store.get_by_id(record_id).await?;
        if record.status != RecordStatus::Pending {
            return Err(QclassError::InvalidTransition {
                from: record.status,
                to: RecordStatus::Completed,
            });
        }
        if record.query_key != key {
            return Err(QclassError::Validation(format!(
                "record {record_id} holds a different query"
            )));
        }
        if session_id.is_some_and(|s| s != record.session_id) {
            return Err(QclassError::Validation(format!(
                "record {record_id} belongs to a different session"
            )));
        }
        Ok(record)
    }

    /// Complete the caller's own pending record with a prediction made elsewhere.
    async fn adopt(&self, record: &InteractionRecord, prediction: &Prediction) -> Result<()> {
        self.store
            .update(record.record_id, RecordUpdate::complete(prediction))
            .await
            .map_err(|e| match e {
                QclassError::InvalidTransition { .. } | QclassError::NotFound(_) => e,
                other => {
                    tracing::error!(record_id = %record.record_id, error = %other, "Failed to complete record");
                    storage_error(other)
                }
            })?;
        tracing::debug!(record_id = %record.record_id, "Pending record completed from shared result");
        Ok(())
    }

    /// Join an in-flight prediction for `key` or become its leader.
    ///
    /// The cache is re-checked under the in-flight lock: a leader writes the
    /// cache before releasing its marker, so a finished prediction is never
    /// repeated by a request that arrives just after it.
    fn enter(&self, key: &str) -> Entry<'_> {
        let mut inflight = lock_inflight(&self.inflight);

        if let Some(flight) = inflight.get(key) {
            return Entry::Follow(flight.rx.clone());
        }
        if let Some(hit) = self.cache_get(key) {
            return Entry::Hit(hit);
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), Flight { id, rx });

        Entry::Lead(FlightGuard {
            inflight: &self.inflight,
            key: key.to_string(),
            id,
            tx,
        })
    }

    async fn build(
        &self,
        key: &str,
        query_text: &str,
        session_id: Uuid,
        existing: Option<Uuid>,
    ) -> FlightResult {
        let record_id = match existing {
            Some(id) => id,
            None => self
                .store
                .create(RecordDraft::pending(query_text, Some(session_id)))
                .await
                .map_err(|e| match e {
                    QclassError::Validation(_) => e,
                    other => {
                        tracing::error!(key = %key, phase = ?Phase::Building, error = %other, "Failed to create pending record");
                        storage_error(other)
                    }
                })?,
        };
        tracing::debug!(key = %key, record_id = %record_id, phase = ?Phase::Building, "Pending record ready");

        tracing::debug!(key = %key, record_id = %record_id, phase = ?Phase::Predicting, predictor = self.predictor.name(), "Calling predictor");
        let prediction = match tokio::time::timeout(self.predict_timeout, self.predictor.predict(query_text)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                tracing::error!(record_id = %record_id, error = %e, "Prediction failed; record left pending");
                return Err(QclassError::PredictionFailed(e.to_string()));
            }
            Err(_) => {
                tracing::error!(record_id = %record_id, timeout = ?self.predict_timeout, "Prediction timed out; record left pending");
                return Err(QclassError::PredictionFailed(format!(
                    "predictor timed out after {:?}",
                    self.predict_timeout
                )));
            }
        };
        if let Err(e) = prediction.validate() {
            tracing::error!(record_id = %record_id, error = %e, "Predictor returned an invalid result; record left pending");
            return Err(QclassError::PredictionFailed(e.to_string()));
        }

        tracing::debug!(record_id = %record_id, phase = ?Phase::PersistingCompleted, "Completing record");
        self.store
            .update(record_id, RecordUpdate::complete(&prediction))
            .await
            .map_err(|e| {
                tracing::error!(record_id = %record_id, error = %e, "Failed to complete record; not caching");
                storage_error(e)
            })?;

        tracing::debug!(key = %key, phase = ?Phase::Caching, "Caching prediction");
        if let Err(e) = self.cache.put(key, prediction.clone()) {
            tracing::warn!(key = %key, error = %e, "Cache write failed (non-fatal)");
        }

        tracing::info!(
            record_id = %record_id,
            label = %prediction.label,
            probability = prediction.probability,
            phase = ?Phase::Done,
            "Prediction completed"
        );
        Ok(Completed {
            record_id,
            session_id,
            prediction,
        })
    }

    fn cache_get(&self, key: &str) -> Option<Prediction> {
        match self.cache.get(key) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Create a pending record without running a prediction.
    pub async fn create(
        &self,
        query_text: &str,
        session_id: Option<Uuid>,
    ) -> Result<InteractionRecord> {
        let record_id = self
            .store
            .create(RecordDraft::pending(query_text, session_id))
            .await?;
        tracing::info!(record_id = %record_id, "Created pending record");
        self.store.get_by_id(record_id).await
    }

    pub async fn get(&self, record_id: Uuid) -> Result<InteractionRecord> {
        self.store.get_by_id(record_id).await
    }

    /// Delete a record. A completed record also drops its cached result.
    pub async fn delete(&self, record_id: Uuid) -> Result<()> {
        let record = self.store.get_by_id(record_id).await?;
        self.store.delete(record_id).await?;
        tracing::info!(record_id = %record_id, "Record deleted");

        if record.status == RecordStatus::Completed {
            if let Err(e) = self.cache.remove(&record.query_key) {
                tracing::warn!(key = %record.query_key, error = %e, "Cache invalidation failed (non-fatal)");
            }
        }
        Ok(())
    }

    /// Every record stored for a query, newest first.
    pub async fn history(&self, query_text: &str) -> Result<Vec<InteractionRecord>> {
        if normalize_query(query_text).is_empty() {
            return Err(QclassError::Validation("query text must not be empty".to_string()));
        }
        self.store.find_by_query(query_text).await
    }
}

fn storage_error(e: QclassError) -> QclassError {
    match e {
        QclassError::Storage(_) => e,
        other => QclassError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::PredictionError;
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    /// Predictor that counts calls, optionally sleeps, and can be told to fail.
    struct CountingPredictor {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
        result: Prediction,
        entered: Notify,
    }

    impl CountingPredictor {
        fn new(result: Prediction) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
                result,
                entered: Notify::new(),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Predictor for CountingPredictor {
        async fn predict(&self, _text: &str) -> std::result::Result<Prediction, PredictionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PredictionError::OnnxInference("model exploded".to_string()));
            }
            Ok(self.result.clone())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    /// Memory store whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryRecordStore,
        fail_create: AtomicBool,
        fail_update: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn create(&self, draft: RecordDraft) -> Result<Uuid> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(QclassError::Storage("connection refused".to_string()));
            }
            self.inner.create(draft).await
        }

        async fn update(&self, record_id: Uuid, update: RecordUpdate) -> Result<InteractionRecord> {
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(QclassError::Storage("connection reset".to_string()));
            }
            self.inner.update(record_id, update).await
        }

        async fn get_by_id(&self, record_id: Uuid) -> Result<InteractionRecord> {
            self.inner.get_by_id(record_id).await
        }

        async fn delete(&self, record_id: Uuid) -> Result<()> {
            self.inner.delete(record_id).await
        }

        async fn find_by_query(&self, query: &str) -> Result<Vec<InteractionRecord>> {
            self.inner.find_by_query(query).await
        }

        async fn health(&self) -> Result<String> {
            self.inner.health().await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct Harness {
        coordinator: Arc<RequestCoordinator>,
        cache: Arc<ResultCache>,
        store: Arc<FlakyStore>,
        predictor: Arc<CountingPredictor>,
    }

    fn harness_with(predictor: CountingPredictor, timeout: Duration) -> Harness {
        let cache = Arc::new(ResultCache::new(16, Duration::from_secs(60)));
        let store = Arc::new(FlakyStore::default());
        let predictor = Arc::new(predictor);
        let coordinator = Arc::new(RequestCoordinator::new(
            Arc::clone(&cache),
            store.clone(),
            predictor.clone(),
            timeout,
        ));
        Harness {
            coordinator,
            cache,
            store,
            predictor,
        }
    }

    fn harness() -> Harness {
        harness_with(
            CountingPredictor::new(Prediction::new("simple", 0.92)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_second_identical_query_served_from_cache() {
        let h = harness();

        let first = h.coordinator.predict("What is 2+2?", None, None).await.unwrap();
        let second = h.coordinator.predict("What is 2+2?", None, None).await.unwrap();

        assert_eq!(first.source, PredictionSource::Predicted);
        assert_eq!(second.source, PredictionSource::Cache);
        assert_eq!(first.prediction(), second.prediction());
        assert_eq!(second.record_id, None);
        assert_eq!(h.predictor.calls(), 1);
        assert_eq!(h.store.inner.len().await, 1, "cache hit must not write to the store");
    }

    #[tokio::test]
    async fn test_equivalent_queries_share_cache_entry() {
        let h = harness();
        h.coordinator.predict("What is 2+2?", None, None).await.unwrap();
        let hit = h.coordinator.predict("  what IS   2+2? ", None, None).await.unwrap();
        assert_eq!(hit.source, PredictionSource::Cache);
        assert_eq!(hit.query_text, "  what IS   2+2? ");
        assert_eq!(h.predictor.calls(), 1);
    }

    #[tokio::test]
    async fn test_scenario_create_complete_then_cache_hit() {
        let h = harness();
        let session = Uuid::new_v4();

        let pending = h.coordinator.create("What is 2+2?", Some(session)).await.unwrap();
        assert_eq!(pending.status, RecordStatus::Pending);
        assert_eq!(pending.session_id, session);

        let predicted = h
            .coordinator
            .predict("What is 2+2?", Some(session), Some(pending.record_id))
            .await
            .unwrap();
        assert_eq!(predicted.source, PredictionSource::Predicted);
        assert_eq!(predicted.record_id, Some(pending.record_id));
        assert_eq!(predicted.session_id, session);

        let record = h.coordinator.get(pending.record_id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.label.as_deref(), Some("simple"));
        assert_eq!(record.probability, Some(0.92));
        assert_eq!(h.store.inner.len().await, 1, "no second record written");

        let cached = h.coordinator.predict("What is 2+2?", Some(session), None).await.unwrap();
        assert_eq!(cached.source, PredictionSource::Cache);
        assert_eq!(cached.label, "simple");
        assert_eq!(cached.probability, 0.92);
        assert_eq!(h.predictor.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_completes_callers_pending_record() {
        let h = harness();
        h.coordinator.predict("What is 2+2?", None, None).await.unwrap();

        let pending = h.coordinator.create("what is 2+2?", None).await.unwrap();
        let hit = h
            .coordinator
            .predict("what is 2+2?", None, Some(pending.record_id))
            .await
            .unwrap();
        assert_eq!(hit.source, PredictionSource::Cache);
        assert_eq!(hit.record_id, Some(pending.record_id));
        assert_eq!(hit.session_id, pending.session_id);
        assert_eq!(h.predictor.calls(), 1);

        let record = h.coordinator.get(pending.record_id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.label.as_deref(), Some("simple"));
    }

    #[tokio::test]
    async fn test_completing_a_record_twice_is_invalid_transition() {
        let h = harness();
        let pending = h.coordinator.create("q", None).await.unwrap();
        h.coordinator.predict("q", None, Some(pending.record_id)).await.unwrap();

        let err = h
            .coordinator
            .predict("q", None, Some(pending.record_id))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QclassError::InvalidTransition {
                from: RecordStatus::Completed,
                to: RecordStatus::Completed,
            }
        );
        assert_eq!(h.predictor.calls(), 1);
    }

    #[tokio::test]
    async fn test_existing_record_must_match_query_and_session() {
        let h = harness();
        let pending = h.coordinator.create("first question", None).await.unwrap();

        let err = h
            .coordinator
            .predict("another question", None, Some(pending.record_id))
            .await
            .unwrap_err();
        assert!(matches!(err, QclassError::Validation(_)));

        let err = h
            .coordinator
            .predict("first question", Some(Uuid::new_v4()), Some(pending.record_id))
            .await
            .unwrap_err();
        assert!(matches!(err, QclassError::Validation(_)));

        let missing = Uuid::new_v4();
        let err = h.coordinator.predict("first question", None, Some(missing)).await.unwrap_err();
        assert_eq!(err, QclassError::NotFound(missing));

        assert_eq!(h.predictor.calls(), 0);
        let record = h.coordinator.get(pending.record_id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_prediction_failure_leaves_pending_and_skips_cache() {
        let h = harness();
        h.predictor.fail.store(true, Ordering::SeqCst);

        let err = h.coordinator.predict("hard question", None, None).await.unwrap_err();
        assert!(matches!(err, QclassError::PredictionFailed(_)), "got {err:?}");
        assert!(h.cache.is_empty().unwrap());

        let records = h.store.inner.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Pending);

        // A later identical query starts a fresh attempt with a new record.
        h.predictor.fail.store(false, Ordering::SeqCst);
        let ok = h.coordinator.predict("hard question", None, None).await.unwrap();
        assert_eq!(ok.source, PredictionSource::Predicted);
        assert_eq!(h.predictor.calls(), 2);

        let records = h.store.inner.all().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, RecordStatus::Pending);
        assert_eq!(records[1].status, RecordStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictor_timeout_is_prediction_failure() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("simple", 0.5)).with_delay(Duration::from_secs(30)),
            Duration::from_secs(1),
        );

        let err = h.coordinator.predict("slow", None, None).await.unwrap_err();
        match err {
            QclassError::PredictionFailed(msg) => assert!(msg.contains("timed out"), "msg: {msg}"),
            other => panic!("Expected PredictionFailed, got {other:?}"),
        }
        assert_eq!(h.store.inner.all().await[0].status, RecordStatus::Pending);
        assert!(h.cache.is_empty().unwrap());
        assert_eq!(h.coordinator.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_predictor_output_is_prediction_failure() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("simple", 1.7)),
            Duration::from_secs(5),
        );
        let err = h.coordinator.predict("q", None, None).await.unwrap_err();
        assert!(matches!(err, QclassError::PredictionFailed(_)));
        assert_eq!(h.store.inner.all().await[0].status, RecordStatus::Pending);
        assert!(h.cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_create_failure_is_storage_error_and_skips_predictor() {
        let h = harness();
        h.store.fail_create.store(true, Ordering::SeqCst);

        let err = h.coordinator.predict("q", None, None).await.unwrap_err();
        assert!(matches!(err, QclassError::Storage(_)));
        assert_eq!(h.predictor.calls(), 0);
        assert!(h.cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_complete_failure_is_storage_error_and_never_caches() {
        let h = harness();
        h.store.fail_update.store(true, Ordering::SeqCst);

        let err = h.coordinator.predict("q", None, None).await.unwrap_err();
        assert!(matches!(err, QclassError::Storage(_)));
        assert!(h.cache.is_empty().unwrap(), "no cache write without a completed record");
        assert_eq!(h.store.inner.all().await[0].status, RecordStatus::Pending);

        h.store.fail_update.store(false, Ordering::SeqCst);
        h.coordinator.predict("q", None, None).await.unwrap();
        assert_eq!(h.predictor.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_query_is_validation_error() {
        let h = harness();
        let err = h.coordinator.predict("   ", None, None).await.unwrap_err();
        assert!(matches!(err, QclassError::Validation(_)));
        assert_eq!(h.predictor.calls(), 0);
        assert!(h.store.inner.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_queries_coalesce() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("complex", 0.77)).with_delay(Duration::from_millis(200)),
            Duration::from_secs(5),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let c = Arc::clone(&h.coordinator);
            handles.push(tokio::spawn(async move { c.predict("Explain monads", None, None).await }));
        }

        let mut predicted = 0;
        let mut coalesced = 0;
        let mut record_ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.label, "complex");
            assert_eq!(outcome.probability, 0.77);
            match outcome.source {
                PredictionSource::Predicted => predicted += 1,
                PredictionSource::Coalesced => coalesced += 1,
                PredictionSource::Cache => {}
            }
            record_ids.extend(outcome.record_id);
        }

        assert_eq!(h.predictor.calls(), 1);
        assert_eq!(predicted, 1);
        assert_eq!(coalesced, 9);
        assert_eq!(h.store.inner.len().await, 1);
        record_ids.dedup();
        assert_eq!(record_ids.len(), 1, "all waiters point at the leader's record");
        assert_eq!(h.coordinator.inflight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_waiter_reports_the_stored_session() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("simple", 0.6)).with_delay(Duration::from_secs(1)),
            Duration::from_secs(5),
        );
        let leader_session = Uuid::new_v4();
        let waiter_session = Uuid::new_v4();

        let c = Arc::clone(&h.coordinator);
        let leader = tokio::spawn(async move { c.predict("q", Some(leader_session), None).await });
        h.predictor.entered.notified().await;

        let c = Arc::clone(&h.coordinator);
        let waiter = tokio::spawn(async move { c.predict("q", Some(waiter_session), None).await });

        let led = leader.await.unwrap().unwrap();
        let joined = waiter.await.unwrap().unwrap();
        assert_eq!(joined.source, PredictionSource::Coalesced);
        assert_eq!(joined.record_id, led.record_id);
        assert_eq!(joined.session_id, leader_session);

        let record = h.coordinator.get(joined.record_id.unwrap()).await.unwrap();
        assert_eq!(record.session_id, joined.session_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_waiter_completes_its_own_record() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("complex", 0.8)).with_delay(Duration::from_secs(1)),
            Duration::from_secs(5),
        );
        let own = h.coordinator.create("q", None).await.unwrap();

        let c = Arc::clone(&h.coordinator);
        let leader = tokio::spawn(async move { c.predict("q", None, None).await });
        h.predictor.entered.notified().await;

        let c = Arc::clone(&h.coordinator);
        let record_id = own.record_id;
        let waiter = tokio::spawn(async move { c.predict("q", None, Some(record_id)).await });

        leader.await.unwrap().unwrap();
        let joined = waiter.await.unwrap().unwrap();
        assert_eq!(joined.source, PredictionSource::Coalesced);
        assert_eq!(joined.record_id, Some(own.record_id));
        assert_eq!(joined.session_id, own.session_id);
        assert_eq!(h.predictor.calls(), 1);

        let record = h.coordinator.get(own.record_id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.label.as_deref(), Some("complex"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_waiters_share_leader_failure() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("simple", 0.5)).with_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
        );
        h.predictor.fail.store(true, Ordering::SeqCst);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&h.coordinator);
            handles.push(tokio::spawn(async move { c.predict("doomed", None, None).await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, QclassError::PredictionFailed(_)));
        }
        assert_eq!(h.predictor.calls(), 1);
        assert_eq!(h.coordinator.inflight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_hands_over_to_waiter() {
        let h = harness_with(
            CountingPredictor::new(Prediction::new("simple", 0.6)).with_delay(Duration::from_secs(10)),
            Duration::from_secs(60),
        );

        let c = Arc::clone(&h.coordinator);
        let leader = tokio::spawn(async move { c.predict("q", None, None).await });
        h.predictor.entered.notified().await;

        let c = Arc::clone(&h.coordinator);
        let waiter = tokio::spawn(async move { c.predict("q", None, None).await });
        tokio::task::yield_now().await;

        leader.abort();
        let outcome = waiter.await.unwrap().unwrap();

        assert_eq!(outcome.source, PredictionSource::Predicted);
        assert_eq!(h.predictor.calls(), 2);
        // The abandoned attempt stays behind as a pending record.
        let statuses: Vec<_> = h.store.inner.all().await.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RecordStatus::Pending, RecordStatus::Completed]);
        assert_eq!(h.coordinator.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_miss() {
        let h = harness();
        h.cache.poison();

        let first = h.coordinator.predict("q", None, None).await.unwrap();
        let second = h.coordinator.predict("q", None, None).await.unwrap();
        assert_eq!(first.source, PredictionSource::Predicted);
        assert_eq!(second.source, PredictionSource::Predicted);
        assert_eq!(h.predictor.calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_completed_record_invalidates_cache() {
        let h = harness();
        let outcome = h.coordinator.predict("q", None, None).await.unwrap();
        let record_id = outcome.record_id.unwrap();

        h.coordinator.delete(record_id).await.unwrap();
        assert_eq!(h.coordinator.get(record_id).await, Err(QclassError::NotFound(record_id)));

        let again = h.coordinator.predict("q", None, None).await.unwrap();
        assert_eq!(again.source, PredictionSource::Predicted);
        assert_eq!(h.predictor.calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_unknown_record_is_not_found() {
        let h = harness();
        let id = Uuid::new_v4();
        assert_eq!(h.coordinator.delete(id).await, Err(QclassError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_history_lists_attempts_for_query() {
        let h = harness();
        h.predictor.fail.store(true, Ordering::SeqCst);
        let _ = h.coordinator.predict("What is 2+2?", None, None).await;
        h.predictor.fail.store(false, Ordering::SeqCst);
        h.coordinator.predict("what is 2+2?", None, None).await.unwrap();

        let history = h.coordinator.history("WHAT IS 2+2?").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, RecordStatus::Completed);
        assert_eq!(history[1].status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_every_record_satisfies_completed_invariant() {
        let h = harness();
        h.coordinator.predict("a", None, None).await.unwrap();
        h.predictor.fail.store(true, Ordering::SeqCst);
        let _ = h.coordinator.predict("b", None, None).await;
        h.predictor.fail.store(false, Ordering::SeqCst);
        h.coordinator.create("c", None).await.unwrap();
        h.coordinator.predict("d", None, None).await.unwrap();

        for record in h.store.inner.all().await {
            assert!(record.is_consistent(), "inconsistent record: {record:?}");
        }
    }
}
