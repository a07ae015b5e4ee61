use qclass_core::ipc::{QclassRequest, QclassResponse};
use qclass_core::RequestCoordinator;

use crate::http::{outcome_json, record_json};

/// Dispatch one IPC request against the coordinator.
pub async fn handle_request(request: QclassRequest, coordinator: &RequestCoordinator) -> QclassResponse {
    match request {
        QclassRequest::Ping => QclassResponse::pong(),
        QclassRequest::Health => {
            let store = match coordinator.store().health().await {
                Ok(v) => v,
                Err(e) => return QclassResponse::from_error(&e),
            };
            let cache = match coordinator.cache().stats() {
                Ok(stats) => serde_json::json!(stats),
                Err(e) => serde_json::json!(format!("unavailable: {}", e)),
            };
            QclassResponse::ok(serde_json::json!({
                "store": store,
                "predictor": coordinator.predictor_name(),
                "cache": cache,
                "status": "healthy"
            }))
        }
        QclassRequest::Predict {
            query,
            session_id,
            record_id,
        } => {
            match coordinator.predict(&query, session_id, record_id).await {
                Ok(outcome) => QclassResponse::ok(outcome_json(&outcome)),
                Err(e) => QclassResponse::from_error(&e),
            }
        }
        QclassRequest::Create { query, session_id } => {
            match coordinator.create(&query, session_id).await {
                Ok(record) => QclassResponse::ok(record_json(&record)),
                Err(e) => QclassResponse::from_error(&e),
            }
        }
        QclassRequest::Get { id } => match coordinator.get(id).await {
            Ok(record) => QclassResponse::ok(record_json(&record)),
            Err(e) => QclassResponse::from_error(&e),
        },
        QclassRequest::Delete { id } => match coordinator.delete(id).await {
            Ok(()) => QclassResponse::ok(serde_json::json!({"deleted": true, "id": id})),
            Err(e) => QclassResponse::from_error(&e),
        },
        QclassRequest::History { query } => match coordinator.history(&query).await {
            Ok(records) => QclassResponse::ok(serde_json::json!({
                "count": records.len(),
                "records": records.iter().map(record_json).collect::<Vec<_>>(),
            })),
            Err(e) => QclassResponse::from_error(&e),
        },
    }
}
