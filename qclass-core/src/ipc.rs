use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QclassRequest {
    Ping,
    Health,
    Predict {
        query: String,
        session_id: Option<uuid::Uuid>,
        /// Pending record to complete instead of writing a new one.
        #[serde(default)]
        record_id: Option<uuid::Uuid>,
    },
    Create {
        query: String,
        session_id: Option<uuid::Uuid>,
    },
    Get {
        id: uuid::Uuid,
    },
    Delete {
        id: uuid::Uuid,
    },
    History {
        query: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QclassResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Machine-readable error kind, e.g. `not_found`
    #[serde(default)]
    pub code: Option<String>,
    pub version: String,
}

impl QclassResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            code: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            code: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn from_error(e: &crate::QclassError) -> Self {
        Self {
            code: Some(e.code().to_string()),
            ..Self::err(e.to_string())
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
