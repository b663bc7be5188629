use serde::{Deserialize, Serialize};

/// A logged event as stored. Immutable once read.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub id: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub label: String,
    pub notes: Option<String>,
    pub category_id: Option<i64>,
}

/// A record before the store assigns it an id.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub timestamp: i64,
    pub label: String,
    pub notes: Option<String>,
    pub category_id: Option<i64>,
}

/// User-defined event type
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// Record input from API
///
/// The category may be given by id or by name; the id wins when both are set.
#[derive(Debug, Deserialize)]
pub struct RecordInput {
    pub label: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryInput {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectionInput {
    #[serde(default)]
    pub category_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PageInput {
    pub direction: crate::pager::Direction,
}

/// API Response
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }
}
