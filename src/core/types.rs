use crate::collect::model::TraceRecord;
use crate::trace::{Trace, TraceKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_tasks: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskIdQuery {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TraceIdQuery {
    pub id: u64,
}

/// `POST /api/traces` body. `raw_content` is a canonical trace or a raw
/// recording; `analyze` compiles without saving.
#[derive(Debug, Deserialize)]
pub struct TraceUpload {
    pub raw_content: String,
    #[serde(default)]
    pub source_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<TraceKind>,
    #[serde(default)]
    pub analyze: bool,
}

#[derive(Debug, Serialize)]
pub struct TraceUploadResponse {
    /// Absent for `analyze` requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<TraceRecord>,
    pub trace: Trace,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: String,
    pub status: String,
    pub message: String,
}
