//! Contract of the relational store holding requests and their error history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_proto::{Request, RequestStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestError {
    pub request_id: String,
    pub tracing_id: String,
    pub node_id: Option<String>,
    pub message: String,
    pub duration_ms: u64,
    pub created_utc: DateTime<Utc>,
}

#[async_trait]
pub trait RequestRepo: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Request>>;

    async fn insert(&self, req: &Request) -> anyhow::Result<()>;

    /// Persists status and retry count of an existing request.
    async fn update(&self, req: &Request) -> anyhow::Result<()>;

    async fn set_status(&self, id: &str, status: RequestStatus) -> anyhow::Result<()>;

    async fn record_error(&self, err: &RequestError) -> anyhow::Result<()>;

    /// Queued requests sent back for another attempt (`retry_count > 0`)
    /// that still have retry budget, at most `limit` of them.
    async fn list_retryable(&self, limit: usize) -> anyhow::Result<Vec<Request>>;
}
