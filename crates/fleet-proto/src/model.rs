use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// What a node announces about itself when joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    #[serde(default)]
    pub id: String,
    pub host: String,
    pub max_concurrency: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestStatus {
    #[default]
    Queued = 1,
    Dispatched = 2,
    Done = 3,
}

impl From<RequestStatus> for u8 {
    fn from(status: RequestStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for RequestStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Queued),
            2 => Ok(Self::Dispatched),
            3 => Ok(Self::Done),
            other => Err(format!("Unknown request status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Seconds a single attempt may take, 0 means the control plane default
    #[serde(default)]
    pub max_ttl_per_request: u64,
    #[serde(default)]
    pub max_retry_count: u32,
    #[serde(default)]
    pub max_request_depth: u32,
    #[serde(default)]
    pub disable_proxy: bool,
    #[serde(default)]
    pub enable_headless: bool,
}

impl RequestOptions {
    pub fn max_ttl(&self) -> Option<Duration> {
        (self.max_ttl_per_request > 0).then(|| Duration::from_secs(self.max_ttl_per_request))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub tracing_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub store_id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub cookies: String,
    #[serde(default)]
    pub shared_data: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub options: RequestOptions,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_method() -> String {
    String::from("GET")
}

impl Request {
    pub fn new(store_id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            tracing_id: id.clone(),
            id,
            job_id: String::new(),
            parent_id: None,
            store_id: store_id.into(),
            method: default_method(),
            url: url.into(),
            headers: String::new(),
            cookies: String::new(),
            shared_data: String::new(),
            depth: 0,
            options: RequestOptions::default(),
            status: RequestStatus::Queued,
            retry_count: 0,
        }
    }

    /// A request emitted while handling `self`, inheriting its tracing context.
    pub fn child(&self, url: impl Into<String>) -> Self {
        Self {
            tracing_id: self.tracing_id.clone(),
            job_id: self.job_id.clone(),
            parent_id: Some(self.id.clone()),
            depth: self.depth + 1,
            options: self.options.clone(),
            shared_data: self.shared_data.clone(),
            ..Self::new(self.store_id.clone(), url)
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.options.max_retry_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crawler {
    pub id: String,
    pub store_id: String,
    pub version: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub serve_addr: String,
    pub online_utc: DateTime<Utc>,
    pub last_heartbeat_utc: DateTime<Utc>,
}

impl Crawler {
    /// Stable id of the crawler served by `node_id` at `serve_addr`.
    pub fn derive_id(node_id: &str, version: &str, serve_addr: &str) -> String {
        let name = format!("{node_id}|{version}|{serve_addr}");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    pub fn new(
        node_id: &str,
        store_id: impl Into<String>,
        version: impl Into<String>,
        serve_addr: impl Into<String>,
    ) -> Self {
        let version = version.into();
        let serve_addr = serve_addr.into();
        let now = Utc::now();
        Self {
            id: Self::derive_id(node_id, &version, &serve_addr),
            store_id: store_id.into(),
            version,
            allowed_domains: vec![],
            serve_addr,
            online_utc: now,
            last_heartbeat_utc: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseTask {
    pub request: Request,
    #[serde(default)]
    pub response: Option<RawResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub tracing_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub store_id: String,
    #[serde(default)]
    pub request_id: String,
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseFailure {
    pub tracing_id: String,
    pub request_id: String,
    pub message: String,
}

/// One result streamed back by a crawler's parse call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ParseOutput {
    Item(Item),
    Request(Request),
    Error(ParseFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub tracing_id: String,
    pub request_id: String,
    pub store_id: String,
    pub success: bool,
    pub item_count: usize,
    pub request_count: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawler_id_is_stable() {
        let a = Crawler::derive_id("node-1", "1.2.0", "10.0.0.5:9000");
        let b = Crawler::derive_id("node-1", "1.2.0", "10.0.0.5:9000");
        let c = Crawler::derive_id("node-1", "1.3.0", "10.0.0.5:9000");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn child_request_inherits_context() {
        let mut parent = Request::new("shop", "https://shop.example.com/");
        parent.options.max_retry_count = 3;
        let child = parent.child("https://shop.example.com/p/1");

        assert_eq!(child.tracing_id, parent.tracing_id);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.depth, 1);
        assert_eq!(child.options.max_retry_count, 3);
        assert_ne!(child.id, parent.id);
    }

    #[test]
    fn status_is_numeric_on_the_wire() {
        let json = serde_json::to_string(&RequestStatus::Dispatched).unwrap();
        assert_eq!(json, "2");
        assert!(serde_json::from_str::<RequestStatus>("7").is_err());
    }
}
