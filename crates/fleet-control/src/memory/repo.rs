use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_proto::{Request, RequestStatus};

use crate::repo::{RequestError, RequestRepo};

#[derive(Debug, Default)]
struct Tables {
    requests: HashMap<String, Request>,
    errors: Vec<RequestError>,
}

#[derive(Debug, Default)]
pub struct MemoryRepo {
    tables: Mutex<Tables>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request(&self, id: &str) -> Option<Request> {
        self.tables().requests.get(id).cloned()
    }

    pub fn errors(&self) -> Vec<RequestError> {
        self.tables().errors.clone()
    }

    pub fn len(&self) -> usize {
        self.tables().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RequestRepo for MemoryRepo {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Request>> {
        Ok(self.request(id))
    }

    async fn insert(&self, req: &Request) -> anyhow::Result<()> {
        let mut tables = self.tables();
        if tables.requests.contains_key(&req.id) {
            anyhow::bail!("Duplicate request id {}", req.id);
        }
        tables.requests.insert(req.id.clone(), req.clone());
        Ok(())
    }

    async fn update(&self, req: &Request) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let stored = tables
            .requests
            .get_mut(&req.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown request {}", req.id))?;
        stored.status = req.status;
        stored.retry_count = req.retry_count;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: RequestStatus) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let stored = tables
            .requests
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown request {id}"))?;
        stored.status = status;
        Ok(())
    }

    async fn record_error(&self, err: &RequestError) -> anyhow::Result<()> {
        self.tables().errors.push(err.clone());
        Ok(())
    }

    async fn list_retryable(&self, limit: usize) -> anyhow::Result<Vec<Request>> {
        let tables = self.tables();
        let mut retryable: Vec<Request> = tables
            .requests
            .values()
            .filter(|r| {
                r.status == RequestStatus::Queued
                    && r.retry_count > 0
                    && r.retry_count <= r.options.max_retry_count
            })
            .cloned()
            .collect();
        retryable.sort_by(|a, b| a.id.cmp(&b.id));
        retryable.truncate(limit);
        Ok(retryable)
    }
}
