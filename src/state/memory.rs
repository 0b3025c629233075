//! In-process history store

use super::{HistoryStore, StoredRecord};
use crate::catalog::Env;
use crate::error::OrchestratorResult;

use async_trait::async_trait;
use dashmap::DashMap;

/// Keeps records for the lifetime of the process
#[derive(Default)]
pub struct InMemoryStore {
    records: DashMap<String, StoredRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn put(&self, record: StoredRecord) -> OrchestratorResult<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list(&self, env: Env) -> OrchestratorResult<Vec<StoredRecord>> {
        let mut records: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|r| r.env == env)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.submitted_at);
        Ok(records)
    }

    async fn delete(&self, id: &str) -> OrchestratorResult<()> {
        self.records.remove(id);
        Ok(())
    }
}
