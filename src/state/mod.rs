//! Interaction history
//!
//! Handles:
//! - Persisting interaction state after every confirmed sub-step
//! - Retention per environment and interaction family
//! - Re-hydrating stored interactions for resumption
//! - Serializing writes per interaction id

mod manager;
mod memory;
mod persisted;

pub use manager::PgStore;
pub use memory::InMemoryStore;
pub use persisted::{PersistedAmount, PersistedInteractionState, PersistedParams, PersistedSteps};

use crate::catalog::{Catalog, Env};
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::interaction::{InteractionFamily, InteractionState};
use crate::metrics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Interactions kept per environment and family
pub const MAX_STORED_INTERACTIONS: usize = 10;

/// One stored interaction with the columns the store indexes on
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub env: Env,
    pub family: InteractionFamily,
    pub submitted_at: DateTime<Utc>,
    pub body: Value,
}

impl StoredRecord {
    pub fn from_state(state: &InteractionState) -> OrchestratorResult<Self> {
        let interaction = &state.interaction;
        Ok(Self {
            id: interaction.id.clone(),
            env: interaction.env,
            family: interaction.family(),
            submitted_at: interaction.submitted_at,
            body: serde_json::to_value(PersistedInteractionState::from(state))?,
        })
    }
}

/// Backend holding serialized interaction records
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or replace the record with the same id
    async fn put(&self, record: StoredRecord) -> OrchestratorResult<()>;

    /// Records of one environment, oldest first
    async fn list(&self, env: Env) -> OrchestratorResult<Vec<StoredRecord>>;

    async fn delete(&self, id: &str) -> OrchestratorResult<()>;
}

/// Store selected by the `[database]` section, in memory when absent
pub async fn connect(settings: &Settings) -> OrchestratorResult<Arc<dyn HistoryStore>> {
    match &settings.database {
        Some(database) => {
            let store = PgStore::new(database).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No database configured, keeping interaction history in memory");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

pub struct History {
    store: Arc<dyn HistoryStore>,
    retention_cap: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl History {
    pub fn new(store: Arc<dyn HistoryStore>, retention_cap: usize) -> Self {
        Self {
            store,
            retention_cap,
            locks: DashMap::new(),
        }
    }

    /// Exclusive write access to one interaction's record
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn put(&self, state: &InteractionState) -> OrchestratorResult<()> {
        let _guard = self.lock(state.id()).await;
        self.put_unlocked(state).await
    }

    /// Write while the caller already holds the id's lock
    pub async fn put_unlocked(&self, state: &InteractionState) -> OrchestratorResult<()> {
        self.store.put(StoredRecord::from_state(state)?).await?;
        debug!("Persisted interaction {} at {}", state.id(), state.phase.as_str());
        Ok(())
    }

    /// Store a new interaction and evict the oldest beyond the retention cap
    ///
    /// Returns the evicted ids.
    pub async fn insert(&self, state: &InteractionState) -> OrchestratorResult<Vec<String>> {
        self.put(state).await?;

        let env = state.interaction.env;
        let family = state.interaction.family();
        let mut same_family: Vec<StoredRecord> = self
            .store
            .list(env)
            .await?
            .into_iter()
            .filter(|r| r.family == family)
            .collect();
        same_family.sort_by_key(|r| r.submitted_at);

        let excess = same_family.len().saturating_sub(self.retention_cap);
        let mut evicted = Vec::with_capacity(excess);
        for record in same_family.into_iter().take(excess) {
            let _guard = self.lock(&record.id).await;
            self.store.delete(&record.id).await?;
            self.locks.remove(&record.id);
            metrics::record_retention_eviction(env, family);
            info!(
                "Evicted interaction {} from {} {} history",
                record.id,
                env.as_str(),
                family.as_str()
            );
            evicted.push(record.id);
        }
        Ok(evicted)
    }

    /// Stored interactions of `env`, oldest first
    ///
    /// Records that no longer decode against `catalog` are skipped.
    pub async fn get(&self, env: Env, catalog: &Catalog) -> OrchestratorResult<Vec<InteractionState>> {
        let records = self.store.list(env).await?;
        let mut states = Vec::with_capacity(records.len());
        for record in records {
            match decode(record.body, catalog) {
                Ok(state) => states.push(state),
                Err(e) => {
                    metrics::record_record_skipped(env);
                    warn!("Skipping stored interaction {}: {}", record.id, e);
                }
            }
        }
        Ok(states)
    }

    pub async fn delete(&self, id: &str) -> OrchestratorResult<()> {
        let _guard = self.lock(id).await;
        self.store.delete(id).await?;
        drop(_guard);
        self.locks.remove(id);
        Ok(())
    }
}

fn decode(body: Value, catalog: &Catalog) -> OrchestratorResult<InteractionState> {
    let stored: PersistedInteractionState = serde_json::from_value(body)?;
    if stored.env != catalog.env() {
        return Err(OrchestratorError::Serialization(format!(
            "record is for {}, catalog is for {}",
            stored.env.as_str(),
            catalog.env().as_str()
        )));
    }
    stored.into_state(catalog)
}
