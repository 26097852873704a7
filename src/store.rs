//! Emergency storage. The in-memory active set plus a bounded recent
//! history, behind an RwLock — the only shared mutable resource in the
//! engine. Durable persistence is delegated outward through the
//! `EmergencyRepository` contract.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::enums::TriggerType;
use crate::models::Emergency;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Emergency not found: {0}")]
    NotFound(Uuid),

    #[error("Internal lock failed")]
    LockFailed,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Durable persistence collaborator. Retention and storage medium are the
/// embedder's concern; the engine writes full records and reads active
/// ones back on restart.
#[async_trait]
pub trait EmergencyRepository: Send + Sync {
    async fn save(&self, emergency: &Emergency) -> Result<(), StoreError>;
    async fn load_active(&self) -> Result<Vec<Emergency>, StoreError>;
}

/// In-memory repository for tests and embedders without durable storage.
#[derive(Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<Uuid, Emergency>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Emergency> {
        self.records.read().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl EmergencyRepository for InMemoryRepository {
    async fn save(&self, emergency: &Emergency) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::LockFailed)?;
        records.insert(emergency.id, emergency.clone());
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<Emergency>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::LockFailed)?;
        Ok(records
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect())
    }
}

struct StoreInner {
    active: HashMap<Uuid, Emergency>,
    /// Most recent first, bounded by `history_limit`.
    history: VecDeque<Emergency>,
}

/// Active-emergency collection, exclusively owned by the engine.
/// Mutations to a single emergency are serialized through the write
/// lock; the scheduler only ever holds an id, never a live reference.
pub struct EmergencyStore {
    inner: RwLock<StoreInner>,
    history_limit: usize,
}

impl EmergencyStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                active: HashMap::new(),
                history: VecDeque::new(),
            }),
            history_limit,
        }
    }

    pub fn insert(&self, emergency: Emergency) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockFailed)?;
        inner.active.insert(emergency.id, emergency);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Emergency>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockFailed)?;
        Ok(inner.active.get(&id).cloned())
    }

    /// Run a closure against one active emergency under the write lock
    /// and return the updated snapshot for persistence.
    pub fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Emergency) -> T,
    ) -> Result<(T, Emergency), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockFailed)?;
        let emergency = inner.active.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let out = f(emergency);
        let snapshot = emergency.clone();
        Ok((out, snapshot))
    }

    /// Run a closure against a closed emergency in the history window.
    /// Late responses are appended here; a closed record's status and
    /// attribution are settled and never change.
    pub fn update_closed<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Emergency) -> T,
    ) -> Result<(T, Emergency), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockFailed)?;
        let emergency = inner
            .history
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))?;
        let out = f(emergency);
        let snapshot = emergency.clone();
        Ok((out, snapshot))
    }

    /// Move a record from the active set to the history window.
    pub fn archive(&self, id: Uuid) -> Result<Emergency, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockFailed)?;
        let emergency = inner.active.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.history.push_front(emergency.clone());
        while inner.history.len() > self.history_limit {
            inner.history.pop_back();
        }
        Ok(emergency)
    }

    pub fn active(&self) -> Result<Vec<Emergency>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockFailed)?;
        let mut list: Vec<Emergency> = inner.active.values().cloned().collect();
        list.sort_by_key(|e| e.detected_at);
        Ok(list)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<Emergency>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockFailed)?;
        Ok(inner.history.iter().take(limit).cloned().collect())
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().map(|i| i.active.len()).unwrap_or(0)
    }

    /// Most recent still-active emergency for the same patient + trigger
    /// type (+ medication, when supplied) detected within the window.
    pub fn find_recent_duplicate(
        &self,
        patient_id: Uuid,
        trigger_type: TriggerType,
        medication_id: Option<Uuid>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockFailed)?;
        let found = inner
            .active
            .values()
            .filter(|e| {
                e.patient_id == patient_id
                    && e.trigger_type == trigger_type
                    && e.context.medication_id == medication_id
                    && now - e.detected_at <= window
            })
            .max_by_key(|e| e.detected_at)
            .map(|e| e.id);
        Ok(found)
    }
}
