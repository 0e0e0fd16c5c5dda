//! Tracked entities and their running flags.
//!
//! The entity list is guarded by a reader/writer lock: pollers and schedulers
//! take snapshots under the read half, the management surface adds and
//! removes under the write half. Each entity's running flag is an atomic
//! whose only writer is the [`RunningFlag`] handed out by [`EntityRegistry::add`],
//! which the runtime gives to that entity's poller and nobody else.

pub mod store;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CaptureError, Result};

pub use store::{RegistryDocument, RegistryStore, StreamerRecord};

/// Point-in-time view of one tracked entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: String,
    pub is_running: bool,
}

/// Write handle for one entity's running flag.
#[derive(Clone)]
pub struct RunningFlag {
    entity: Arc<str>,
    flag: Arc<AtomicBool>,
}

impl RunningFlag {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn set(&self, running: bool) {
        self.flag.store(running, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RunningFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningFlag")
            .field("entity", &self.entity)
            .field("running", &self.get())
            .finish()
    }
}

struct RegistryEntry {
    id: Arc<str>,
    running: Arc<AtomicBool>,
}

impl RegistryEntry {
    fn snapshot(&self) -> TrackedEntity {
        TrackedEntity {
            id: self.id.to_string(),
            is_running: self.running.load(Ordering::Acquire),
        }
    }
}

#[derive(Default)]
pub struct EntityRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity_count = self
            .entries
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("EntityRegistry")
            .field("entity_count", &entity_count)
            .finish()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered snapshot taken under the read lock.
    pub async fn list(&self) -> Vec<TrackedEntity> {
        let guard = self.entries.read().await;
        guard.iter().map(RegistryEntry::snapshot).collect()
    }

    pub async fn get(&self, id: &str) -> Option<TrackedEntity> {
        let guard = self.entries.read().await;
        guard
            .iter()
            .find(|entry| &*entry.id == id)
            .map(RegistryEntry::snapshot)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Track a new entity (not running) and return the only writer of its
    /// running flag.
    pub async fn add(&self, id: &str) -> Result<RunningFlag> {
        validate_entity_id(id)?;

        let mut guard = self.entries.write().await;
        if guard.iter().any(|entry| &*entry.id == id) {
            return Err(CaptureError::EntityExists(id.to_string()));
        }

        let entry = RegistryEntry {
            id: Arc::from(id),
            running: Arc::new(AtomicBool::new(false)),
        };
        let flag = RunningFlag {
            entity: Arc::clone(&entry.id),
            flag: Arc::clone(&entry.running),
        };
        guard.push(entry);
        Ok(flag)
    }

    pub async fn remove(&self, id: &str) -> Result<TrackedEntity> {
        let mut guard = self.entries.write().await;
        let position = guard
            .iter()
            .position(|entry| &*entry.id == id)
            .ok_or_else(|| CaptureError::EntityNotFound(id.to_string()))?;
        Ok(guard.remove(position).snapshot())
    }
}

/// Entity ids become directory names under the download root.
pub fn validate_entity_id(id: &str) -> Result<()> {
    let invalid = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CaptureError::InvalidEntityId(id.to_string()));
    }
    Ok(())
}
