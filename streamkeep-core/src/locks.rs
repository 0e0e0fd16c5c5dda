use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per entity directory.
///
/// Merge jobs and the retention sweep both delete files inside an entity
/// directory; each holds that directory's guard for the whole operation.
#[derive(Clone, Default)]
pub struct DirectoryLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub type DirectoryGuard = OwnedMutexGuard<()>;

impl DirectoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, entity: &str) -> DirectoryGuard {
        let mutex = self
            .locks
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

impl fmt::Debug for DirectoryLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryLocks")
            .field("directories", &self.locks.len())
            .finish()
    }
}
