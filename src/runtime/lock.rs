use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Coarse per-process-instance locks guarding merge bookkeeping and
/// interrupt cascades. Held around the critical section only, never across
/// a whole node execution.
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, process_instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(process_instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }
}
