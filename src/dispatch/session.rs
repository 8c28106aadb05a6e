//! Per-session serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// One async mutex per session id. Different sessions never contend.
///
/// Entries only live while a turn holds or waits for them.
#[derive(Default)]
pub struct SessionLocks {
    locks: LockMap,
}

/// Held for the duration of a turn. Dropping it, including when the turn
/// future itself is dropped, releases the session and prunes idle entries.
pub struct SessionGuard {
    session_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: Uuid) -> SessionGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(session_id).or_default().clone()
        };
        SessionGuard {
            session_id,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Number of sessions currently holding or waiting for a lock
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // the owned guard keeps its own Arc to the mutex
        self.guard.take();

        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(&self.session_id) {
            // only the map holds it: nobody is waiting
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.session_id);
            }
        }
    }
}
