//! Per-run locking and cooperative cancellation.
//!
//! `RunLocks` hands out one async mutex per run hash. Holding it serializes
//! every mutation of that run: the cache-miss build (single-flight), retention
//! moves, and cold-storage offload/restore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per run hash
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `run_hash`
    pub async fn lock(&self, run_hash: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(run_hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of hashes currently tracked
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Cancellation request shared between a caller and a long-running operation
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    requested: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
