//! In-memory run registry.
//!
//! An insertion-ordered map `run_hash -> RunRecord` bounded by `capacity`.
//! After every insert the oldest-inserted entries are evicted until the size
//! is back within capacity. Eviction here only forgets the in-memory record;
//! it is independent of the on-disk retention tier of the run.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::RunRecord;

/// Default number of records kept in memory
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<String, RunRecord>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// FIFO-bounded registry of run records
#[derive(Debug)]
pub struct RunRegistry {
    capacity: usize,
    inner: RwLock<RegistryInner>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RunRegistry {
    /// Create a registry; a capacity of zero is treated as one
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, run_hash: &str) -> bool {
        self.inner.read().await.records.contains_key(run_hash)
    }

    pub async fn get(&self, run_hash: &str) -> Option<RunRecord> {
        self.inner.read().await.records.get(run_hash).cloned()
    }

    /// Insert a record, returning the hashes evicted to stay within capacity.
    ///
    /// Replacing an existing hash keeps its original insertion position.
    pub async fn insert(&self, record: RunRecord) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let run_hash = record.run_hash.clone();

        if inner.records.insert(run_hash.clone(), record).is_none() {
            inner.order.push_back(run_hash);
        }

        let mut evicted = Vec::new();
        while inner.records.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.records.remove(&oldest).is_some() {
                debug!(run_hash = %oldest, "Evicted from run registry");
                evicted.push(oldest);
            }
        }

        evicted
    }

    /// Apply `f` to a stored record; returns the updated copy
    pub async fn update<F>(&self, run_hash: &str, f: F) -> Option<RunRecord>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut inner = self.inner.write().await;
        let record = inner.records.get_mut(run_hash)?;
        f(record);
        Some(record.clone())
    }

    pub async fn remove(&self, run_hash: &str) -> Option<RunRecord> {
        let mut inner = self.inner.write().await;
        let removed = inner.records.remove(run_hash)?;
        inner.order.retain(|h| h != run_hash);
        Some(removed)
    }

    /// All records in insertion order
    pub async fn snapshot(&self) -> Vec<RunRecord> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|h| inner.records.get(h).cloned())
            .collect()
    }

    /// All hashes in insertion order
    pub async fn hashes(&self) -> Vec<String> {
        self.inner.read().await.order.iter().cloned().collect()
    }
}
