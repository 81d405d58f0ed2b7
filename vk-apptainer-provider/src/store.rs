//! Pod record store
//!
//! A concurrent map from pod identity to [`PodRecord`]. Every mutation goes
//! through [`PodStore::upsert`], which runs the caller's mutator against a
//! copy of the record while holding that identity's shard lock and only
//! publishes the copy if the mutator succeeds. Unrelated pods live in
//! other shards and are never serialized behind each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use vk_apptainer_common::{LifecycleState, PodIdentity};

use crate::error::{ProviderError, Result};
use crate::record::PodRecord;

/// Thread-safe cache of pod records
#[derive(Clone)]
pub struct PodStore {
    inner: Arc<DashMap<PodIdentity, PodRecord>>,
    changed: Arc<Notify>,
}

impl PodStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Copy of the record for an identity
    pub fn get(&self, identity: &PodIdentity) -> Option<PodRecord> {
        self.inner.get(identity).map(|r| r.clone())
    }

    /// Point-in-time copy of every record
    pub fn list(&self) -> Vec<PodRecord> {
        self.inner.iter().map(|r| r.value().clone()).collect()
    }

    /// Atomic read-modify-write of one identity.
    ///
    /// The mutator sees `None` when no record exists and may leave, fill or
    /// clear the slot. If it returns an error nothing is written. The
    /// mutator runs under the shard lock and must not call back into the
    /// store.
    pub fn upsert<T, F>(&self, identity: &PodIdentity, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Option<PodRecord>) -> Result<T>,
    {
        let (out, before, after) = match self.inner.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let before = Some(fingerprint(entry.get()));
                let mut slot = Some(entry.get().clone());
                let out = mutate(&mut slot)?;
                let after = slot.as_ref().map(fingerprint);
                match slot {
                    Some(record) => {
                        entry.insert(record);
                    }
                    None => {
                        entry.remove();
                    }
                }
                (out, before, after)
            }
            Entry::Vacant(entry) => {
                let mut slot = None;
                let out = mutate(&mut slot)?;
                let after = slot.as_ref().map(fingerprint);
                if let Some(record) = slot {
                    entry.insert(record);
                }
                (out, None, after)
            }
        };
        if before != after {
            self.changed.notify_one();
        }
        Ok(out)
    }

    /// Mutate an existing record computed against `expected` generation
    pub fn update_at<T, F>(&self, identity: &PodIdentity, expected: u64, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut PodRecord) -> Result<T>,
    {
        self.upsert(identity, |slot| {
            let record = slot
                .as_mut()
                .ok_or_else(|| ProviderError::not_found(identity))?;
            record.expect_generation(expected)?;
            mutate(record)
        })
    }

    /// Remove a record outright
    pub fn remove(&self, identity: &PodIdentity) -> Option<PodRecord> {
        let removed = self.inner.remove(identity).map(|(_, v)| v);
        if removed.is_some() {
            self.changed.notify_one();
        }
        removed
    }

    /// Mark a terminal record as seen by the orchestrator
    pub fn acknowledge(&self, identity: &PodIdentity, generation: u64) {
        if let Some(mut record) = self.inner.get_mut(identity) {
            if record.is_terminal() && record.generation == generation {
                record.acknowledged = true;
            }
        }
    }

    /// Purge acknowledged `Terminated` records older than `retention`
    pub fn collect_garbage(&self, retention: Duration) -> usize {
        let now = chrono::Utc::now();
        let before = self.inner.len();

        self.inner.retain(|_, record| {
            let expired = record
                .finished_at
                .and_then(|at| (now - at).to_std().ok())
                .is_some_and(|age| age >= retention);
            !(record.state == LifecycleState::Terminated && record.acknowledged && expired)
        });

        before - self.inner.len()
    }

    /// Number of records in each lifecycle state
    pub fn count_by_state(&self) -> Vec<(LifecycleState, usize)> {
        LifecycleState::ALL
            .iter()
            .map(|state| {
                let n = self.inner.iter().filter(|r| r.state == *state).count();
                (*state, n)
            })
            .collect()
    }

    /// Resolves after the next write that moved a record's state,
    /// generation or handle. Meant for a single consumer.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Get the number of records in the store
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn fingerprint(record: &PodRecord) -> (LifecycleState, u64, bool) {
    (record.state, record.generation, record.remote_handle.is_some())
}

impl Default for PodStore {
    fn default() -> Self {
        Self::new()
    }
}
