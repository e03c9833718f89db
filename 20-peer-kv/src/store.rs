//! In-memory versioned key-value storage owned by a single node.
//!
//! Every key carries a version that starts at 1 on first write and grows by one
//! on each overwrite. Deleting a key drops it entirely: there are no tombstones,
//! so a later PUT (local or replicated) starts the key over at version 1.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// State of one stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub value: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe versioned map.
///
/// Readers share the lock, writers take it exclusively for the lookup, mutate
/// and version bump only. Callers never see the map itself: reads hand out
/// clones and `keys` returns an owned snapshot, so nothing outside these
/// methods can hold the lock across an await point or a network call.
#[derive(Debug, Default)]
pub struct VersionedStore {
    data: RwLock<BTreeMap<String, Entry>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entry for `key`, if present.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.data.read().get(key).cloned()
    }

    /// Writes `value` under `key` and returns the version it was stored at.
    ///
    /// Never rejects: the last writer wins regardless of what the caller
    /// believed the previous version to be.
    pub fn put(&self, key: String, value: String) -> u64 {
        let mut data = self.data.write();
        let now = Utc::now();
        match data.get_mut(&key) {
            Some(entry) => {
                entry.version += 1;
                entry.value = value;
                entry.updated_at = now;
                entry.version
            }
            None => {
                data.insert(
                    key,
                    Entry {
                        value,
                        version: 1,
                        updated_at: now,
                    },
                );
                1
            }
        }
    }

    /// Removes `key`. Returns `true` iff it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }

    /// Snapshot of the current keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Number of keys at the time of the call.
    pub fn count(&self) -> usize {
        self.data.read().len()
    }
}
