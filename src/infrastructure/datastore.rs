//! The node-local key-value map. No causal reasoning lives here — that is
//! [`crate::infrastructure::node::Node`]'s job; this module only knows how
//! to store, overwrite and merge [`DataVersion`]s under a single lock.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::core::vector_clock::VectorClock;
use crate::infrastructure::wire::DataVersion;

/// Outcome of a local `put`, mirroring the reference's two write statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    CreatedNewValue,
    UpdatedExistingValue,
}

/// `key -> DataVersion`. A tombstone is an entry whose value is empty; it
/// is never removed from the map by anything in this module (there is no
/// garbage collector).
#[derive(Default)]
pub struct Datastore {
    entries: Mutex<HashMap<String, DataVersion>>,
}

impl Datastore {
    pub fn new() -> Self {
        Datastore {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Direct, non-causal read used by inter-server `directGet` traffic and
    /// by the GET reconciliation fan-out.
    pub async fn direct_get(&self, key: &str) -> Option<DataVersion> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Overwrites `key`, classifying the write as create vs. update based
    /// on whether a *live* (non-tombstone) value was already present.
    pub async fn put(&self, key: String, data: DataVersion) -> PutOutcome {
        let mut entries = self.entries.lock().await;
        let outcome = match entries.get(&key) {
            Some(existing) if !existing.is_tombstone() => PutOutcome::UpdatedExistingValue,
            _ => PutOutcome::CreatedNewValue,
        };
        entries.insert(key, data);
        outcome
    }

    /// Tombstones `key` with `clock`. Returns `false` (and does not write)
    /// if the key was already absent or already a tombstone.
    pub async fn delete(&self, key: &str, clock: VectorClock) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(existing) if !existing.is_tombstone() => {
                entries.insert(key.to_string(), DataVersion::new(String::new(), clock));
                true
            }
            _ => false,
        }
    }

    pub async fn has_live(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|d| !d.is_tombstone())
            .unwrap_or(false)
    }

    pub async fn count_live(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|d| !d.is_tombstone())
            .count()
    }

    /// Anti-entropy merge: overwrite `key` with `incoming` iff there was no
    /// local entry, or the local entry is not the `isMax` winner against
    /// `incoming`.
    pub async fn merge_one(&self, key: String, incoming: DataVersion) {
        let mut entries = self.entries.lock().await;
        let should_overwrite = match entries.get(&key) {
            None => true,
            Some(local) => !VectorClock::is_max(&local.clock, &incoming.clock),
        };
        if should_overwrite {
            entries.insert(key, incoming);
        }
    }

    pub async fn merge_many(&self, incoming: Vec<(String, DataVersion)>) {
        for (key, data) in incoming {
            self.merge_one(key, data).await;
        }
    }

    /// Snapshot of every entry, for gossip and for SWITCH's key-by-key scan.
    pub async fn snapshot(&self) -> Vec<(String, DataVersion)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drains every entry out of the map, for the SWITCH path where the
    /// whole local dataset is either moved into the prepared store or
    /// shipped to the new owner.
    pub async fn drain(&self) -> Vec<(String, DataVersion)> {
        self.entries.lock().await.drain().collect()
    }

    /// Inserts without any causal or create/update bookkeeping — used by
    /// `reshardMove` and by SWITCH to place entries directly.
    pub async fn insert_raw(&self, key: String, data: DataVersion) {
        self.entries.lock().await.insert(key, data);
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(n: i64) -> VectorClock {
        VectorClock::add(&VectorClock::new(), "a:1", n)
    }

    #[tokio::test]
    async fn put_classifies_create_vs_update() {
        let store = Datastore::new();
        let first = store.put("k".into(), DataVersion::new("v1".into(), clock(1))).await;
        assert_eq!(first, PutOutcome::CreatedNewValue);
        let second = store.put("k".into(), DataVersion::new("v2".into(), clock(2))).await;
        assert_eq!(second, PutOutcome::UpdatedExistingValue);
    }

    #[tokio::test]
    async fn put_after_tombstone_is_a_create() {
        let store = Datastore::new();
        store.put("k".into(), DataVersion::new("v1".into(), clock(1))).await;
        store.delete("k", clock(2)).await;
        let outcome = store.put("k".into(), DataVersion::new("v3".into(), clock(3))).await;
        assert_eq!(outcome, PutOutcome::CreatedNewValue);
    }

    #[tokio::test]
    async fn delete_is_false_when_absent_or_already_tombstoned() {
        let store = Datastore::new();
        assert!(!store.delete("missing", clock(1)).await);
        store.put("k".into(), DataVersion::new("v".into(), clock(1))).await;
        assert!(store.delete("k", clock(2)).await);
        assert!(!store.delete("k", clock(3)).await);
    }

    #[tokio::test]
    async fn merge_keeps_the_causally_dominant_version() {
        let store = Datastore::new();
        store.put("k".into(), DataVersion::new("old".into(), clock(1))).await;
        store
            .merge_one("k".into(), DataVersion::new("stale".into(), clock(0)))
            .await;
        assert_eq!(store.direct_get("k").await.unwrap().value, "old");

        store
            .merge_one("k".into(), DataVersion::new("new".into(), clock(5)))
            .await;
        assert_eq!(store.direct_get("k").await.unwrap().value, "new");
    }

    #[tokio::test]
    async fn count_live_excludes_tombstones() {
        let store = Datastore::new();
        store.put("k1".into(), DataVersion::new("v".into(), clock(1))).await;
        store.put("k2".into(), DataVersion::new("v".into(), clock(1))).await;
        store.delete("k2", clock(2)).await;
        assert_eq!(store.count_live().await, 1);
    }
}
