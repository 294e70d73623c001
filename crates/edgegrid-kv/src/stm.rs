//! Optimistic STM transactions over the KV store.
//!
//! A transaction function reads and writes through an [`Stm`] handle.
//! Reads record the observed revision of each key (0 for absent keys);
//! writes are buffered. At commit the store verifies no observed key
//! changed and applies all writes at one new revision, or the function
//! re-runs. Retries are bounded; a persistent conflict surfaces as
//! [`crate::KvError::TxConflict`].

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::store::{KvStore, LeaseId, PendingWrite};

/// A buffered transactional view of the store.
pub struct Stm<'a> {
    store: &'a KvStore,
    reads: HashMap<String, u64>,
    writes: BTreeMap<String, PendingWrite>,
}

impl<'a> Stm<'a> {
    fn new(store: &'a KvStore) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Read a key, buffered writes first. Observes the key's revision so
    /// the commit detects concurrent writers, including for absent keys.
    pub fn get(&mut self, key: &str) -> Option<String> {
        if let Some(write) = self.writes.get(key) {
            return match write {
                PendingWrite::Put { value, .. } => Some(value.clone()),
                PendingWrite::Del => None,
            };
        }
        match self.store.get(key) {
            Some(val) => {
                self.reads.insert(key.to_string(), val.mod_rev);
                Some(val.value)
            }
            None => {
                self.reads.insert(key.to_string(), 0);
                None
            }
        }
    }

    /// Existence check; observes the key like `get`.
    pub fn has(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Buffer a write.
    pub fn put(&mut self, key: &str, value: &str) {
        self.writes.insert(
            key.to_string(),
            PendingWrite::Put {
                value: value.to_string(),
                lease: None,
            },
        );
    }

    /// Buffer a write attaching a lease.
    pub fn put_with_lease(&mut self, key: &str, value: &str, lease: LeaseId) {
        self.writes.insert(
            key.to_string(),
            PendingWrite::Put {
                value: value.to_string(),
                lease: Some(lease),
            },
        );
    }

    /// Buffer a deletion.
    pub fn del(&mut self, key: &str) {
        self.writes.insert(key.to_string(), PendingWrite::Del);
    }

    /// List current values under a prefix. Every returned key is
    /// observed; buffered writes shadow the store.
    pub fn list(&mut self, prefix: &str) -> Vec<(String, String)> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for (key, val) in self.store.list(prefix) {
            self.reads.entry(key.clone()).or_insert(val.mod_rev);
            out.insert(key, val.value);
        }
        for (key, write) in &self.writes {
            if !key.starts_with(prefix) {
                continue;
            }
            match write {
                PendingWrite::Put { value, .. } => {
                    out.insert(key.clone(), value.clone());
                }
                PendingWrite::Del => {
                    out.remove(key);
                }
            }
        }
        out.into_iter().collect()
    }
}

/// Run `f` transactionally with up to `max_retries` optimistic attempts.
/// Returns the commit revision. Errors from `f` abort without retrying;
/// nothing is applied.
pub fn apply_stm<E, F>(store: &KvStore, max_retries: u32, mut f: F) -> Result<u64, E>
where
    E: From<KvError>,
    F: FnMut(&mut Stm) -> Result<(), E>,
{
    for attempt in 0..max_retries.max(1) {
        let mut stm = Stm::new(store);
        f(&mut stm)?;
        let reads = std::mem::take(&mut stm.reads);
        let writes = std::mem::take(&mut stm.writes);
        match commit(store, &reads, writes)? {
            Some(rev) => return Ok(rev),
            None => {
                debug!(attempt, "stm conflict, retrying");
            }
        }
    }
    Err(KvError::TxConflict(max_retries).into())
}

fn commit(
    store: &KvStore,
    reads: &HashMap<String, u64>,
    writes: BTreeMap<String, PendingWrite>,
) -> KvResult<Option<u64>> {
    store.commit_txn(reads, writes)
}
