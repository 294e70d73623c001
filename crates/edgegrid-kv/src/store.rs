//! The KV store: revisioned records, leases, and watch streams.
//!
//! All mutations happen under a single mutex and are durably written to
//! redb (when opened on disk) before the lock is released. Watch events
//! are dispatched after the lock is dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{KvError, KvResult};

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const META_REV: &str = "revision";

/// Convert any `Display` error into a `KvError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| KvError::$variant(e.to_string())
    };
}

pub type LeaseId = i64;

/// A stored record with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvVal {
    pub value: String,
    /// Revision at which the key was created.
    pub create_rev: u64,
    /// Revision of the last write to the key.
    pub mod_rev: u64,
    /// Per-key write counter, starts at 1.
    pub version: u64,
    /// Attached lease, if the key is ephemeral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
}

/// A committed change delivered to watchers. `value` is None for
/// deletions.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<String>,
    pub rev: u64,
}

struct Lease {
    expires_at: u64,
    ttl_secs: u64,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvEvent>,
}

struct Inner {
    data: BTreeMap<String, KvVal>,
    rev: u64,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

/// A buffered write applied at commit.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Put {
        value: String,
        lease: Option<LeaseId>,
    },
    Del,
}

/// The store handle; cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Mutex<Inner>>,
    db: Option<Arc<Database>>,
}

impl KvStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> KvResult<Self> {
        let db = Database::create(path).map_err(map_err!(Storage))?;
        let store = Self::from_db(Some(Arc::new(db)))?;
        debug!(?path, "kv store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: BTreeMap::new(),
                rev: 0,
                leases: HashMap::new(),
                next_lease_id: 1,
                watchers: Vec::new(),
            })),
            db: None,
        }
    }

    fn from_db(db: Option<Arc<Database>>) -> KvResult<Self> {
        let mut data = BTreeMap::new();
        let mut rev = 0;
        if let Some(db) = &db {
            let txn = db.begin_write().map_err(map_err!(Storage))?;
            // Opening tables in a write transaction creates them if absent.
            txn.open_table(KV_TABLE).map_err(map_err!(Storage))?;
            txn.open_table(META_TABLE).map_err(map_err!(Storage))?;
            txn.commit().map_err(map_err!(Storage))?;

            let txn = db.begin_read().map_err(map_err!(Storage))?;
            let table = txn.open_table(KV_TABLE).map_err(map_err!(Storage))?;
            for entry in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                let val: KvVal =
                    serde_json::from_str(value.value()).map_err(map_err!(Serialize))?;
                data.insert(key.value().to_string(), val);
            }
            let meta = txn.open_table(META_TABLE).map_err(map_err!(Storage))?;
            if let Some(stored) = meta.get(META_REV).map_err(map_err!(Storage))? {
                rev = stored.value();
            }
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                data,
                rev,
                leases: HashMap::new(),
                next_lease_id: 1,
                watchers: Vec::new(),
            })),
            db,
        })
    }

    /// Current revision.
    pub fn rev(&self) -> u64 {
        self.inner.lock().rev
    }

    /// Read a key's current record.
    pub fn get(&self, key: &str) -> Option<KvVal> {
        self.inner.lock().data.get(key).cloned()
    }

    /// List all records under a prefix, in key order.
    pub fn list(&self, prefix: &str) -> Vec<(String, KvVal)> {
        let inner = self.inner.lock();
        inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Create a key; fails if it exists.
    pub fn create(&self, key: &str, value: &str) -> KvResult<u64> {
        self.commit_one(key, value, None, Some(false))
    }

    /// Update a key; fails if it does not exist.
    pub fn update(&self, key: &str, value: &str) -> KvResult<u64> {
        self.commit_one(key, value, None, Some(true))
    }

    /// Create or update a key, optionally attaching a lease.
    pub fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> KvResult<u64> {
        self.commit_one(key, value, lease, None)
    }

    fn commit_one(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        must_exist: Option<bool>,
    ) -> KvResult<u64> {
        let mut writes = BTreeMap::new();
        writes.insert(
            key.to_string(),
            PendingWrite::Put {
                value: value.to_string(),
                lease,
            },
        );
        let mut inner = self.inner.lock();
        match must_exist {
            Some(true) if !inner.data.contains_key(key) => {
                return Err(KvError::KeyNotFound(key.to_string()))
            }
            Some(false) if inner.data.contains_key(key) => {
                return Err(KvError::KeyExists(key.to_string()))
            }
            _ => {}
        }
        let (rev, dispatch) = self.apply_locked(&mut inner, writes)?;
        drop(inner);
        Self::dispatch(dispatch);
        Ok(rev)
    }

    /// Delete a key. Returns the commit revision, or None if absent.
    pub fn delete(&self, key: &str) -> KvResult<Option<u64>> {
        let mut inner = self.inner.lock();
        if !inner.data.contains_key(key) {
            return Ok(None);
        }
        let mut writes = BTreeMap::new();
        writes.insert(key.to_string(), PendingWrite::Del);
        let (rev, dispatch) = self.apply_locked(&mut inner, writes)?;
        drop(inner);
        Self::dispatch(dispatch);
        Ok(Some(rev))
    }

    /// Validate an STM read set and apply its writes atomically. Returns
    /// the commit revision, or None on conflict (caller retries).
    pub(crate) fn commit_txn(
        &self,
        reads: &HashMap<String, u64>,
        writes: BTreeMap<String, PendingWrite>,
    ) -> KvResult<Option<u64>> {
        let mut inner = self.inner.lock();
        for (key, observed_rev) in reads {
            let current = inner.data.get(key).map(|v| v.mod_rev).unwrap_or(0);
            if current != *observed_rev {
                return Ok(None);
            }
        }
        if writes.is_empty() {
            // Read-only transaction; nothing to publish.
            return Ok(Some(inner.rev));
        }
        let (rev, dispatch) = self.apply_locked(&mut inner, writes)?;
        drop(inner);
        Self::dispatch(dispatch);
        Ok(Some(rev))
    }

    /// Apply a batch of writes at a single new revision and persist them.
    /// Returns the watch events to dispatch once the lock is released.
    #[allow(clippy::type_complexity)]
    fn apply_locked(
        &self,
        inner: &mut Inner,
        writes: BTreeMap<String, PendingWrite>,
    ) -> KvResult<(u64, Vec<(mpsc::UnboundedSender<KvEvent>, Vec<KvEvent>)>)> {
        let rev = inner.rev + 1;
        let mut events = Vec::with_capacity(writes.len());
        let mut new_vals: Vec<(String, Option<KvVal>)> = Vec::with_capacity(writes.len());

        for (key, write) in &writes {
            match write {
                PendingWrite::Put { value, lease } => {
                    if let Some(id) = lease {
                        if !inner.leases.contains_key(id) {
                            return Err(KvError::LeaseNotFound(*id));
                        }
                    }
                    let val = match inner.data.get(key) {
                        Some(old) => KvVal {
                            value: value.clone(),
                            create_rev: old.create_rev,
                            mod_rev: rev,
                            version: old.version + 1,
                            lease_id: lease.or(old.lease_id),
                        },
                        None => KvVal {
                            value: value.clone(),
                            create_rev: rev,
                            mod_rev: rev,
                            version: 1,
                            lease_id: *lease,
                        },
                    };
                    new_vals.push((key.clone(), Some(val)));
                }
                PendingWrite::Del => {
                    new_vals.push((key.clone(), None));
                }
            }
        }

        self.persist(rev, &new_vals)?;

        for (key, val) in new_vals {
            match val {
                Some(val) => {
                    if let Some(id) = val.lease_id {
                        if let Some(lease) = inner.leases.get_mut(&id) {
                            lease.keys.insert(key.clone());
                        }
                    }
                    events.push(KvEvent {
                        key: key.clone(),
                        value: Some(val.value.clone()),
                        rev,
                    });
                    inner.data.insert(key, val);
                }
                None => {
                    if let Some(old) = inner.data.remove(&key) {
                        if let Some(id) = old.lease_id {
                            if let Some(lease) = inner.leases.get_mut(&id) {
                                lease.keys.remove(&key);
                            }
                        }
                    }
                    events.push(KvEvent {
                        key,
                        value: None,
                        rev,
                    });
                }
            }
        }
        inner.rev = rev;

        let send_list: Vec<(mpsc::UnboundedSender<KvEvent>, Vec<KvEvent>)> = inner
            .watchers
            .iter()
            .map(|w| {
                let matched: Vec<KvEvent> = events
                    .iter()
                    .filter(|e| e.key.starts_with(&w.prefix))
                    .cloned()
                    .collect();
                (w.tx.clone(), matched)
            })
            .collect();
        inner.watchers.retain(|w| !w.tx.is_closed());

        Ok((rev, send_list))
    }

    fn dispatch(send_list: Vec<(mpsc::UnboundedSender<KvEvent>, Vec<KvEvent>)>) {
        for (tx, matched) in send_list {
            for event in matched {
                let _ = tx.send(event);
            }
        }
    }

    fn persist(&self, rev: u64, vals: &[(String, Option<KvVal>)]) -> KvResult<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let txn = db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(KV_TABLE).map_err(map_err!(Storage))?;
            for (key, val) in vals {
                match val {
                    Some(val) => {
                        let json = serde_json::to_string(val).map_err(map_err!(Serialize))?;
                        table
                            .insert(key.as_str(), json.as_str())
                            .map_err(map_err!(Storage))?;
                    }
                    None => {
                        table.remove(key.as_str()).map_err(map_err!(Storage))?;
                    }
                }
            }
            let mut meta = txn.open_table(META_TABLE).map_err(map_err!(Storage))?;
            meta.insert(META_REV, rev).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant a lease expiring `ttl_secs` after `now`.
    pub fn lease_grant(&self, ttl_secs: u64, now: u64) -> LeaseId {
        let mut inner = self.inner.lock();
        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            id,
            Lease {
                expires_at: now + ttl_secs,
                ttl_secs,
                keys: HashSet::new(),
            },
        );
        id
    }

    /// Refresh a lease's expiry.
    pub fn lease_keepalive(&self, id: LeaseId, now: u64) -> KvResult<()> {
        let mut inner = self.inner.lock();
        let lease = inner
            .leases
            .get_mut(&id)
            .ok_or(KvError::LeaseNotFound(id))?;
        lease.expires_at = now + lease.ttl_secs;
        Ok(())
    }

    /// Revoke a lease and delete its attached keys.
    pub fn lease_revoke(&self, id: LeaseId) -> KvResult<Vec<String>> {
        let keys = {
            let mut inner = self.inner.lock();
            match inner.leases.remove(&id) {
                Some(lease) => lease.keys.into_iter().collect::<Vec<_>>(),
                None => return Err(KvError::LeaseNotFound(id)),
            }
        };
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys)
    }

    /// Delete the keys of every lease that lapsed at or before `now`.
    /// Returns the deleted keys.
    pub fn sweep_expired_leases(&self, now: u64) -> KvResult<Vec<String>> {
        let expired: Vec<LeaseId> = {
            let inner = self.inner.lock();
            inner
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut deleted = Vec::new();
        for id in expired {
            match self.lease_revoke(id) {
                Ok(mut keys) => deleted.append(&mut keys),
                Err(e) => warn!(lease = id, error = %e, "lease revoke during sweep failed"),
            }
        }
        Ok(deleted)
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Subscribe to all committed changes under a prefix. Events arrive
    /// in commit order; the stream never replays history.
    pub fn watch(&self, prefix: &str) -> mpsc::UnboundedReceiver<KvEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_update_delete_bump_revisions() {
        let store = KvStore::open_in_memory();
        assert_eq!(store.rev(), 0);

        let rev1 = store.create("App/a", "{}").unwrap();
        assert_eq!(rev1, 1);
        let val = store.get("App/a").unwrap();
        assert_eq!(val.create_rev, 1);
        assert_eq!(val.mod_rev, 1);
        assert_eq!(val.version, 1);

        let rev2 = store.update("App/a", r#"{"x":1}"#).unwrap();
        assert_eq!(rev2, 2);
        let val = store.get("App/a").unwrap();
        assert_eq!(val.create_rev, 1);
        assert_eq!(val.mod_rev, 2);
        assert_eq!(val.version, 2);

        assert_eq!(store.delete("App/a").unwrap(), Some(3));
        assert!(store.get("App/a").is_none());
        assert_eq!(store.delete("App/a").unwrap(), None);
    }

    #[test]
    fn create_fails_on_existing_update_on_missing() {
        let store = KvStore::open_in_memory();
        store.create("k", "v").unwrap();
        assert!(matches!(
            store.create("k", "v"),
            Err(KvError::KeyExists(_))
        ));
        assert!(matches!(
            store.update("missing", "v"),
            Err(KvError::KeyNotFound(_))
        ));
    }

    #[test]
    fn list_returns_prefix_in_order() {
        let store = KvStore::open_in_memory();
        store.create("App/b", "2").unwrap();
        store.create("App/a", "1").unwrap();
        store.create("Zone/z", "3").unwrap();

        let apps = store.list("App/");
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].0, "App/a");
        assert_eq!(apps[1].0, "App/b");
    }

    #[tokio::test]
    async fn watch_sees_committed_changes() {
        let store = KvStore::open_in_memory();
        let mut rx = store.watch("App/");

        store.create("App/a", "1").unwrap();
        store.create("Zone/z", "2").unwrap();
        store.delete("App/a").unwrap();

        let e1 = rx.recv().await.unwrap();
        assert_eq!(e1.key, "App/a");
        assert_eq!(e1.value.as_deref(), Some("1"));
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e2.key, "App/a");
        assert!(e2.value.is_none());
        assert!(e2.rev > e1.rev);
    }

    #[test]
    fn leased_keys_expire_on_sweep() {
        let store = KvStore::open_in_memory();
        let lease = store.lease_grant(30, 100);
        store.put("CloudletInfo/x", "{}", Some(lease)).unwrap();

        // Not yet expired.
        assert!(store.sweep_expired_leases(120).unwrap().is_empty());
        assert!(store.get("CloudletInfo/x").is_some());

        // Keepalive pushes expiry out.
        store.lease_keepalive(lease, 120).unwrap();
        assert!(store.sweep_expired_leases(140).unwrap().is_empty());

        let deleted = store.sweep_expired_leases(200).unwrap();
        assert_eq!(deleted, vec!["CloudletInfo/x".to_string()]);
        assert!(store.get("CloudletInfo/x").is_none());
    }

    #[test]
    fn lease_revoke_deletes_keys() {
        let store = KvStore::open_in_memory();
        let lease = store.lease_grant(30, 0);
        store.put("a", "1", Some(lease)).unwrap();
        store.put("b", "2", Some(lease)).unwrap();

        let mut keys = store.lease_revoke(lease).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(store.get("a").is_none());
        assert!(matches!(
            store.lease_revoke(lease),
            Err(KvError::LeaseNotFound(_))
        ));
    }

    #[test]
    fn put_with_unknown_lease_fails() {
        let store = KvStore::open_in_memory();
        assert!(matches!(
            store.put("k", "v", Some(99)),
            Err(KvError::LeaseNotFound(99))
        ));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        {
            let store = KvStore::open(&path).unwrap();
            store.create("App/a", "persisted").unwrap();
            store.create("App/b", "also").unwrap();
            store.delete("App/b").unwrap();
        }
        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get("App/a").unwrap().value, "persisted");
        assert!(store.get("App/b").is_none());
        assert_eq!(store.rev(), 3);
    }
}
