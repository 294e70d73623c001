//! The cache sync loop.
//!
//! Follows the KV store's watch stream and applies every committed
//! change to the registered caches, then advances the revision
//! watermark. [`Sync::apply_stm_wait`] commits a transaction and waits
//! for the watermark to reach the commit revision, so handlers see their
//! own writes on subsequent cache reads.

use std::sync::Arc;

use edgegrid_kv::{apply_stm, KvError, KvStore, Stm};
use edgegrid_model::Obj;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::Cache;

/// Type-erased cache fed by the sync loop.
pub trait CacheSink: Send + ::std::marker::Sync {
    /// Path prefix this sink owns, e.g. `"App/"`.
    fn type_prefix(&self) -> String;
    /// Apply one change; `value` is None for deletions.
    fn apply(&self, key_json: &str, value: Option<&str>);
}

impl<T: Obj> CacheSink for Cache<T> {
    fn type_prefix(&self) -> String {
        format!("{}/", T::TYPE)
    }

    fn apply(&self, key_json: &str, value: Option<&str>) {
        match value {
            Some(value) => match serde_json::from_str::<T>(value) {
                Ok(obj) => self.update(obj),
                Err(e) => warn!(typ = T::TYPE, error = %e, "dropping unparseable cache update"),
            },
            None => match serde_json::from_str::<T::Key>(key_json) {
                Ok(key) => self.delete(&key),
                Err(e) => warn!(typ = T::TYPE, error = %e, "dropping unparseable cache delete"),
            },
        }
    }
}

/// The sync layer: KV handle, registered caches, revision watermark.
pub struct Sync {
    kv: KvStore,
    sinks: Mutex<Vec<Arc<dyn CacheSink>>>,
    watermark_tx: watch::Sender<u64>,
    watermark_rx: watch::Receiver<u64>,
}

impl Sync {
    pub fn new(kv: KvStore) -> Arc<Self> {
        let (watermark_tx, watermark_rx) = watch::channel(0);
        Arc::new(Self {
            kv,
            sinks: Mutex::new(Vec::new()),
            watermark_tx,
            watermark_rx,
        })
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Register a cache to be kept current. Call before [`Self::start`].
    pub fn register_cache<T: Obj>(&self, cache: &Cache<T>) {
        self.sinks.lock().push(Arc::new(cache.clone()));
    }

    /// Load all registered caches and follow the change stream until
    /// `shutdown` flips. Returns the spawned task handle.
    pub fn start(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let sync = Arc::clone(self);
        // Subscribe before the initial load so no commit is missed;
        // replayed events are idempotent on the caches.
        let mut events = sync.kv.watch("");
        let sinks: Vec<Arc<dyn CacheSink>> = sync.sinks.lock().clone();
        for sink in &sinks {
            let prefix = sink.type_prefix();
            for (path, val) in sync.kv.list(&prefix) {
                sink.apply(&path[prefix.len()..], Some(&val.value));
            }
        }
        let _ = sync.watermark_tx.send(sync.kv.rev());
        debug!(rev = sync.kv.rev(), "cache sync initial load complete");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        for sink in &sinks {
                            let prefix = sink.type_prefix();
                            if let Some(key_json) = event.key.strip_prefix(prefix.as_str()) {
                                sink.apply(key_json, event.value.as_deref());
                                break;
                            }
                        }
                        sync.watermark_tx.send_if_modified(|cur| {
                            if event.rev > *cur {
                                *cur = event.rev;
                                true
                            } else {
                                false
                            }
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("cache sync loop stopped");
        })
    }

    /// Wait until the caches have observed `rev`.
    pub async fn wait_for_rev(&self, rev: u64) {
        let mut rx = self.watermark_rx.clone();
        while *rx.borrow() < rev {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run an STM transaction and wait for the local caches to observe
    /// the committed revision (read-your-writes for the caller).
    pub async fn apply_stm_wait<E, F>(&self, max_retries: u32, f: F) -> Result<u64, E>
    where
        E: From<KvError>,
        F: FnMut(&mut Stm) -> Result<(), E>,
    {
        let rev = apply_stm(&self.kv, max_retries, f)?;
        self.wait_for_rev(rev).await;
        Ok(rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjStore;
    use edgegrid_model::{Zone, ZoneKey};

    fn zone(name: &str) -> Zone {
        Zone {
            key: ZoneKey::new("op", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stm_wait_gives_read_your_writes() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv.clone());
        let cache: Cache<Zone> = Cache::new();

        let sync = Sync::new(kv);
        sync.register_cache(&cache);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = sync.start(shutdown_rx);

        sync.apply_stm_wait::<KvError, _>(32, |stm| {
            store.stm_put(stm, &zone("a")).unwrap();
            Ok(())
        })
        .await
        .unwrap();

        // The cache has observed the commit by the time we return.
        assert!(cache.has_key(&ZoneKey::new("op", "a")));

        sync.apply_stm_wait::<KvError, _>(32, |stm| {
            store.stm_del(stm, &ZoneKey::new("op", "a"));
            Ok(())
        })
        .await
        .unwrap();
        assert!(!cache.has_key(&ZoneKey::new("op", "a")));
    }

    #[tokio::test]
    async fn initial_load_populates_cache() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv.clone());
        store.put(&zone("preexisting")).unwrap();

        let cache: Cache<Zone> = Cache::new();
        let sync = Sync::new(kv);
        sync.register_cache(&cache);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = sync.start(shutdown_rx);

        assert!(cache.has_key(&ZoneKey::new("op", "preexisting")));
    }
}
