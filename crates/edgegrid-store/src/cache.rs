//! In-memory object caches.
//!
//! A cache mirrors one object type from the store, fed by the sync loop.
//! Change callbacks and key watchers fire after the cache mutex is
//! released, in local apply order. Scans never hold the lock while
//! calling out: they copy keys first, then act.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use edgegrid_model::Obj;
use parking_lot::Mutex;

type UpdatedCb<T> = Arc<dyn Fn(Option<&T>, &T) + Send + Sync>;
type DeletedCb<T> = Arc<dyn Fn(&T) + Send + Sync>;
type NotifyCb<K> = Arc<dyn Fn(&K) + Send + Sync>;
type KeyWatchCb = Arc<dyn Fn() + Send + Sync>;

struct CacheInner<T: Obj> {
    objs: BTreeMap<T::Key, T>,
    key_watchers: HashMap<T::Key, Vec<(u64, KeyWatchCb)>>,
    next_watcher_id: u64,
    updated_cbs: Vec<UpdatedCb<T>>,
    deleted_cbs: Vec<DeletedCb<T>>,
    notify_cbs: Vec<NotifyCb<T::Key>>,
    /// Keys seen during an in-progress full resync.
    sync_seen: Option<HashSet<T::Key>>,
}

/// A mirror of one object type, safe to share across tasks.
pub struct Cache<T: Obj> {
    inner: Arc<Mutex<CacheInner<T>>>,
}

impl<T: Obj> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Obj> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Obj> Cache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                objs: BTreeMap::new(),
                key_watchers: HashMap::new(),
                next_watcher_id: 1,
                updated_cbs: Vec::new(),
                deleted_cbs: Vec::new(),
                notify_cbs: Vec::new(),
                sync_seen: None,
            })),
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.inner.lock().objs.get(key).cloned()
    }

    pub fn has_key(&self, key: &T::Key) -> bool {
        self.inner.lock().objs.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().objs.len()
    }

    /// Copy the keys of all objects matching `pred`. Callers act on the
    /// copies after the lock is gone; never call APIs from inside `pred`.
    pub fn keys_filtered(&self, pred: impl Fn(&T) -> bool) -> Vec<T::Key> {
        let inner = self.inner.lock();
        inner
            .objs
            .iter()
            .filter(|(_, obj)| pred(obj))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Visit matching objects with cloned copies, without holding the
    /// lock during `cb`.
    pub fn show(&self, filter: impl Fn(&T) -> bool, mut cb: impl FnMut(&T)) {
        let matches: Vec<T> = {
            let inner = self.inner.lock();
            inner.objs.values().filter(|o| filter(o)).cloned().collect()
        };
        for obj in &matches {
            cb(obj);
        }
    }

    // ── Change application (sync loop / notify client) ─────────────

    /// Insert or replace an object, then run callbacks.
    pub fn update(&self, obj: T) {
        let key = obj.key().clone();
        let (old, updated_cbs, notify_cbs, watchers) = {
            let mut inner = self.inner.lock();
            if let Some(seen) = &mut inner.sync_seen {
                seen.insert(key.clone());
            }
            let old = inner.objs.insert(key.clone(), obj.clone());
            (
                old,
                inner.updated_cbs.clone(),
                inner.notify_cbs.clone(),
                inner.watchers_for(&key),
            )
        };
        for cb in &updated_cbs {
            cb(old.as_ref(), &obj);
        }
        for cb in &notify_cbs {
            cb(&key);
        }
        for cb in &watchers {
            cb();
        }
    }

    /// Remove an object, then run callbacks. Idempotent.
    pub fn delete(&self, key: &T::Key) {
        let (old, deleted_cbs, notify_cbs, watchers) = {
            let mut inner = self.inner.lock();
            let Some(old) = inner.objs.remove(key) else {
                return;
            };
            (
                old,
                inner.deleted_cbs.clone(),
                inner.notify_cbs.clone(),
                inner.watchers_for(key),
            )
        };
        for cb in &deleted_cbs {
            cb(&old);
        }
        for cb in &notify_cbs {
            cb(key);
        }
        for cb in &watchers {
            cb();
        }
    }

    /// Begin a full resync: keys not re-sent before [`Self::sync_list_end`]
    /// are treated as deleted.
    pub fn sync_list_start(&self) {
        self.inner.lock().sync_seen = Some(HashSet::new());
    }

    /// Finish a full resync, pruning absent keys. Returns the pruned keys.
    pub fn sync_list_end(&self) -> Vec<T::Key> {
        let stale: Vec<T::Key> = {
            let mut inner = self.inner.lock();
            let Some(seen) = inner.sync_seen.take() else {
                return Vec::new();
            };
            inner
                .objs
                .keys()
                .filter(|k| !seen.contains(*k))
                .cloned()
                .collect()
        };
        for key in &stale {
            self.delete(key);
        }
        stale
    }

    /// Remove all objects matching `pred` (with callbacks). Used to flush
    /// a disconnected subscriber's ephemeral records. Idempotent.
    pub fn flush_filtered(&self, pred: impl Fn(&T) -> bool) -> Vec<T::Key> {
        let keys = self.keys_filtered(pred);
        for key in &keys {
            self.delete(key);
        }
        keys
    }

    // ── Callbacks ──────────────────────────────────────────────────

    /// Run on every insert/replace: (old, new).
    pub fn on_updated(&self, cb: impl Fn(Option<&T>, &T) + Send + Sync + 'static) {
        self.inner.lock().updated_cbs.push(Arc::new(cb));
    }

    /// Run on every removal with the removed object.
    pub fn on_deleted(&self, cb: impl Fn(&T) + Send + Sync + 'static) {
        self.inner.lock().deleted_cbs.push(Arc::new(cb));
    }

    /// Run once per changed key, after updated/deleted callbacks.
    pub fn on_notify(&self, cb: impl Fn(&T::Key) + Send + Sync + 'static) {
        self.inner.lock().notify_cbs.push(Arc::new(cb));
    }

    /// Watch a single key. The callback fires on any change to that key;
    /// the returned handle cancels idempotently from any thread.
    pub fn watch_key(&self, key: &T::Key, cb: impl Fn() + Send + Sync + 'static) -> WatchCancel {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            inner
                .key_watchers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(cb)));
            id
        };
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        WatchCancel {
            cancel: Arc::new(Mutex::new(Some(Box::new(move || {
                let mut inner = inner.lock();
                if let Some(watchers) = inner.key_watchers.get_mut(&key) {
                    watchers.retain(|(wid, _)| *wid != id);
                    if watchers.is_empty() {
                        inner.key_watchers.remove(&key);
                    }
                }
            })))),
        }
    }
}

impl<T: Obj> CacheInner<T> {
    fn watchers_for(&self, key: &T::Key) -> Vec<KeyWatchCb> {
        self.key_watchers
            .get(key)
            .map(|ws| ws.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

/// Cancels a key watch. Safe to call repeatedly and from any thread.
#[derive(Clone)]
pub struct WatchCancel {
    cancel: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl WatchCancel {
    pub fn cancel(&self) {
        if let Some(f) = self.cancel.lock().take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_model::{Zone, ZoneKey};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn zone(name: &str) -> Zone {
        Zone {
            key: ZoneKey::new("op", name),
            ..Default::default()
        }
    }

    #[test]
    fn update_get_delete() {
        let cache: Cache<Zone> = Cache::new();
        cache.update(zone("a"));
        assert!(cache.has_key(&ZoneKey::new("op", "a")));
        assert_eq!(cache.count(), 1);
        cache.delete(&ZoneKey::new("op", "a"));
        assert!(!cache.has_key(&ZoneKey::new("op", "a")));
        // Idempotent.
        cache.delete(&ZoneKey::new("op", "a"));
    }

    #[test]
    fn callbacks_fire_per_change() {
        let cache: Cache<Zone> = Cache::new();
        let updates = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        let notifies = Arc::new(AtomicUsize::new(0));

        let u = Arc::clone(&updates);
        cache.on_updated(move |old, new| {
            if old.is_none() {
                assert!(!new.key.name.is_empty());
            }
            u.fetch_add(1, Ordering::SeqCst);
        });
        let d = Arc::clone(&deletes);
        cache.on_deleted(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let n = Arc::clone(&notifies);
        cache.on_notify(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        cache.update(zone("a"));
        cache.update(zone("a"));
        cache.delete(&ZoneKey::new("op", "a"));

        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert_eq!(notifies.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callbacks_may_reenter_cache() {
        // Callbacks run after the mutex is released, so reading the
        // cache from inside one must not deadlock.
        let cache: Cache<Zone> = Cache::new();
        let cache2 = cache.clone();
        cache.on_updated(move |_, new| {
            assert!(cache2.has_key(&new.key));
        });
        cache.update(zone("a"));
    }

    #[test]
    fn key_watcher_fires_and_cancels() {
        let cache: Cache<Zone> = Cache::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let cancel = cache.watch_key(&ZoneKey::new("op", "a"), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        cache.update(zone("a"));
        cache.update(zone("b")); // different key, no fire
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        cancel.cancel();
        cancel.cancel(); // idempotent
        cache.update(zone("a"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_list_prunes_absent_keys() {
        let cache: Cache<Zone> = Cache::new();
        cache.update(zone("a"));
        cache.update(zone("b"));

        cache.sync_list_start();
        cache.update(zone("b"));
        cache.update(zone("c"));
        let pruned = cache.sync_list_end();

        assert_eq!(pruned, vec![ZoneKey::new("op", "a")]);
        assert!(!cache.has_key(&ZoneKey::new("op", "a")));
        assert!(cache.has_key(&ZoneKey::new("op", "b")));
        assert!(cache.has_key(&ZoneKey::new("op", "c")));
        // No resync in progress: no-op.
        assert!(cache.sync_list_end().is_empty());
    }

    #[test]
    fn flush_filtered_removes_matches() {
        let cache: Cache<Zone> = Cache::new();
        cache.update(zone("keep"));
        cache.update(zone("drop1"));
        cache.update(zone("drop2"));

        let flushed = cache.flush_filtered(|z| z.key.name.starts_with("drop"));
        assert_eq!(flushed.len(), 2);
        assert_eq!(cache.count(), 1);
    }
}
