//! The notify server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use edgegrid_model::{Obj, ObjKey};
use edgegrid_store::Cache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One message on a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMsg {
    /// Begin a full resync of one type; absent keys are deletions.
    SyncListStart { typ: String },
    Update {
        typ: String,
        key_json: String,
        value: String,
    },
    Delete { typ: String, key_json: String },
    SyncListEnd { typ: String },
}

/// Handles updates a subscriber sends back up (site-reported objects).
pub trait UpstreamHandler: Send + Sync + 'static {
    fn typ(&self) -> &'static str;
    fn handle(&self, notify_id: i64, value: &str);
    /// The subscriber that reported through this handler went away.
    fn flush(&self, notify_id: i64);
}

/// A snapshot source for the full sync list at connect.
trait DumpSource: Send + Sync {
    fn typ(&self) -> &'static str;
    fn dump(&self) -> Vec<(String, String)>;
}

struct CacheDump<T: Obj> {
    cache: Cache<T>,
}

impl<T: Obj> DumpSource for CacheDump<T> {
    fn typ(&self) -> &'static str {
        T::TYPE
    }

    fn dump(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.cache.show(
            |_| true,
            |obj| {
                if let Ok(value) = serde_json::to_string(obj) {
                    out.push((obj.key().key_string(), value));
                }
            },
        );
        out
    }
}

struct Inner {
    subscribers: Mutex<HashMap<i64, mpsc::UnboundedSender<NotifyMsg>>>,
    sources: Mutex<Vec<Arc<dyn DumpSource>>>,
    upstream: Mutex<Vec<Arc<dyn UpstreamHandler>>>,
}

/// Broadcasts registered caches to connected subscribers.
#[derive(Clone)]
pub struct NotifyServer {
    inner: Arc<Inner>,
    next_id: Arc<AtomicI64>,
}

impl Default for NotifyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                sources: Mutex::new(Vec::new()),
                upstream: Mutex::new(Vec::new()),
            }),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Ship this cache to subscribers: full list at connect, then every
    /// change as it happens.
    pub fn register_send_cache<T: Obj>(&self, cache: &Cache<T>) {
        self.inner.sources.lock().push(Arc::new(CacheDump {
            cache: cache.clone(),
        }));

        let inner = Arc::clone(&self.inner);
        cache.on_updated(move |_old, new| {
            if let Ok(value) = serde_json::to_string(new) {
                broadcast(
                    &inner,
                    NotifyMsg::Update {
                        typ: T::TYPE.to_string(),
                        key_json: new.key().key_string(),
                        value,
                    },
                );
            }
        });
        let inner = Arc::clone(&self.inner);
        cache.on_deleted(move |old| {
            broadcast(
                &inner,
                NotifyMsg::Delete {
                    typ: T::TYPE.to_string(),
                    key_json: old.key().key_string(),
                },
            );
        });
    }

    /// Accept site-reported objects of one type.
    pub fn register_upstream(&self, handler: Arc<dyn UpstreamHandler>) {
        self.inner.upstream.lock().push(handler);
    }

    /// Connect a subscriber: returns its notify id and message stream.
    /// The full state of every registered cache is queued first.
    pub fn connect(&self) -> (i64, mpsc::UnboundedReceiver<NotifyMsg>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        for source in self.inner.sources.lock().iter() {
            let typ = source.typ().to_string();
            let _ = tx.send(NotifyMsg::SyncListStart { typ: typ.clone() });
            for (key_json, value) in source.dump() {
                let _ = tx.send(NotifyMsg::Update {
                    typ: typ.clone(),
                    key_json,
                    value,
                });
            }
            let _ = tx.send(NotifyMsg::SyncListEnd { typ });
        }

        self.inner.subscribers.lock().insert(id, tx);
        debug!(notify_id = id, "notify subscriber connected");
        (id, rx)
    }

    /// Drop a subscriber and run the flush hooks so its ephemeral
    /// records can be cleaned up.
    pub fn disconnect(&self, notify_id: i64) {
        let removed = self.inner.subscribers.lock().remove(&notify_id).is_some();
        if !removed {
            return;
        }
        debug!(notify_id, "notify subscriber disconnected, flushing");
        let handlers: Vec<Arc<dyn UpstreamHandler>> = self.inner.upstream.lock().clone();
        for handler in handlers {
            handler.flush(notify_id);
        }
    }

    /// A subscriber reports an object upward.
    pub fn handle_upstream(&self, notify_id: i64, typ: &str, value: &str) {
        let handlers: Vec<Arc<dyn UpstreamHandler>> = self.inner.upstream.lock().clone();
        for handler in &handlers {
            if handler.typ() == typ {
                handler.handle(notify_id, value);
                return;
            }
        }
        warn!(typ, "no upstream handler for reported object");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

fn broadcast(inner: &Inner, msg: NotifyMsg) {
    let mut dead = Vec::new();
    {
        let subscribers = inner.subscribers.lock();
        for (id, tx) in subscribers.iter() {
            if tx.send(msg.clone()).is_err() {
                dead.push(*id);
            }
        }
    }
    if !dead.is_empty() {
        let mut subscribers = inner.subscribers.lock();
        for id in dead {
            subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_model::{Zone, ZoneKey};

    fn zone(name: &str) -> Zone {
        Zone {
            key: ZoneKey::new("op", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_receives_full_list_then_increments() {
        let cache: Cache<Zone> = Cache::new();
        let server = NotifyServer::new();
        server.register_send_cache(&cache);

        cache.update(zone("pre-existing"));
        let (_id, mut rx) = server.connect();

        assert_eq!(
            rx.recv().await.unwrap(),
            NotifyMsg::SyncListStart {
                typ: "Zone".to_string()
            }
        );
        assert!(matches!(rx.recv().await.unwrap(), NotifyMsg::Update { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            NotifyMsg::SyncListEnd {
                typ: "Zone".to_string()
            }
        );

        cache.update(zone("incremental"));
        assert!(matches!(rx.recv().await.unwrap(), NotifyMsg::Update { .. }));
        cache.delete(&ZoneKey::new("op", "incremental"));
        assert!(matches!(rx.recv().await.unwrap(), NotifyMsg::Delete { .. }));
    }

    #[tokio::test]
    async fn disconnect_runs_flush_hooks() {
        struct Recorder {
            flushed: Mutex<Vec<i64>>,
        }
        impl UpstreamHandler for Arc<Recorder> {
            fn typ(&self) -> &'static str {
                "CloudletInfo"
            }
            fn handle(&self, _notify_id: i64, _value: &str) {}
            fn flush(&self, notify_id: i64) {
                self.flushed.lock().push(notify_id);
            }
        }

        let server = NotifyServer::new();
        let recorder = Arc::new(Recorder {
            flushed: Mutex::new(Vec::new()),
        });
        server.register_upstream(Arc::new(Arc::clone(&recorder)));

        let (id, _rx) = server.connect();
        assert_eq!(server.subscriber_count(), 1);
        server.disconnect(id);
        assert_eq!(server.subscriber_count(), 0);
        assert_eq!(recorder.flushed.lock().as_slice(), &[id]);

        // Idempotent: flushing again does nothing.
        server.disconnect(id);
        assert_eq!(recorder.flushed.lock().len(), 1);
    }
}
