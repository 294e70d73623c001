//! The notify client.
//!
//! Applies a server's message stream into local caches using the caches'
//! sync-list semantics, so a reconnect (which replays the full state)
//! prunes anything deleted while the link was down.

use std::collections::HashMap;
use std::sync::Arc;

use edgegrid_model::Obj;
use edgegrid_store::cache::Cache;
use edgegrid_store::sync::CacheSink;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::NotifyMsg;

/// Receives a notify stream into registered caches.
pub struct NotifyClient {
    sinks: HashMap<String, Arc<dyn ReceiverSink>>,
}

/// Cache operations the client needs, type-erased.
trait ReceiverSink: Send + Sync {
    fn apply(&self, key_json: &str, value: Option<&str>);
    fn sync_start(&self);
    fn sync_end(&self);
}

struct CacheReceiver<T: Obj> {
    cache: Cache<T>,
}

impl<T: Obj> ReceiverSink for CacheReceiver<T> {
    fn apply(&self, key_json: &str, value: Option<&str>) {
        CacheSink::apply(&self.cache, key_json, value);
    }
    fn sync_start(&self) {
        self.cache.sync_list_start();
    }
    fn sync_end(&self) {
        let pruned = self.cache.sync_list_end();
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned stale objects after resync");
        }
    }
}

impl Default for NotifyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyClient {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
        }
    }

    /// Mirror one type from the server into `cache`.
    pub fn register_recv_cache<T: Obj>(&mut self, cache: &Cache<T>) {
        self.sinks.insert(
            T::TYPE.to_string(),
            Arc::new(CacheReceiver {
                cache: cache.clone(),
            }),
        );
    }

    /// Apply one message.
    pub fn apply(&self, msg: &NotifyMsg) {
        let typ = match msg {
            NotifyMsg::SyncListStart { typ }
            | NotifyMsg::SyncListEnd { typ }
            | NotifyMsg::Update { typ, .. }
            | NotifyMsg::Delete { typ, .. } => typ.as_str(),
        };
        let Some(sink) = self.sinks.get(typ) else {
            warn!(typ, "no receive cache registered for notify type");
            return;
        };
        match msg {
            NotifyMsg::SyncListStart { .. } => sink.sync_start(),
            NotifyMsg::SyncListEnd { .. } => sink.sync_end(),
            NotifyMsg::Update {
                key_json, value, ..
            } => sink.apply(key_json, Some(value)),
            NotifyMsg::Delete { key_json, .. } => sink.apply(key_json, None),
        }
    }

    /// Drain a stream until it closes.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<NotifyMsg>) {
        while let Some(msg) = rx.recv().await {
            self.apply(&msg);
        }
        debug!("notify stream closed");
    }
}
