//! Background workers.
//!
//! The idle reaper deletes reservable autoclusters that have sat
//! unreserved past the settings timeout. [`WorkQueue`] is the shared
//! needs-work primitive: callers enqueue keys, duplicates coalesce, and
//! a single task drains them.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use edgegrid_model::{epoch_secs, CrmOverride};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::controller::Controller;

/// Coalescing work queue: a key enqueued while already pending is
/// dropped, so bursts collapse into one run.
pub struct WorkQueue<K: Eq + Hash + Clone + Send + 'static> {
    tx: mpsc::UnboundedSender<K>,
    pending: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> WorkQueue<K> {
    /// Start the worker task; `handler` runs once per distinct pending
    /// key.
    pub fn start<F, Fut>(handler: F) -> (Self, tokio::task::JoinHandle<()>)
    where
        F: Fn(K) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<K>();
        let pending: Arc<Mutex<HashSet<K>>> = Arc::new(Mutex::new(HashSet::new()));
        let pending_task = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                pending_task.lock().remove(&key);
                handler(key).await;
            }
        });
        (Self { tx, pending }, handle)
    }

    /// Request work for a key. No-op if the key is already pending.
    pub fn needs_work(&self, key: K) {
        if self.pending.lock().insert(key.clone()) {
            let _ = self.tx.send(key);
        }
    }
}

impl Controller {
    pub(crate) fn spawn_idle_reaper(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        me.run_idle_reaper_once(epoch_secs()).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// One reaper pass: delete reservable autoclusters whose reservation
    /// ended more than the idle timeout before `now` and which host
    /// nothing. Returns how many were removed.
    pub async fn run_idle_reaper_once(&self, now: u64) -> usize {
        let idle = self.settings().cleanup_reservable_auto_cluster_idle_secs;
        let caches = &self.c.caches;
        let candidates = caches.cluster_inst.keys_filtered(|c| {
            c.auto
                && c.reservable
                && c.reserved_by.is_empty()
                && !c.delete_prepare
                && !c.state.is_transient()
                && c.reservation_ended_at.saturating_add(idle) <= now
        });

        let mut reaped = 0;
        for key in candidates {
            let empty = caches
                .cluster_refs
                .get(&key)
                .map(|refs| refs.apps.is_empty())
                .unwrap_or(true);
            if !empty {
                continue;
            }
            match self
                .delete_cluster_inst(&key, CrmOverride::NoOverride, |_msg| {})
                .await
            {
                Ok(()) => {
                    info!(cluster = %key, "reaped idle reservable autocluster");
                    reaped += 1;
                }
                Err(e) => {
                    warn!(cluster = %key, error = %e, "idle autocluster cleanup failed");
                }
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn work_queue_coalesces_duplicates() {
        let ran = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let ran2 = Arc::clone(&ran);
        let gate2 = Arc::clone(&gate);
        let (queue, _task) = WorkQueue::start(move |_key: String| {
            let ran = Arc::clone(&ran2);
            let gate = Arc::clone(&gate2);
            async move {
                // Block so repeated enqueues land while pending.
                let _permit = gate.acquire().await.unwrap();
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.needs_work("site-1".to_string());
        queue.needs_work("site-1".to_string());
        queue.needs_work("site-1".to_string());
        queue.needs_work("site-2".to_string());

        gate.add_permits(4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Three enqueues of site-1 collapsed into one run.
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
