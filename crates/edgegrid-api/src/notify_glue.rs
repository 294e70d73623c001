//! Wiring between the controller and the notify fan-out.
//!
//! Declared intent flows down to site workers (apps, instances,
//! clusters, cloudlets, trust policies); CloudletInfo flows back up. A
//! dropped subscriber flushes its reported infos to OFFLINE, with
//! disconnect bursts coalesced through a work queue.

use std::collections::HashMap;
use std::sync::Arc;

use edgegrid_kv::LeaseId;
use edgegrid_model::{epoch_secs, CloudletInfo};
use edgegrid_notify::{NotifyServer, UpstreamHandler};
use parking_lot::Mutex;
use tracing::warn;

use crate::controller::Controller;
use crate::workers::WorkQueue;

struct CloudletInfoUpstream {
    controller: Controller,
    flush_queue: WorkQueue<i64>,
    /// Lease per reporting subscriber; reports refresh it, so a site
    /// that stops reporting expires with its lease.
    leases: Mutex<HashMap<i64, LeaseId>>,
}

impl CloudletInfoUpstream {
    fn lease_for(&self, notify_id: i64) -> LeaseId {
        let kv = &self.controller.c.kv;
        let ttl = self.controller.settings().cloudlet_info_lease_secs;
        let now = epoch_secs();
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(&notify_id) {
            if kv.lease_keepalive(*lease, now).is_ok() {
                return *lease;
            }
        }
        let lease = kv.lease_grant(ttl, now);
        leases.insert(notify_id, lease);
        lease
    }
}

impl UpstreamHandler for CloudletInfoUpstream {
    fn typ(&self) -> &'static str {
        "CloudletInfo"
    }

    fn handle(&self, notify_id: i64, value: &str) {
        let mut report: CloudletInfo = match serde_json::from_str(value) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "dropping unparseable CloudletInfo report");
                return;
            }
        };
        report.notify_id = notify_id;
        let lease = self.lease_for(notify_id);
        let controller = self.controller.clone();
        tokio::spawn(async move {
            let key = report.key.clone();
            if let Err(e) = controller.handle_cloudlet_info(report, Some(lease)).await {
                warn!(cloudlet = %key, error = %e, "cloudlet info update failed");
            }
        });
    }

    fn flush(&self, notify_id: i64) {
        // Stop refreshing the lease; the record outlives the flush only
        // until its TTL lapses.
        self.leases.lock().remove(&notify_id);
        self.flush_queue.needs_work(notify_id);
    }
}

/// Register the controller's caches and handlers on a notify server.
pub fn attach_notify(controller: &Controller, server: &NotifyServer) {
    let caches = &controller.c.caches;
    server.register_send_cache(&caches.app);
    server.register_send_cache(&caches.app_inst);
    server.register_send_cache(&caches.cluster_inst);
    server.register_send_cache(&caches.cloudlet);
    server.register_send_cache(&caches.trust_policy);
    server.register_send_cache(&caches.flavor);

    let flush_controller = controller.clone();
    let (flush_queue, _task) = WorkQueue::start(move |notify_id: i64| {
        let controller = flush_controller.clone();
        async move {
            if let Err(e) = controller.flush_cloudlet_infos(notify_id).await {
                warn!(notify_id, error = %e, "flush after notify disconnect failed");
            }
        }
    });
    server.register_upstream(Arc::new(CloudletInfoUpstream {
        controller: controller.clone(),
        flush_queue,
        leases: Mutex::new(HashMap::new()),
    }));
}
