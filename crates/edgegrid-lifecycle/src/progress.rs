//! Per-object progress channels.
//!
//! One channel per object key, named `msg/key/<Type>/<keyJSON>`.
//! Payloads are JSON snapshots of the object's tracked state, growing
//! status message list, and errors. Subscribers tolerate missed messages
//! by re-reading the store before they wait.

use std::collections::HashMap;

use edgegrid_model::{ObjKey, TrackedState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Channel name for an object.
pub fn channel_for<K: ObjKey>(typ: &str, key: &K) -> String {
    format!("msg/key/{}/{}", typ, key.key_string())
}

/// A progress snapshot published by whoever is executing the work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoSnapshot {
    pub state: TrackedState,
    /// Monotonically growing: publishers append, never rewrite.
    #[serde(default)]
    pub status_msgs: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// The pub/sub surface the coordinator is written against. The
/// in-process implementation below covers a single-controller region; a
/// networked broker can slot in behind the same trait.
pub trait ProgressBus: Send + Sync + 'static {
    fn publish(&self, channel: &str, snapshot: &InfoSnapshot);
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// In-process bus over tokio broadcast channels.
#[derive(Default)]
pub struct InProcBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InProcBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl ProgressBus for InProcBus {
    fn publish(&self, channel: &str, snapshot: &InfoSnapshot) {
        if let Ok(payload) = serde_json::to_string(snapshot) {
            // No receivers is fine; the store is the source of truth.
            let _ = self.sender(channel).send(payload);
        }
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_model::AppInstKey;

    #[test]
    fn channel_name_includes_type_and_key() {
        let key = AppInstKey::new("acme", "web-prod");
        let name = channel_for("AppInst", &key);
        assert!(name.starts_with("msg/key/AppInst/"));
        assert!(name.contains("web-prod"));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = InProcBus::new();
        let mut rx = bus.subscribe("msg/key/AppInst/x");

        let snapshot = InfoSnapshot {
            state: TrackedState::Creating,
            status_msgs: vec!["creating cluster".to_string()],
            errors: Vec::new(),
        };
        bus.publish("msg/key/AppInst/x", &snapshot);

        let payload = rx.recv().await.unwrap();
        let got: InfoSnapshot = serde_json::from_str(&payload).unwrap();
        assert_eq!(got, snapshot);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = InProcBus::new();
        bus.publish("msg/key/AppInst/y", &InfoSnapshot::default());
    }
}
