//! Waiting for tracked-state terminals.

use std::time::Duration;

use edgegrid_model::TrackedState;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::progress::{InfoSnapshot, ProgressBus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The CRM reported an error state; carries the joined errors.
    #[error("{0}")]
    Failed(String),

    /// The deadline fired while the object was in a known transient
    /// state; the work continues in the background.
    #[error("work still in progress for {0}, check back with Show for the result")]
    InProgress(String),

    /// The deadline fired in a state we cannot account for.
    #[error("timed out waiting for {0}")]
    TimedOut(String),
}

/// What to wait for on one object's channel.
pub struct WaitSpec {
    /// Progress channel (`msg/key/<Type>/<keyJSON>`).
    pub channel: String,
    /// Human-readable object name for error messages.
    pub object: String,
    /// The terminal that means success (Ready, or NotPresent for deletes).
    pub target: TrackedState,
    pub timeout: Duration,
}

/// Wait until the object reaches the requested terminal.
///
/// `read_current` re-reads authoritative state from the store; it runs
/// after subscribing, so a terminal committed before the subscription
/// was set up is never missed. Returns None when the object is gone
/// (which satisfies a NotPresent target). New status messages are
/// forwarded to `on_status` exactly once each.
pub async fn wait_for_state(
    bus: &dyn ProgressBus,
    read_current: impl Fn() -> Option<InfoSnapshot>,
    spec: &WaitSpec,
    mut on_status: impl FnMut(&str),
) -> Result<(), LifecycleError> {
    let mut rx = bus.subscribe(&spec.channel);
    let deadline = Instant::now() + spec.timeout;

    let mut sent_msgs = 0usize;
    let mut last_state = TrackedState::Unknown;

    // The store is the source of truth; the channel only wakes us up.
    let current = read_current();
    if let Some(outcome) = classify(current.as_ref(), spec, &mut sent_msgs, &mut on_status) {
        return outcome;
    }

    loop {
        let payload = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                // Missed messages; fall back to the store.
                debug!(channel = %spec.channel, missed = n, "progress channel lagged");
                let current = read_current();
                if let Some(outcome) =
                    classify(current.as_ref(), spec, &mut sent_msgs, &mut on_status)
                {
                    return outcome;
                }
                continue;
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) | Err(_) => {
                // Deadline (or bus gone): settle from the store.
                let current = read_current();
                if let Some(outcome) =
                    classify(current.as_ref(), spec, &mut sent_msgs, &mut on_status)
                {
                    return outcome;
                }
                let state = current.map(|c| c.state).unwrap_or(last_state);
                if state.is_transient() {
                    return Err(LifecycleError::InProgress(spec.object.clone()));
                }
                return Err(LifecycleError::TimedOut(spec.object.clone()));
            }
        };
        let Ok(snapshot) = serde_json::from_str::<InfoSnapshot>(&payload) else {
            continue;
        };
        last_state = snapshot.state;
        if let Some(outcome) = classify(Some(&snapshot), spec, &mut sent_msgs, &mut on_status) {
            return outcome;
        }
    }
}

/// Forward new status messages and decide whether this snapshot settles
/// the wait.
fn classify(
    snapshot: Option<&InfoSnapshot>,
    spec: &WaitSpec,
    sent_msgs: &mut usize,
    on_status: &mut impl FnMut(&str),
) -> Option<Result<(), LifecycleError>> {
    let Some(snapshot) = snapshot else {
        // Object gone from the store.
        if spec.target == TrackedState::NotPresent {
            return Some(Ok(()));
        }
        return None;
    };
    if snapshot.status_msgs.len() > *sent_msgs {
        for msg in &snapshot.status_msgs[*sent_msgs..] {
            on_status(msg);
        }
        *sent_msgs = snapshot.status_msgs.len();
    }
    if snapshot.state == spec.target {
        return Some(Ok(()));
    }
    if snapshot.state.is_error() {
        let joined = if snapshot.errors.is_empty() {
            format!("{} failed in state {}", spec.object, snapshot.state)
        } else {
            snapshot.errors.join(", ")
        };
        return Some(Err(LifecycleError::Failed(joined)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::InProcBus;
    use std::sync::Arc;

    fn spec(target: TrackedState) -> WaitSpec {
        WaitSpec {
            channel: "msg/key/AppInst/test".to_string(),
            object: "AppInst acme/web-prod".to_string(),
            target,
            timeout: Duration::from_millis(200),
        }
    }

    fn snapshot(state: TrackedState, msgs: &[&str]) -> InfoSnapshot {
        InfoSnapshot {
            state,
            status_msgs: msgs.iter().map(|m| m.to_string()).collect(),
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn reaches_target_via_channel() {
        let bus = Arc::new(InProcBus::new());
        let spec = spec(TrackedState::Ready);

        let bus2 = Arc::clone(&bus);
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            bus2.publish(
                "msg/key/AppInst/test",
                &snapshot(TrackedState::Creating, &["step 1"]),
            );
            bus2.publish(
                "msg/key/AppInst/test",
                &snapshot(TrackedState::Ready, &["step 1", "step 2"]),
            );
        });

        let mut statuses = Vec::new();
        let result = wait_for_state(
            bus.as_ref(),
            || Some(snapshot(TrackedState::CreateRequested, &[])),
            &spec,
            |msg| statuses.push(msg.to_string()),
        )
        .await;
        publisher.await.unwrap();

        assert_eq!(result, Ok(()));
        // Each message forwarded exactly once despite the cumulative list.
        assert_eq!(statuses, vec!["step 1", "step 2"]);
    }

    #[tokio::test]
    async fn terminal_committed_before_subscribe_is_seen() {
        let bus = InProcBus::new();
        let spec = spec(TrackedState::Ready);
        let result = wait_for_state(
            &bus,
            || Some(snapshot(TrackedState::Ready, &[])),
            &spec,
            |_| {},
        )
        .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn error_state_returns_joined_errors() {
        let bus = Arc::new(InProcBus::new());
        let spec = spec(TrackedState::Ready);

        let bus2 = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut failed = snapshot(TrackedState::CreateError, &[]);
            failed.errors = vec!["no disk left".to_string(), "rollback done".to_string()];
            bus2.publish("msg/key/AppInst/test", &failed);
        });

        let result = wait_for_state(
            bus.as_ref(),
            || Some(snapshot(TrackedState::CreateRequested, &[])),
            &spec,
            |_| {},
        )
        .await;
        assert_eq!(
            result,
            Err(LifecycleError::Failed(
                "no disk left, rollback done".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn deadline_in_transient_state_is_in_progress() {
        let bus = InProcBus::new();
        let spec = spec(TrackedState::Ready);
        let result = wait_for_state(
            &bus,
            || Some(snapshot(TrackedState::Creating, &[])),
            &spec,
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(LifecycleError::InProgress(_))));
    }

    #[tokio::test]
    async fn delete_target_satisfied_by_absence() {
        let bus = InProcBus::new();
        let spec = spec(TrackedState::NotPresent);
        let result = wait_for_state(&bus, || None, &spec, |_| {}).await;
        assert_eq!(result, Ok(()));
    }
}
