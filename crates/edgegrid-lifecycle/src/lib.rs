//! edgegrid-lifecycle — drives tracked states to their terminals.
//!
//! After the controller commits a `*Requested` state, the site CRM does
//! the real work and streams JSON snapshots onto the object's progress
//! channel. The coordinator here waits for the requested terminal,
//! forwards new status messages to the caller, and classifies the
//! outcomes: success, CRM error, or deadline-while-transient.

pub mod coordinator;
pub mod crm;
pub mod progress;

pub use coordinator::{wait_for_state, LifecycleError, WaitSpec};
pub use crm::{CrmConnector, CrmOp, NoopCrm};
pub use progress::{channel_for, InProcBus, InfoSnapshot, ProgressBus};
