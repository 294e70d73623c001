//! edgegrid-kv — the controller's consistent KV store.
//!
//! Presents the store surface the rest of the controller is written
//! against: revisioned get/put/delete, lease-scoped ephemeral keys,
//! prefix watch streams, and optimistic STM transactions. Values persist
//! through redb; an in-memory backend serves tests.
//!
//! Revisions are global and monotonic: every committed write (or STM
//! transaction) produces exactly one new revision. Watchers observe
//! every committed change in revision order.

pub mod error;
pub mod stm;
pub mod store;

pub use error::{KvError, KvResult};
pub use stm::{apply_stm, Stm};
pub use store::{KvEvent, KvStore, KvVal, LeaseId};
