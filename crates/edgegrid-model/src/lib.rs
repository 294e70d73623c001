//! edgegrid-model — the object model of the EdgeGrid control plane.
//!
//! Everything the controller persists is defined here: typed keys, the
//! object graph (App, AppInst, ClusterInst, Cloudlet, Zone, policies,
//! flavors, refs), tracked lifecycle states, field maps for partial
//! updates, and the helpers that keep names and ports well-formed.
//!
//! Objects serialize to JSON; a stored object lives at the KV path
//! `"<TypeName>/<canonical JSON key>"`. Key canonical form is the JSON
//! serialization with struct field order, so the same key always maps to
//! the same path.

pub mod app;
pub mod appinst;
pub mod cloudlet;
pub mod cluster;
pub mod dnslabel;
pub mod enums;
pub mod error;
pub mod fieldmap;
pub mod keys;
pub mod netrules;
pub mod policy;
pub mod ports;
pub mod refs;
pub mod resources;
pub mod settings;
pub mod verhash;
pub mod zone;

pub use app::*;
pub use appinst::*;
pub use cloudlet::*;
pub use cluster::*;
pub use enums::*;
pub use error::{ModelError, ModelResult};
pub use fieldmap::FieldMap;
pub use keys::*;
pub use netrules::*;
pub use policy::*;
pub use ports::*;
pub use refs::*;
pub use resources::*;
pub use settings::Settings;
pub use zone::*;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

/// A typed object key. Keys serialize to canonical JSON and identify the
/// KV path of the object they belong to.
pub trait ObjKey:
    Clone + Eq + Hash + Ord + Serialize + DeserializeOwned + fmt::Display + Send + Sync + 'static
{
    /// Stored type name, the first path segment of the KV key.
    const TYPE: &'static str;

    /// Canonical JSON form of the key.
    fn key_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Full KV path for the object with this key.
    fn store_path(&self) -> String {
        format!("{}/{}", Self::TYPE, self.key_string())
    }

    /// Reject malformed keys (empty required fields, bad characters).
    fn validate(&self) -> ModelResult<()>;

    fn not_found_error(&self) -> ModelError {
        ModelError::NotFound {
            typ: Self::TYPE,
            key: self.to_string(),
        }
    }

    fn exists_error(&self) -> ModelError {
        ModelError::AlreadyExists {
            typ: Self::TYPE,
            key: self.to_string(),
        }
    }

    fn being_deleted_error(&self) -> ModelError {
        ModelError::BeingDeleted {
            typ: Self::TYPE,
            key: self.to_string(),
        }
    }
}

/// A persisted object with a typed key.
pub trait Obj: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: ObjKey;

    /// Stored type name. Defaults to the key's type; object types that
    /// share a key type (the policies) override it.
    const TYPE: &'static str = <Self::Key as ObjKey>::TYPE;

    fn key(&self) -> &Self::Key;

    /// Full KV path of this object.
    fn obj_store_path(key: &Self::Key) -> String {
        format!("{}/{}", Self::TYPE, key.key_string())
    }

    /// Per-type constraints checked on every store write.
    fn validate(&self) -> ModelResult<()> {
        self.key().validate()
    }
}

/// Objects that participate in the safe-delete protocol.
pub trait DeletePrepare: Obj {
    fn delete_prepare(&self) -> bool;
    fn set_delete_prepare(&mut self, val: bool);
}

/// Objects driven by the tracked lifecycle state machine.
pub trait Tracked: Obj {
    fn state(&self) -> TrackedState;
    fn set_state(&mut self, state: TrackedState);
    fn errors(&self) -> &[String];
    fn set_errors(&mut self, errors: Vec<String>);
}

/// Seconds since the Unix epoch; the timestamp format used on all objects.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Allocate a new object id (ULID, sortable by creation time).
pub fn new_obj_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Check a name field: non-empty, no path separators or control characters.
pub(crate) fn valid_name(field: &'static str, name: &str) -> ModelResult<()> {
    if name.is_empty() {
        return Err(ModelError::InvalidArg(format!("{field} cannot be empty")));
    }
    if name.chars().any(|c| c == '/' || c.is_control()) {
        return Err(ModelError::InvalidArg(format!(
            "{field} contains invalid characters"
        )));
    }
    Ok(())
}
