//! The Zone object — a named group of cloudlets used as a placement
//! target. Developers deploy to zones; the controller picks the cloudlet.

use crate::error::ModelResult;
use crate::keys::ZoneKey;
use crate::{Obj, ObjKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub key: ZoneKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub delete_prepare: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub obj_id: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Obj for Zone {
    type Key = ZoneKey;

    fn key(&self) -> &ZoneKey {
        &self.key
    }

    fn validate(&self) -> ModelResult<()> {
        self.key.validate()
    }
}

impl crate::DeletePrepare for Zone {
    fn delete_prepare(&self) -> bool {
        self.delete_prepare
    }
    fn set_delete_prepare(&mut self, val: bool) {
        self.delete_prepare = val;
    }
}
