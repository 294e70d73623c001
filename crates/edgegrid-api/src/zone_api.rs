//! Zone API.

use edgegrid_model::{epoch_secs, new_obj_id, ObjKey, Zone, ZoneKey};
use tracing::info;

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

impl Controller {
    pub async fn create_zone(&self, mut zone: Zone) -> ApiResult<()> {
        zone.key.validate()?;
        let store = self.c.stores.zone.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &zone.key) {
                return Err(zone.key.exists_error().into());
            }
            zone.obj_id = new_obj_id();
            zone.created_at = epoch_secs();
            store.stm_put(stm, &zone)?;
            Ok(())
        })
        .await?;
        info!(zone = %zone.key, "zone created");
        Ok(())
    }

    pub async fn delete_zone(&self, key: &ZoneKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let zone_name = key.name.clone();
        let zone_org = key.organization.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _zone: &Zone| {
            let users = caches.cloudlet.keys_filtered(|c| {
                c.zone == zone_name && c.key.organization == zone_org
            });
            if let Some(user) = users.first() {
                return Err(ApiError::Conflict(format!("Zone in use by Cloudlet {user}")));
            }
            Ok(())
        };
        self.safe_delete_simple::<Zone, _>(key, check).await?;
        info!(zone = %key, "zone deleted");
        Ok(())
    }

    pub fn show_zones(&self, filter: impl Fn(&Zone) -> bool) -> Vec<Zone> {
        let mut out = Vec::new();
        self.c.caches.zone.show(filter, |z| out.push(z.clone()));
        out
    }

    /// Zone keys of all cloudlets in a zone.
    pub(crate) fn cloudlets_in_zone(&self, key: &ZoneKey) -> Vec<edgegrid_model::CloudletKey> {
        self.c.caches.cloudlet.keys_filtered(|c| {
            c.zone == key.name && c.key.organization == key.organization
        })
    }
}
