//! Flavor and resource-tag-table APIs.

use edgegrid_model::{Flavor, FlavorKey, Obj, ObjKey, ResTagTable, ResTagTableKey};
use tracing::info;

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

impl Controller {
    pub async fn create_flavor(&self, flavor: Flavor) -> ApiResult<()> {
        flavor.validate()?;
        let store = self.c.stores.flavor.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &flavor.key) {
                return Err(flavor.key.exists_error().into());
            }
            store.stm_put(stm, &flavor)?;
            Ok(())
        })
        .await?;
        info!(flavor = %flavor.key, "flavor created");
        Ok(())
    }

    pub async fn delete_flavor(&self, key: &FlavorKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let name = key.name.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _cur: &Flavor| {
            let apps = caches.app.keys_filtered(|a| a.default_flavor.name == name);
            if let Some(user) = apps.first() {
                return Err(ApiError::Conflict(format!("Flavor in use by App {user}")));
            }
            let insts = caches.app_inst.keys_filtered(|i| i.flavor.name == name);
            if let Some(user) = insts.first() {
                return Err(ApiError::Conflict(format!(
                    "Flavor in use by AppInst {user}"
                )));
            }
            Ok(())
        };
        self.safe_delete_simple::<Flavor, _>(key, check).await?;
        info!(flavor = %key, "flavor deleted");
        Ok(())
    }

    pub fn show_flavors(&self) -> Vec<Flavor> {
        let mut out = Vec::new();
        self.c.caches.flavor.show(|_| true, |f| out.push(f.clone()));
        out
    }

    pub async fn create_res_tag_table(&self, table: ResTagTable) -> ApiResult<()> {
        table.key.validate()?;
        let store = self.c.stores.res_tag_table.clone();
        self.stm(|stm| {
            if store.stm_has(stm, &table.key) {
                return Err(table.key.exists_error().into());
            }
            store.stm_put(stm, &table)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_res_tag_table(&self, key: &ResTagTableKey) -> ApiResult<()> {
        let caches = &self.c.caches;
        let key_owned = key.clone();
        let check = move |_stm: &mut edgegrid_kv::Stm<'_>, _cur: &ResTagTable| {
            let users = caches
                .cloudlet
                .keys_filtered(|c| c.res_tag_map.values().any(|k| *k == key_owned));
            if let Some(user) = users.first() {
                return Err(ApiError::Conflict(format!(
                    "ResTagTable in use by Cloudlet {user}"
                )));
            }
            Ok(())
        };
        self.safe_delete_simple::<ResTagTable, _>(key, check).await
    }
}
