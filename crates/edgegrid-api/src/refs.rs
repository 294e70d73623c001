//! The reference tracker: delete safety shared by every object type.
//!
//! Deletes follow the safe-delete protocol: one transaction marks the
//! object `delete_prepare` (blocking new references), the caller scans
//! the referring caches once its own caches have observed the flag, and
//! either a final transaction removes the object or the flag is
//! reverted. Revert never surfaces its own errors.

use edgegrid_kv::Stm;
use edgegrid_model::{DeletePrepare, Obj, ObjKey};
use edgegrid_store::ObjStore;
use tracing::warn;

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

impl Controller {
    /// A typed store handle for any object type.
    pub(crate) fn store_of<T: Obj>(&self) -> ObjStore<T> {
        ObjStore::new(self.c.kv.clone())
    }

    /// Step 1 of safe delete: mark the object, failing if it is missing,
    /// already being deleted, or `in_use` objects (forward-checked in the
    /// same transaction). Returns the marked object.
    pub(crate) async fn mark_delete_prepare<T, F>(
        &self,
        key: &T::Key,
        mut in_use: F,
    ) -> ApiResult<T>
    where
        T: DeletePrepare,
        F: FnMut(&mut Stm, &T) -> ApiResult<()>,
    {
        let store = self.store_of::<T>();
        let mut marked: Option<T> = None;
        self.stm(|stm| {
            let mut cur = store
                .stm_get(stm, key)?
                .ok_or_else(|| key.not_found_error())?;
            if cur.delete_prepare() {
                return Err(key.being_deleted_error().into());
            }
            in_use(stm, &cur)?;
            cur.set_delete_prepare(true);
            store.stm_put(stm, &cur)?;
            marked = Some(cur);
            Ok(())
        })
        .await?;
        marked.ok_or_else(|| ApiError::Internal("delete prepare produced no object".to_string()))
    }

    /// Revert the delete-prepare flag. Used when a reference scan found
    /// an offender or a later step failed; errors are logged, never
    /// returned, and a concurrently deleted object is fine.
    pub(crate) async fn clear_delete_prepare<T>(&self, key: &T::Key)
    where
        T: DeletePrepare,
    {
        let store = self.store_of::<T>();
        let result = self
            .stm(|stm| {
                if let Some(mut cur) = store.stm_get(stm, key)? {
                    if cur.delete_prepare() {
                        cur.set_delete_prepare(false);
                        store.stm_put(stm, &cur)?;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(key = %key, error = %e, "failed to undo delete prepare");
        }
    }

    /// Final step of safe delete for objects with no lifecycle dispatch:
    /// re-run the in-use check and remove the object in one transaction.
    /// On conflict the flag is reverted.
    pub(crate) async fn finish_simple_delete<T, F>(
        &self,
        key: &T::Key,
        mut in_use: F,
    ) -> ApiResult<()>
    where
        T: DeletePrepare,
        F: FnMut(&mut Stm, &T) -> ApiResult<()>,
    {
        let store = self.store_of::<T>();
        let result = self
            .stm(|stm| {
                let Some(cur) = store.stm_get(stm, key)? else {
                    // Deleted concurrently.
                    return Ok(());
                };
                in_use(stm, &cur)?;
                store.stm_del(stm, key);
                Ok(())
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.clear_delete_prepare::<T>(key).await;
                Err(e)
            }
        }
    }

    /// Whole safe-delete protocol for simple catalog objects: mark,
    /// re-check, delete, revert on failure.
    pub(crate) async fn safe_delete_simple<T, F>(&self, key: &T::Key, in_use: F) -> ApiResult<()>
    where
        T: DeletePrepare,
        F: FnMut(&mut Stm, &T) -> ApiResult<()> + Clone,
    {
        self.mark_delete_prepare::<T, _>(key, in_use.clone()).await?;
        self.finish_simple_delete::<T, _>(key, in_use).await
    }
}

/// Forward-reference read: the target must exist and not be mid-delete.
pub(crate) fn get_live<T>(
    store: &ObjStore<T>,
    stm: &mut Stm<'_>,
    key: &T::Key,
) -> ApiResult<T>
where
    T: DeletePrepare,
{
    let obj = store
        .stm_get(stm, key)?
        .ok_or_else(|| key.not_found_error())?;
    if obj.delete_prepare() {
        return Err(key.being_deleted_error().into());
    }
    Ok(obj)
}
