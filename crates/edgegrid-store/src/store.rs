//! Typed object stores.
//!
//! An [`ObjStore`] marshals objects to JSON at `"<Type>/<keyJSON>"`
//! paths and validates every write. STM accessors operate on a live
//! transaction; [`OptionalStm`] lets lower-level helpers read through
//! either a transaction or the cache, whichever the caller has.

use std::marker::PhantomData;

use edgegrid_kv::{KvStore, LeaseId, Stm};
use edgegrid_model::{Obj, ObjKey};

use crate::cache::Cache;
use crate::error::{StoreError, StoreResult};

/// Typed CRUD over the KV store for one object type.
pub struct ObjStore<T: Obj> {
    kv: KvStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Obj> Clone for ObjStore<T> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Obj> ObjStore<T> {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            _marker: PhantomData,
        }
    }

    fn marshal(obj: &T) -> StoreResult<String> {
        obj.validate()?;
        serde_json::to_string(obj).map_err(|e| StoreError::Marshal {
            typ: T::TYPE,
            msg: e.to_string(),
        })
    }

    fn unmarshal(value: &str) -> StoreResult<T> {
        serde_json::from_str(value).map_err(|e| StoreError::Marshal {
            typ: T::TYPE,
            msg: e.to_string(),
        })
    }

    // ── STM accessors ──────────────────────────────────────────────

    pub fn stm_get(&self, stm: &mut Stm<'_>, key: &T::Key) -> StoreResult<Option<T>> {
        match stm.get(&T::obj_store_path(key)) {
            Some(value) => Ok(Some(Self::unmarshal(&value)?)),
            None => Ok(None),
        }
    }

    pub fn stm_has(&self, stm: &mut Stm<'_>, key: &T::Key) -> bool {
        stm.has(&T::obj_store_path(key))
    }

    pub fn stm_put(&self, stm: &mut Stm<'_>, obj: &T) -> StoreResult<()> {
        let value = Self::marshal(obj)?;
        stm.put(&T::obj_store_path(obj.key()), &value);
        Ok(())
    }

    pub fn stm_put_with_lease(
        &self,
        stm: &mut Stm<'_>,
        obj: &T,
        lease: LeaseId,
    ) -> StoreResult<()> {
        let value = Self::marshal(obj)?;
        stm.put_with_lease(&T::obj_store_path(obj.key()), &value, lease);
        Ok(())
    }

    pub fn stm_del(&self, stm: &mut Stm<'_>, key: &T::Key) {
        stm.del(&T::obj_store_path(key));
    }

    // ── Direct accessors ───────────────────────────────────────────

    pub fn get(&self, key: &T::Key) -> StoreResult<Option<T>> {
        match self.kv.get(&T::obj_store_path(key)) {
            Some(val) => Ok(Some(Self::unmarshal(&val.value)?)),
            None => Ok(None),
        }
    }

    /// Create or update directly, outside any transaction. Returns the
    /// commit revision.
    pub fn put(&self, obj: &T) -> StoreResult<u64> {
        let value = Self::marshal(obj)?;
        Ok(self.kv.put(&T::obj_store_path(obj.key()), &value, None)?)
    }

    pub fn put_with_lease(&self, obj: &T, lease: LeaseId) -> StoreResult<u64> {
        let value = Self::marshal(obj)?;
        Ok(self
            .kv
            .put(&T::obj_store_path(obj.key()), &value, Some(lease))?)
    }

    pub fn delete(&self, key: &T::Key) -> StoreResult<Option<u64>> {
        Ok(self.kv.delete(&T::obj_store_path(key))?)
    }

    /// Load every stored object of this type.
    pub fn load_all(&self) -> StoreResult<Vec<T>> {
        let prefix = format!("{}/", T::TYPE);
        let mut out = Vec::new();
        for (_, val) in self.kv.list(&prefix) {
            out.push(Self::unmarshal(&val.value)?);
        }
        Ok(out)
    }

    /// Read through a transaction when one is live, else from the cache.
    pub fn get_via(
        &self,
        ostm: &mut OptionalStm<'_, '_>,
        cache: &Cache<T>,
        key: &T::Key,
    ) -> StoreResult<Option<T>> {
        match &mut ostm.stm {
            Some(stm) => self.stm_get(stm, key),
            None => Ok(cache.get(key)),
        }
    }
}

/// Either a live STM or "read the cache". The sole read path for
/// helpers that are called from both transactional and read-only
/// contexts (the resource calculator, dry-run placement).
pub struct OptionalStm<'a, 'b> {
    stm: Option<&'a mut Stm<'b>>,
}

impl<'a, 'b> OptionalStm<'a, 'b> {
    pub fn stm(stm: &'a mut Stm<'b>) -> Self {
        Self { stm: Some(stm) }
    }

    pub fn cache() -> Self {
        Self { stm: None }
    }

    pub fn is_stm(&self) -> bool {
        self.stm.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_kv::{apply_stm, KvError};
    use edgegrid_model::{Zone, ZoneKey};

    fn zone(name: &str) -> Zone {
        Zone {
            key: ZoneKey::new("op", name),
            ..Default::default()
        }
    }

    #[test]
    fn put_get_delete_round_trip() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv);

        store.put(&zone("zoneA")).unwrap();
        let loaded = store.get(&ZoneKey::new("op", "zoneA")).unwrap().unwrap();
        assert_eq!(loaded.key.name, "zoneA");

        assert!(store.delete(&ZoneKey::new("op", "zoneA")).unwrap().is_some());
        assert!(store.get(&ZoneKey::new("op", "zoneA")).unwrap().is_none());
    }

    #[test]
    fn put_validates() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv);
        let bad = Zone::default();
        assert!(store.put(&bad).is_err());
    }

    #[test]
    fn stm_accessors() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv.clone());
        store.put(&zone("zoneA")).unwrap();

        apply_stm::<KvError, _>(&kv, 3, |stm| {
            let key = ZoneKey::new("op", "zoneA");
            assert!(store.stm_has(stm, &key));
            let mut obj = store.stm_get(stm, &key).unwrap().unwrap();
            obj.description = "updated".to_string();
            store.stm_put(stm, &obj).unwrap();
            store.stm_del(stm, &ZoneKey::new("op", "missing"));
            Ok(())
        })
        .unwrap();

        let loaded = store.get(&ZoneKey::new("op", "zoneA")).unwrap().unwrap();
        assert_eq!(loaded.description, "updated");
    }

    #[test]
    fn load_all_scopes_by_type() {
        let kv = KvStore::open_in_memory();
        let store: ObjStore<Zone> = ObjStore::new(kv.clone());
        store.put(&zone("a")).unwrap();
        store.put(&zone("b")).unwrap();
        kv.create("Zzz/other", "{}").unwrap();

        assert_eq!(store.load_all().unwrap().len(), 2);
    }
}
