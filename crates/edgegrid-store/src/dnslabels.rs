//! Per-cloudlet DNS label registry.
//!
//! Labels live at `CloudletObjDnsLabel/<cloudletKeyJSON>/<label>` so a
//! single STM transaction can claim a label and create the object that
//! owns it atomically. Collisions resolve by numeric suffix.

use edgegrid_kv::Stm;
use edgegrid_model::dnslabel::{dns_label_candidate, dns_sanitize};
use edgegrid_model::{CloudletKey, ModelError, ModelResult, ObjKey};

const TYPE: &str = "CloudletObjDnsLabel";

/// Registry of DNS labels in use on each cloudlet.
#[derive(Clone, Default)]
pub struct DnsLabelStore;

impl DnsLabelStore {
    fn path(cloudlet: &CloudletKey, label: &str) -> String {
        format!("{}/{}/{}", TYPE, cloudlet.key_string(), label)
    }

    /// Claim a unique label for `name` on the cloudlet, within the
    /// caller's transaction.
    pub fn alloc(&self, stm: &mut Stm<'_>, cloudlet: &CloudletKey, name: &str) -> ModelResult<String> {
        let base = dns_sanitize(name);
        for attempt in 0..1000 {
            let candidate = dns_label_candidate(&base, attempt);
            let path = Self::path(cloudlet, &candidate);
            if !stm.has(&path) {
                stm.put(&path, "");
                return Ok(candidate);
            }
        }
        Err(ModelError::invalid(format!(
            "unable to derive a unique DNS label for {name} on cloudlet {cloudlet}"
        )))
    }

    /// Release a label when its owner is deleted.
    pub fn release(&self, stm: &mut Stm<'_>, cloudlet: &CloudletKey, label: &str) {
        stm.del(&Self::path(cloudlet, label));
    }

    pub fn in_use(&self, stm: &mut Stm<'_>, cloudlet: &CloudletKey, label: &str) -> bool {
        stm.has(&Self::path(cloudlet, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_kv::{apply_stm, KvError, KvStore};

    #[test]
    fn labels_unique_per_cloudlet() {
        let kv = KvStore::open_in_memory();
        let labels = DnsLabelStore;
        let c1 = CloudletKey::new("op", "site-1");
        let c2 = CloudletKey::new("op", "site-2");

        for _ in 0..3 {
            apply_stm::<KvError, _>(&kv, 3, |stm| {
                labels
                    .alloc(stm, &c1, "Web Prod")
                    .map_err(|e| KvError::Storage(e.to_string()))?;
                Ok(())
            })
            .unwrap();
        }

        // Three claims on the same cloudlet produced three labels.
        apply_stm::<KvError, _>(&kv, 3, |stm| {
            for label in ["web-prod", "web-prod1", "web-prod2"] {
                assert!(labels.in_use(stm, &c1, label), "missing label {label}");
            }
            // Other cloudlets are unaffected.
            assert!(!labels.in_use(stm, &c2, "web-prod"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn release_frees_label() {
        let kv = KvStore::open_in_memory();
        let labels = DnsLabelStore;
        let cloudlet = CloudletKey::new("op", "site-1");

        apply_stm::<KvError, _>(&kv, 3, |stm| {
            let label = labels.alloc(stm, &cloudlet, "svc").unwrap();
            assert_eq!(label, "svc");
            Ok(())
        })
        .unwrap();

        apply_stm::<KvError, _>(&kv, 3, |stm| {
            labels.release(stm, &cloudlet, "svc");
            Ok(())
        })
        .unwrap();

        apply_stm::<KvError, _>(&kv, 3, |stm| {
            let label = labels.alloc(stm, &cloudlet, "svc").unwrap();
            // Freed label is reusable.
            assert_eq!(label, "svc");
            Ok(())
        })
        .unwrap();
    }
}
