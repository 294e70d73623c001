//! Data-model version hash.
//!
//! The shape of every stored key is hashed into a single version string.
//! The KV store records the hash it was written with; a controller whose
//! compiled-in shapes hash differently refuses to start unless an
//! upgrade function is registered for the stored hash. This catches key
//! layout changes that would silently orphan stored objects.

use sha2::{Digest, Sha256};

/// KV path under which the active hash is stored.
pub const VERSION_HASH_PATH: &str = "DataModelVersion/current";

/// (type name, ordered key field names) for every stored type. Order
/// matters: JSON key serialization follows struct field order.
const KEY_SHAPES: &[(&str, &[&str])] = &[
    ("App", &["organization", "name", "version"]),
    ("AppInst", &["organization", "name"]),
    ("AppInstRefs", &["organization", "name", "version"]),
    ("AlertPolicy", &["organization", "name"]),
    ("AutoProvPolicy", &["organization", "name"]),
    ("AutoScalePolicy", &["organization", "name"]),
    ("Cloudlet", &["organization", "name", "federated_organization"]),
    ("CloudletInfo", &["organization", "name", "federated_organization"]),
    ("CloudletRefs", &["organization", "name", "federated_organization"]),
    ("ClusterInst", &["organization", "name"]),
    ("ClusterRefs", &["organization", "name"]),
    ("Flavor", &["name"]),
    ("ResTagTable", &["organization", "name"]),
    ("Settings", &[]),
    ("TrustPolicy", &["organization", "name"]),
    ("TrustPolicyException", &["organization", "name"]),
    ("Zone", &["organization", "name"]),
];

/// Hash of the compiled-in key shapes.
pub fn key_shape_hash() -> String {
    let mut hasher = Sha256::new();
    for (typ, fields) in KEY_SHAPES {
        hasher.update(typ.as_bytes());
        hasher.update(b"{");
        for field in *fields {
            hasher.update(field.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"}");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A registered migration from an older key-shape hash to the current one.
pub struct UpgradeFunc {
    /// The stored hash this migration upgrades from.
    pub from_hash: String,
    /// Applied to every stored (path, value) pair; returns the new pair,
    /// or None to drop the record.
    pub migrate: fn(path: &str, value: &str) -> Option<(String, String)>,
}

/// Outcome of the startup version check.
#[derive(Debug, PartialEq, Eq)]
pub enum VersionCheck {
    /// Fresh store; the current hash should be recorded.
    Fresh,
    /// Stored hash matches the compiled-in shapes.
    Match,
    /// Stored hash differs and an upgrade is registered for it.
    UpgradeAvailable(usize),
}

/// Compare a stored hash against the compiled-in shapes.
pub fn check_version(
    stored: Option<&str>,
    upgrades: &[UpgradeFunc],
) -> Result<VersionCheck, String> {
    let current = key_shape_hash();
    match stored {
        None => Ok(VersionCheck::Fresh),
        Some(hash) if hash == current => Ok(VersionCheck::Match),
        Some(hash) => {
            for (idx, upgrade) in upgrades.iter().enumerate() {
                if upgrade.from_hash == hash {
                    return Ok(VersionCheck::UpgradeAvailable(idx));
                }
            }
            Err(format!(
                "data-model version mismatch: store has {hash}, binary expects {current}, \
                 and no upgrade function is registered"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(key_shape_hash(), key_shape_hash());
        assert_eq!(key_shape_hash().len(), 16);
    }

    #[test]
    fn fresh_store_passes() {
        assert_eq!(check_version(None, &[]), Ok(VersionCheck::Fresh));
    }

    #[test]
    fn matching_hash_passes() {
        let current = key_shape_hash();
        assert_eq!(check_version(Some(&current), &[]), Ok(VersionCheck::Match));
    }

    #[test]
    fn mismatch_without_upgrade_refuses() {
        assert!(check_version(Some("deadbeefdeadbeef"), &[]).is_err());
    }

    #[test]
    fn mismatch_with_upgrade_is_allowed() {
        let upgrades = [UpgradeFunc {
            from_hash: "deadbeefdeadbeef".to_string(),
            migrate: |path, value| Some((path.to_string(), value.to_string())),
        }];
        assert_eq!(
            check_version(Some("deadbeefdeadbeef"), &upgrades),
            Ok(VersionCheck::UpgradeAvailable(0))
        );
    }
}
