//! Resource value maps.
//!
//! A `ResValMap` carries named resource quantities (vcpus, ram in MB,
//! disk in GB, external IPs) and supports the arithmetic the calculator
//! needs. Unknown names pass through untouched so optional resources
//! (GPU categories) ride along.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known resource names.
pub mod resnames {
    pub const VCPUS: &str = "vcpus";
    pub const RAM_MB: &str = "ram";
    pub const DISK_GB: &str = "disk";
    pub const EXTERNAL_IPS: &str = "external-ips";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResValMap(BTreeMap<String, u64>);

impl ResValMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from vcpu/ram/disk totals.
    pub fn from_totals(vcpus: u64, ram_mb: u64, disk_gb: u64) -> Self {
        let mut map = Self::new();
        map.add(resnames::VCPUS, vcpus);
        map.add(resnames::RAM_MB, ram_mb);
        map.add(resnames::DISK_GB, disk_gb);
        map
    }

    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn add(&mut self, name: &str, amount: u64) {
        if amount > 0 {
            *self.0.entry(name.to_string()).or_insert(0) += amount;
        }
    }

    /// Saturating subtraction.
    pub fn sub(&mut self, name: &str, amount: u64) {
        if let Some(val) = self.0.get_mut(name) {
            *val = val.saturating_sub(amount);
        }
    }

    pub fn add_map(&mut self, other: &ResValMap) {
        for (name, amount) in &other.0 {
            self.add(name, *amount);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_get() {
        let mut map = ResValMap::from_totals(4, 8192, 40);
        assert_eq!(map.get(resnames::VCPUS), 4);
        map.add(resnames::VCPUS, 2);
        assert_eq!(map.get(resnames::VCPUS), 6);
        map.sub(resnames::VCPUS, 10);
        assert_eq!(map.get(resnames::VCPUS), 0);
        assert_eq!(map.get("unknown"), 0);
    }

    #[test]
    fn zero_amounts_are_not_recorded() {
        let map = ResValMap::from_totals(0, 0, 0);
        assert!(map.is_empty());
    }

    #[test]
    fn add_map_merges() {
        let mut a = ResValMap::from_totals(2, 1024, 10);
        let b = ResValMap::from_totals(1, 512, 0);
        a.add_map(&b);
        assert_eq!(a.get(resnames::VCPUS), 3);
        assert_eq!(a.get(resnames::RAM_MB), 1536);
        assert_eq!(a.get(resnames::DISK_GB), 10);
    }
}
