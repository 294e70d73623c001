//! The cloudlet resource calculator.
//!
//! Aggregates declared usage (clusters, VM app insts, external IPs)
//! against reported infra limits and operator quotas, answers fit
//! questions for placement, and produces the warnings that drive
//! resource-usage alerts.

use std::collections::BTreeMap;

use edgegrid_model::{
    AppInst, AppInstKey, Cloudlet, CloudletInfo, CloudletKey, CloudletRefs, ClusterInst,
    ClusterKey, NodeResources, ResTagTable, ResTagTableKey, Settings,
};
use tracing::debug;

use crate::error::{ResError, ResResult};
use crate::resval::{resnames, ResValMap};
use crate::vmspec::{get_vm_spec, VmSpec};

/// Object reads the calculator needs. Implemented by the API layer over
/// either a live STM or the caches, which keeps this crate callable from
/// both transactional and dry-run contexts.
pub trait ResDataSource {
    fn get_cloudlet(&mut self, key: &CloudletKey) -> ResResult<Option<Cloudlet>>;
    fn get_cloudlet_info(&mut self, key: &CloudletKey) -> ResResult<Option<CloudletInfo>>;
    fn get_cloudlet_refs(&mut self, key: &CloudletKey) -> ResResult<Option<CloudletRefs>>;
    fn get_cluster_inst(&mut self, key: &ClusterKey) -> ResResult<Option<ClusterInst>>;
    fn get_app_inst(&mut self, key: &AppInstKey) -> ResResult<Option<AppInst>>;
    fn get_res_tag_table(&mut self, key: &ResTagTableKey) -> ResResult<Option<ResTagTable>>;
}

/// Pre-resolved dependencies; anything left unset is fetched from the
/// data source on demand.
#[derive(Default)]
pub struct ResCalcDeps {
    pub cloudlet: Option<Cloudlet>,
    pub cloudlet_info: Option<CloudletInfo>,
    pub cloudlet_refs: Option<CloudletRefs>,
}

/// Resource usage of one cluster, for scale-up decisions and usage APIs.
#[derive(Debug, Clone, Default)]
pub struct ClusterResourceUsage {
    pub total: ResValMap,
    pub used: ResValMap,
    pub free: ResValMap,
    /// Higher = more free capacity.
    pub score: u64,
}

/// Per-cloudlet calculator, scoped to one cloudlet key.
pub struct CloudletResCalc<'a> {
    src: &'a mut dyn ResDataSource,
    pub key: CloudletKey,
    pub deps: ResCalcDeps,
    settings: Settings,
}

impl<'a> CloudletResCalc<'a> {
    pub fn new(src: &'a mut dyn ResDataSource, key: &CloudletKey, settings: Settings) -> Self {
        Self {
            src,
            key: key.clone(),
            deps: ResCalcDeps::default(),
            settings,
        }
    }

    fn cloudlet(&mut self) -> ResResult<Cloudlet> {
        if let Some(c) = &self.deps.cloudlet {
            return Ok(c.clone());
        }
        let c = self
            .src
            .get_cloudlet(&self.key)?
            .ok_or_else(|| ResError::Dependency(format!("cloudlet {} not found", self.key)))?;
        self.deps.cloudlet = Some(c.clone());
        Ok(c)
    }

    fn cloudlet_info(&mut self) -> ResResult<CloudletInfo> {
        if let Some(info) = &self.deps.cloudlet_info {
            return Ok(info.clone());
        }
        let info = self
            .src
            .get_cloudlet_info(&self.key)?
            .ok_or_else(|| ResError::MissingCloudletInfo(self.key.to_string()))?;
        self.deps.cloudlet_info = Some(info.clone());
        Ok(info)
    }

    fn cloudlet_refs(&mut self) -> ResResult<CloudletRefs> {
        if let Some(refs) = &self.deps.cloudlet_refs {
            return Ok(refs.clone());
        }
        let refs = self
            .src
            .get_cloudlet_refs(&self.key)?
            .unwrap_or_else(|| CloudletRefs::new(self.key.clone()));
        self.deps.cloudlet_refs = Some(refs.clone());
        Ok(refs)
    }

    /// The cloudlet's resource-tag tables, keyed by category.
    fn res_tag_tables(&mut self) -> ResResult<BTreeMap<String, ResTagTable>> {
        let cloudlet = self.cloudlet()?;
        let mut tbls = BTreeMap::new();
        for (res, tbl_key) in &cloudlet.res_tag_map {
            if let Some(tbl) = self.src.get_res_tag_table(tbl_key)? {
                tbls.insert(res.clone(), tbl);
            }
        }
        Ok(tbls)
    }

    /// Everything the controller has placed on this cloudlet: cluster
    /// node pools, VM app insts, and dynamic external IPs.
    pub fn cloudlet_used_resources(&mut self) -> ResResult<ResValMap> {
        let refs = self.cloudlet_refs()?;
        let mut used = ResValMap::new();

        for cluster_key in &refs.cluster_insts {
            if let Some(cluster) = self.src.get_cluster_inst(cluster_key)? {
                let (vcpus, ram, disk) = cluster.total_resources();
                used.add(resnames::VCPUS, vcpus);
                used.add(resnames::RAM_MB, ram);
                used.add(resnames::DISK_GB, disk);
            }
        }
        for inst_key in &refs.vm_app_insts {
            if let Some(inst) = self.src.get_app_inst(inst_key)? {
                let (vcpus, ram, disk) = inst.resource_demand();
                used.add(resnames::VCPUS, vcpus);
                used.add(resnames::RAM_MB, ram);
                used.add(resnames::DISK_GB, disk);
            }
        }
        used.add(resnames::EXTERNAL_IPS, u64::from(refs.used_dynamic_ips));
        Ok(used)
    }

    /// The effective limit for a resource: the lower of the reported
    /// infra maximum and the operator quota (when set).
    fn limit_for(&mut self, resource: &str) -> ResResult<Option<u64>> {
        let cloudlet = self.cloudlet()?;
        let info = self.cloudlet_info()?;
        let quota = cloudlet
            .resource_quotas
            .iter()
            .find(|q| q.name == resource)
            .map(|q| q.value);
        let infra_max = match resource {
            resnames::EXTERNAL_IPS if cloudlet.num_dynamic_ips > 0 => {
                Some(u64::from(cloudlet.num_dynamic_ips))
            }
            _ => info.infra_max(resource),
        };
        Ok(match (infra_max, quota) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }

    fn warning_threshold(&mut self, resource: &str) -> u64 {
        let threshold = self
            .deps
            .cloudlet
            .as_ref()
            .and_then(|c| c.resource_quotas.iter().find(|q| q.name == resource))
            .map(|q| q.alert_threshold)
            .filter(|t| *t > 0)
            .unwrap_or(self.settings.resource_warning_threshold_percent);
        u64::from(threshold)
    }

    /// Validate a hypothetical extra load. Returns per-resource warnings
    /// when usage crosses the alert threshold; errors when the load does
    /// not fit at all.
    pub fn cloudlet_fits_reqd_vals(&mut self, extra: &ResValMap) -> ResResult<Vec<String>> {
        let used = self.cloudlet_used_resources()?;
        let info = self.cloudlet_info()?;
        let mut warnings = Vec::new();

        // Walk the union of limited resources and the extra demand.
        let mut names: Vec<String> = extra.iter().map(|(n, _)| n.to_string()).collect();
        for res in &info.infra_resources {
            if !names.iter().any(|n| n == &res.name) {
                names.push(res.name.clone());
            }
        }
        names.sort();

        for name in names {
            let Some(limit) = self.limit_for(&name)? else {
                continue;
            };
            // Platform-internal consumption reported by the site.
            let platform_used = info
                .infra_resources
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.value)
                .unwrap_or(0);
            let total_used = used.get(&name) + platform_used + extra.get(&name);
            if total_used > limit {
                return Err(ResError::InsufficientResources {
                    cloudlet: self.key.to_string(),
                    required: extra.get(&name),
                    available: limit.saturating_sub(used.get(&name) + platform_used),
                    resource: name,
                });
            }
            let threshold = self.warning_threshold(&name);
            if limit > 0 && total_used * 100 > limit * threshold {
                warnings.push(format!(
                    "more than {threshold}% of {name} is used on {}",
                    self.key
                ));
            }
        }
        Ok(warnings)
    }

    /// Check infra quotas for a new or grown cluster and choose the
    /// infra flavor for each node pool.
    pub fn cloudlet_fits_cluster(&mut self, cluster: &ClusterInst) -> ResResult<Vec<VmSpec>> {
        let info = self.cloudlet_info()?;
        let tbls = self.res_tag_tables()?;

        let mut specs = Vec::new();
        let mut extra = ResValMap::new();
        for pool in &cluster.node_pools {
            let spec = get_vm_spec(&pool.node_resources, &info, &tbls)?;
            let (vcpus, ram, disk) = pool.total();
            extra.add(resnames::VCPUS, vcpus);
            extra.add(resnames::RAM_MB, ram);
            extra.add(resnames::DISK_GB, disk);
            specs.push(spec);
        }
        let warnings = self.cloudlet_fits_reqd_vals(&extra)?;
        for warning in warnings {
            debug!(cloudlet = %self.key, warning, "resource warning for cluster fit");
        }
        Ok(specs)
    }

    /// Same check for a VM app instance.
    pub fn cloudlet_fits_vm_app(&mut self, node_res: &NodeResources) -> ResResult<VmSpec> {
        let info = self.cloudlet_info()?;
        let tbls = self.res_tag_tables()?;
        let spec = get_vm_spec(node_res, &info, &tbls)?;

        let extra = ResValMap::from_totals(node_res.vcpus, node_res.ram_mb, node_res.disk_gb);
        self.cloudlet_fits_reqd_vals(&extra)?;
        Ok(spec)
    }

    /// Free capacity score for placement ranking: percentage of free
    /// space per limited resource, averaged. Higher is better.
    pub fn cloudlet_score(&mut self) -> ResResult<u64> {
        let used = self.cloudlet_used_resources()?;
        let info = self.cloudlet_info()?;
        let mut total_pct = 0u64;
        let mut counted = 0u64;
        for name in [resnames::VCPUS, resnames::RAM_MB, resnames::DISK_GB] {
            let Some(limit) = self.limit_for(name)? else {
                continue;
            };
            if limit == 0 {
                continue;
            }
            let platform_used = info
                .infra_resources
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.value)
                .unwrap_or(0);
            let free = limit.saturating_sub(used.get(name) + platform_used);
            total_pct += free * 100 / limit;
            counted += 1;
        }
        Ok(if counted == 0 {
            0
        } else {
            total_pct / counted
        })
    }
}

/// Usage of one cluster given the AppInsts occupying it.
pub fn cluster_resource_usage(cluster: &ClusterInst, insts: &[AppInst]) -> ClusterResourceUsage {
    let (vcpus, ram, disk) = cluster.total_resources();
    let total = ResValMap::from_totals(vcpus, ram, disk);

    let mut used = ResValMap::new();
    for inst in insts {
        let (v, r, d) = inst.resource_demand();
        used.add(resnames::VCPUS, v);
        used.add(resnames::RAM_MB, r);
        used.add(resnames::DISK_GB, d);
    }

    let mut free = total.clone();
    for (name, amount) in used.iter() {
        free.sub(name, amount);
    }

    let mut score = 0u64;
    let mut counted = 0u64;
    for (name, limit) in total.iter() {
        if limit == 0 {
            continue;
        }
        score += free.get(name) * 100 / limit;
        counted += 1;
    }
    let score = if counted == 0 { 0 } else { score / counted };

    ClusterResourceUsage {
        total,
        used,
        free,
        score,
    }
}

/// True if the cluster can absorb the demand without growing.
pub fn cluster_fits_demand(usage: &ClusterResourceUsage, demand: (u64, u64, u64)) -> bool {
    usage.free.get(resnames::VCPUS) >= demand.0
        && usage.free.get(resnames::RAM_MB) >= demand.1
        && usage.free.get(resnames::DISK_GB) >= demand.2
}
