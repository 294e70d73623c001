//! Infra flavor matching.
//!
//! Given requested node resources and a cloudlet's reported flavor list,
//! pick the closest infra flavor: sort by (vcpus, ram, disk) ascending
//! and take the first that fits. Optional resources (GPU categories)
//! match through the cloudlet's resource tag tables, and a flavor that
//! offers optional resources nobody asked for is skipped so a plain
//! request never silently lands on GPU hardware. Rejections are counted
//! per reason and aggregated into the error.

use std::collections::{BTreeMap, BTreeSet};

use edgegrid_model::{CloudletInfo, FlavorInfo, NodeResources, ResTagTable};
use tracing::debug;

use crate::error::{ResError, ResResult};
use crate::resval::resnames;

/// The chosen infra flavor and VM creation attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmSpec {
    pub flavor_name: String,
    /// Set when the flavor has no attached disk and a separate volume
    /// must be allocated.
    pub external_volume_gb: u64,
    pub availability_zone: String,
    pub image_name: String,
    pub flavor: FlavorInfo,
}

/// Optional-resource categories an infra flavor offers, judged by the
/// cloudlet's tag tables against the flavor's vendor properties.
pub fn infra_flavor_resources(
    flavor: &FlavorInfo,
    tbls: &BTreeMap<String, ResTagTable>,
) -> BTreeSet<String> {
    let mut offered = BTreeSet::new();
    if flavor.prop_map.is_empty() {
        return offered;
    }
    for (res, tbl) in tbls {
        for prop_val in flavor.prop_map.values() {
            for tag_val in tbl.tags.values() {
                if prop_val.contains(tag_val.as_str()) {
                    offered.insert(res.clone());
                }
            }
        }
    }
    offered
}

/// A parsed optional-resource request: `kind:count` or `kind:spec:count`
/// (`=` separators accepted).
struct OptResRequest<'a> {
    kind: &'a str,
    spec: &'a str,
    count: u64,
    /// Bare "gpu" requests match any GPU-ish tag key.
    wildcard: bool,
}

fn parse_opt_res_request<'a>(res: &str, request: &'a str) -> ResResult<OptResRequest<'a>> {
    let parts: Vec<&'a str> = request.split([':', '=']).collect();
    let (kind, spec, count_str) = match parts.len() {
        2 => (parts[0], "", parts[1]),
        3 => (parts[0], parts[1], parts[2]),
        _ => {
            return Err(ResError::NoFlavorMatch(format!(
                "invalid optional resource request {request:?} for {res}"
            )))
        }
    };
    let count: u64 = count_str
        .trim_matches(['\'', '"'])
        .parse()
        .map_err(|_| {
            ResError::NoFlavorMatch(format!(
                "non-numeric count in optional resource request {request:?}"
            ))
        })?;
    if count == 0 {
        return Err(ResError::NoFlavorMatch(format!(
            "zero count in optional resource request {request:?}"
        )));
    }
    Ok(OptResRequest {
        kind,
        spec,
        count,
        wildcard: kind == "gpu" && parts.len() == 2,
    })
}

/// Check one optional-resource request against one infra flavor through
/// one tag table.
fn matches_request(req: &OptResRequest<'_>, flavor: &FlavorInfo, tbl: &ResTagTable) -> bool {
    for (tag_key, tag_val) in &tbl.tags {
        for (prop_key, prop_val) in &flavor.prop_map {
            // Property values carry their own count: "alias=t4:1".
            let Some(sep) = prop_val.rfind([':', '=']) else {
                continue;
            };
            let prop_count: u64 = prop_val[sep + 1..]
                .trim_matches(['\'', '"'])
                .parse()
                .unwrap_or(0);
            if prop_count < req.count {
                continue;
            }
            if req.wildcard {
                if prop_key.contains(tag_key.as_str()) {
                    return true;
                }
            } else if req.kind == tag_key.as_str()
                && prop_key.contains(tag_key.as_str())
                && prop_val.contains(tag_val.as_str())
                && (req.spec.is_empty() || prop_val.contains(req.spec))
            {
                return true;
            }
        }
    }
    false
}

/// Verify that every requested optional resource is matched by `flavor`,
/// and that the flavor offers nothing that was not requested.
fn opt_res_lookup(
    node_res: &NodeResources,
    flavor: &FlavorInfo,
    tbls: &BTreeMap<String, ResTagTable>,
    skipped: &mut BTreeMap<String, u32>,
    skipped_extra: &mut u32,
) -> ResResult<bool> {
    let mut matched = BTreeSet::new();
    for (res, request) in &node_res.opt_res_map {
        let Some(tbl) = tbls.get(res) else {
            continue;
        };
        let req = parse_opt_res_request(res, request)?;
        if matches_request(&req, flavor, tbl) {
            matched.insert(res.clone());
        } else {
            *skipped.entry(res.clone()).or_insert(0) += 1;
            return Ok(false);
        }
    }
    let offered = infra_flavor_resources(flavor, tbls);
    if matched != offered {
        // Flavor satisfies the request but provides extras nobody asked
        // for; taking it would silently allocate scarce hardware.
        *skipped_extra += 1;
        return Ok(false);
    }
    Ok(true)
}

/// Validate that a GPU request is satisfiable on this cloudlet at all.
fn validate_gpu_request(
    node_res: &NodeResources,
    info: &CloudletInfo,
    tbls: &BTreeMap<String, ResTagTable>,
) -> ResResult<()> {
    let Some(request) = node_res.opt_res_map.get("gpu") else {
        return Ok(());
    };
    if !tbls.contains_key("gpu") {
        return Err(ResError::GpuUnsupported {
            cloudlet: info.key.to_string(),
            resource: "gpu".to_string(),
        });
    }
    let req = parse_opt_res_request("gpu", request)?;
    if !req.wildcard {
        let known: BTreeSet<&str> = tbls
            .values()
            .flat_map(|tbl| tbl.tags.keys().map(String::as_str))
            .collect();
        if !known.contains(req.kind) {
            return Err(ResError::GpuUnsupported {
                cloudlet: info.key.to_string(),
                resource: req.kind.to_string(),
            });
        }
    }
    Ok(())
}

/// Pick the closest infra flavor for a node resource request.
pub fn get_vm_spec(
    node_res: &NodeResources,
    info: &CloudletInfo,
    tbls: &BTreeMap<String, ResTagTable>,
) -> ResResult<VmSpec> {
    validate_gpu_request(node_res, info, tbls)?;
    if !node_res.opt_res_map.is_empty() && tbls.is_empty() {
        return Err(ResError::NoOptionalResources(info.key.to_string()));
    }

    let mut flavors: Vec<&FlavorInfo> = info.flavors.iter().collect();
    flavors.sort_by_key(|f| (f.vcpus, f.ram_mb, f.disk_gb));

    let mut skipped: BTreeMap<String, u32> = BTreeMap::new();
    let mut skipped_extra: u32 = 0;

    for flavor in flavors {
        if flavor.vcpus < node_res.vcpus {
            *skipped.entry(resnames::VCPUS.to_string()).or_insert(0) += 1;
            continue;
        }
        if flavor.ram_mb < node_res.ram_mb {
            *skipped.entry(resnames::RAM_MB.to_string()).or_insert(0) += 1;
            continue;
        }
        let mut external_volume_gb = 0;
        if flavor.disk_gb == 0 {
            // Zero-disk flavors allocate the volume separately.
            external_volume_gb = node_res.disk_gb;
        } else if flavor.disk_gb < node_res.disk_gb {
            *skipped.entry(resnames::DISK_GB.to_string()).or_insert(0) += 1;
            continue;
        }

        if !node_res.opt_res_map.is_empty() {
            if !opt_res_lookup(node_res, flavor, tbls, &mut skipped, &mut skipped_extra)? {
                continue;
            }
        } else {
            // Nothing optional requested: skip flavors that look like or
            // report optional hardware.
            if flavor.name.contains("gpu") {
                skipped_extra += 1;
                continue;
            }
            if !infra_flavor_resources(flavor, tbls).is_empty() {
                skipped_extra += 1;
                continue;
            }
        }

        let availability_zone = find_name_match("gpu", &info.availability_zones);
        let image_name = find_name_match("gpu", &info.os_images);
        debug!(flavor = %flavor.name, "found closest infra flavor");
        return Ok(VmSpec {
            flavor_name: flavor.name.clone(),
            external_volume_gb,
            availability_zone,
            image_name,
            flavor: flavor.clone(),
        });
    }

    let mut reasons: Vec<String> = skipped
        .iter()
        .map(|(res, count)| format!("{count} with not enough {res}"))
        .collect();
    reasons.sort();
    if skipped_extra > 0 {
        reasons.push(format!(
            "{skipped_extra} with optional resources not requested"
        ));
    }
    Err(ResError::NoFlavorMatch(reasons.join(", ")))
}

/// Find a named infra flavor directly.
pub fn get_vm_spec_for_flavor(flavor_name: &str, info: &CloudletInfo) -> ResResult<VmSpec> {
    let flavor = info
        .flavors
        .iter()
        .find(|f| f.name == flavor_name)
        .ok_or_else(|| {
            ResError::NoFlavorMatch(format!("cloudlet flavor {flavor_name} not found on cloudlet"))
        })?;
    Ok(VmSpec {
        flavor_name: flavor_name.to_string(),
        external_volume_gb: 0,
        availability_zone: find_name_match("gpu", &info.availability_zones),
        image_name: find_name_match("gpu", &info.os_images),
        flavor: flavor.clone(),
    })
}

fn find_name_match(substr: &str, names: &[String]) -> String {
    names
        .iter()
        .find(|n| n.to_lowercase().contains(substr))
        .cloned()
        .unwrap_or_default()
}
