//! Outbound security rules and CIDR containment.
//!
//! Trust policies allow a set of outbound connections; trusted Apps
//! declare the outbound connections they require. An App fits a cloudlet
//! when every required connection is contained in some allowed rule.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// An allowed or required outbound connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// "tcp", "udp", or "icmp".
    pub protocol: String,
    /// Remote network in CIDR notation.
    pub remote_cidr: String,
    /// Port range; ignored for icmp.
    #[serde(default)]
    pub port_range_min: u16,
    #[serde(default)]
    pub port_range_max: u16,
}

impl SecurityRule {
    pub fn new(protocol: &str, cidr: &str, min: u16, max: u16) -> Self {
        Self {
            protocol: protocol.to_string(),
            remote_cidr: cidr.to_string(),
            port_range_min: min,
            port_range_max: max,
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        match self.protocol.to_ascii_lowercase().as_str() {
            "tcp" | "udp" | "icmp" => {}
            other => {
                return Err(ModelError::invalid(format!(
                    "invalid protocol {other:?} in security rule"
                )))
            }
        }
        parse_cidr(&self.remote_cidr)?;
        if !self.protocol.eq_ignore_ascii_case("icmp") {
            if self.port_range_min == 0 {
                return Err(ModelError::invalid(
                    "port range min cannot be zero in security rule",
                ));
            }
            if self.port_range_max < self.port_range_min {
                return Err(ModelError::invalid(format!(
                    "invalid port range {}-{} in security rule",
                    self.port_range_min, self.port_range_max
                )));
            }
        }
        Ok(())
    }

    /// True if this (allowed) rule covers the required rule `req`.
    pub fn covers(&self, req: &SecurityRule) -> ModelResult<bool> {
        if !self.protocol.eq_ignore_ascii_case(&req.protocol) {
            return Ok(false);
        }
        let outer = parse_cidr(&self.remote_cidr)?;
        let inner = parse_cidr(&req.remote_cidr)?;
        if !cidr_contains(&outer, &inner) {
            return Ok(false);
        }
        if !req.protocol.eq_ignore_ascii_case("icmp")
            && (req.port_range_min < self.port_range_min
                || req.port_range_max > self.port_range_max)
        {
            return Ok(false);
        }
        Ok(true)
    }
}

pub fn validate_security_rules(rules: &[SecurityRule]) -> ModelResult<()> {
    for rule in rules {
        rule.validate()?;
    }
    Ok(())
}

/// A parsed CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

/// Parse "a.b.c.d/len" or "v6addr/len".
pub fn parse_cidr(s: &str) -> ModelResult<Cidr> {
    let (addr_str, len_str) = s
        .split_once('/')
        .ok_or_else(|| ModelError::invalid(format!("invalid CIDR {s:?}, missing prefix length")))?;
    let addr: IpAddr = addr_str
        .parse()
        .map_err(|_| ModelError::invalid(format!("invalid CIDR address {addr_str:?}")))?;
    let prefix: u8 = len_str
        .parse()
        .map_err(|_| ModelError::invalid(format!("invalid CIDR prefix {len_str:?}")))?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(ModelError::invalid(format!(
            "CIDR prefix /{prefix} too long for {addr_str}"
        )));
    }
    Ok(Cidr { addr, prefix })
}

/// True if `outer` contains the entire `inner` network.
pub fn cidr_contains(outer: &Cidr, inner: &Cidr) -> bool {
    if inner.prefix < outer.prefix {
        return false;
    }
    match (outer.addr, inner.addr) {
        (IpAddr::V4(o), IpAddr::V4(i)) => {
            let mask = prefix_mask_v4(outer.prefix);
            (u32::from(o) & mask) == (u32::from(i) & mask)
        }
        (IpAddr::V6(o), IpAddr::V6(i)) => {
            let mask = prefix_mask_v6(outer.prefix);
            (u128::from(o) & mask) == (u128::from(i) & mask)
        }
        _ => false,
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parse_and_contains() {
        let outer = parse_cidr("10.0.0.0/16").unwrap();
        let inner = parse_cidr("10.0.5.0/24").unwrap();
        let outside = parse_cidr("10.1.0.0/24").unwrap();
        assert!(cidr_contains(&outer, &inner));
        assert!(!cidr_contains(&outer, &outside));
        // A narrower prefix never contains a wider one.
        assert!(!cidr_contains(&inner, &outer));
    }

    #[test]
    fn cidr_rejects_malformed() {
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0/8").is_err());
        assert!(parse_cidr("10.0.0.0/40").is_err());
    }

    #[test]
    fn rule_covers_protocol_cidr_and_ports() {
        let allowed = SecurityRule::new("tcp", "10.0.0.0/8", 1, 1024);
        let ok = SecurityRule::new("tcp", "10.2.0.0/16", 80, 80);
        let wrong_proto = SecurityRule::new("udp", "10.2.0.0/16", 80, 80);
        let wide_ports = SecurityRule::new("tcp", "10.2.0.0/16", 80, 2048);
        let wide_cidr = SecurityRule::new("tcp", "10.0.0.0/4", 80, 80);
        assert!(allowed.covers(&ok).unwrap());
        assert!(!allowed.covers(&wrong_proto).unwrap());
        assert!(!allowed.covers(&wide_ports).unwrap());
        assert!(!allowed.covers(&wide_cidr).unwrap());
    }

    #[test]
    fn icmp_ignores_ports() {
        let allowed = SecurityRule::new("icmp", "0.0.0.0/0", 0, 0);
        let req = SecurityRule::new("icmp", "8.8.8.8/32", 0, 0);
        assert!(allowed.covers(&req).unwrap());
    }

    #[test]
    fn rule_validation() {
        assert!(SecurityRule::new("tcp", "10.0.0.0/8", 80, 80).validate().is_ok());
        assert!(SecurityRule::new("gre", "10.0.0.0/8", 80, 80).validate().is_err());
        assert!(SecurityRule::new("tcp", "10.0.0.0/8", 0, 80).validate().is_err());
        assert!(SecurityRule::new("tcp", "10.0.0.0/8", 90, 80).validate().is_err());
        assert!(SecurityRule::new("icmp", "10.0.0.0/8", 0, 0).validate().is_ok());
    }
}
