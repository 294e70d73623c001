//! Access-port specifications.
//!
//! Apps declare their reachable ports as a comma-separated string of
//! `proto:port[-endport][:tls]` entries, e.g. `"tcp:443,udp:5000-5002"`.
//! The parsed form is used for validation, port mapping, and URI
//! generation on AppInsts.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};

/// Layer-4 protocol of an access port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LProto {
    Tcp,
    Udp,
    Http,
}

impl LProto {
    pub fn as_str(&self) -> &'static str {
        match self {
            LProto::Tcp => "tcp",
            LProto::Udp => "udp",
            LProto::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(LProto::Tcp),
            "udp" => Some(LProto::Udp),
            "http" => Some(LProto::Http),
            _ => None,
        }
    }
}

/// A single parsed access port (or range).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPort {
    pub proto: LProto,
    pub internal_port: u16,
    /// End of the range; 0 for a single port.
    #[serde(default)]
    pub end_port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Externally visible port, assigned at placement; 0 until mapped.
    #[serde(default)]
    pub public_port: u16,
}

impl AppPort {
    /// The inclusive end of the range (the port itself for single ports).
    pub fn range_end(&self) -> u16 {
        if self.end_port == 0 {
            self.internal_port
        } else {
            self.end_port
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.internal_port <= port && port <= self.range_end()
    }
}

/// Parse an access-port string into its port list.
pub fn parse_access_ports(spec: &str) -> ModelResult<Vec<AppPort>> {
    let mut ports = Vec::new();
    if spec.trim().is_empty() {
        return Ok(ports);
    }
    for entry in spec.split(',') {
        let entry = entry.trim();
        let mut parts = entry.split(':');
        let proto_str = parts.next().unwrap_or_default();
        let proto = LProto::parse(proto_str)
            .ok_or_else(|| ModelError::invalid(format!("unknown protocol in port {entry:?}")))?;
        let range = parts
            .next()
            .ok_or_else(|| ModelError::invalid(format!("missing port number in {entry:?}")))?;
        let mut tls = false;
        for opt in parts {
            match opt {
                "tls" => tls = true,
                other => {
                    return Err(ModelError::invalid(format!(
                        "unknown port option {other:?} in {entry:?}"
                    )))
                }
            }
        }

        let (start, end) = match range.split_once('-') {
            Some((lo, hi)) => (parse_port(lo, entry)?, parse_port(hi, entry)?),
            None => (parse_port(range, entry)?, 0),
        };
        if end != 0 && end < start {
            return Err(ModelError::invalid(format!(
                "invalid port range {range:?}, end before start"
            )));
        }
        ports.push(AppPort {
            proto,
            internal_port: start,
            end_port: end,
            tls,
            public_port: 0,
        });
    }

    // Ranges of the same protocol must not overlap.
    for (i, a) in ports.iter().enumerate() {
        for b in &ports[i + 1..] {
            if a.proto == b.proto && a.internal_port <= b.range_end() && b.internal_port <= a.range_end() {
                return Err(ModelError::invalid(format!(
                    "duplicate or overlapping ports {}:{}",
                    a.proto.as_str(),
                    b.internal_port
                )));
            }
        }
    }
    Ok(ports)
}

fn parse_port(s: &str, entry: &str) -> ModelResult<u16> {
    let port: u32 = s
        .parse()
        .map_err(|_| ModelError::invalid(format!("non-numeric port in {entry:?}")))?;
    if port == 0 || port > 65535 {
        return Err(ModelError::invalid(format!(
            "port {port} out of range in {entry:?}"
        )));
    }
    Ok(port as u16)
}

/// Ports that cannot be health checked. Only tcp/http ports support
/// health checks; entries must be a subset of the access ports.
pub fn validate_skip_hc_ports(access_ports: &str, skip_hc: &str) -> ModelResult<()> {
    if skip_hc.is_empty() || skip_hc == "all" {
        return Ok(());
    }
    let ports = parse_access_ports(access_ports)?;
    let skips = parse_access_ports(skip_hc)
        .map_err(|e| ModelError::invalid(format!("cannot parse skip health-check ports: {e}")))?;
    for skip in &skips {
        if skip.proto == LProto::Udp {
            return Err(ModelError::invalid(
                "protocol udp unsupported for health checks",
            ));
        }
        for port in skip.internal_port..=skip.range_end() {
            let found = ports
                .iter()
                .any(|p| p.proto == skip.proto && p.contains(port));
            if !found {
                return Err(ModelError::invalid(format!(
                    "skip health-check port {port} not found in access ports"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_range() {
        let ports = parse_access_ports("tcp:443,udp:5000-5002").unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].proto, LProto::Tcp);
        assert_eq!(ports[0].internal_port, 443);
        assert_eq!(ports[0].range_end(), 443);
        assert_eq!(ports[1].internal_port, 5000);
        assert_eq!(ports[1].range_end(), 5002);
    }

    #[test]
    fn parses_tls_option() {
        let ports = parse_access_ports("tcp:443:tls").unwrap();
        assert!(ports[0].tls);
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(parse_access_ports("bogus:80").is_err());
        assert!(parse_access_ports("tcp:0").is_err());
        assert!(parse_access_ports("tcp:70000").is_err());
        assert!(parse_access_ports("tcp:500-100").is_err());
        assert!(parse_access_ports("tcp").is_err());
        assert!(parse_access_ports("tcp:443:wat").is_err());
    }

    #[test]
    fn rejects_overlapping_ranges() {
        assert!(parse_access_ports("tcp:100-200,tcp:150").is_err());
        // Different protocols may overlap.
        assert!(parse_access_ports("tcp:100,udp:100").is_ok());
    }

    #[test]
    fn empty_spec_is_empty() {
        assert!(parse_access_ports("").unwrap().is_empty());
    }

    #[test]
    fn skip_hc_subset_check() {
        assert!(validate_skip_hc_ports("tcp:100-110", "tcp:105").is_ok());
        assert!(validate_skip_hc_ports("tcp:100-110", "all").is_ok());
        assert!(validate_skip_hc_ports("tcp:100-110", "tcp:200").is_err());
        assert!(validate_skip_hc_ports("udp:100", "udp:100").is_err());
    }
}
