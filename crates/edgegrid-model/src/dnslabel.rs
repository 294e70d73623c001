//! DNS label derivation.
//!
//! Every AppInst and ClusterInst carries a DNS label unique among all
//! objects on its cloudlet. Labels are derived by sanitizing the object
//! name to DNS-1123 form; collisions get a numeric suffix. Uniqueness is
//! enforced by the store layer through a per-cloudlet label registry.

/// Maximum DNS-1123 label length.
pub const DNS_LABEL_MAX: usize = 63;

/// Sanitize a name into a DNS-1123 label: lowercase alphanumerics and
/// dashes, no leading/trailing dash, at most 63 characters.
pub fn dns_sanitize(name: &str) -> String {
    let mut label: String = name
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label = label.trim_matches('-').to_string();
    if label.len() > DNS_LABEL_MAX {
        label.truncate(DNS_LABEL_MAX);
        label = label.trim_end_matches('-').to_string();
    }
    if label.is_empty() {
        label = "x".to_string();
    }
    label
}

/// The candidate label for attempt `n`: the sanitized base for n == 0,
/// then base + numeric suffix, keeping within the length limit.
pub fn dns_label_candidate(base: &str, n: u32) -> String {
    if n == 0 {
        return base.to_string();
    }
    let suffix = n.to_string();
    let keep = DNS_LABEL_MAX.saturating_sub(suffix.len());
    let mut label = base.to_string();
    if label.len() > keep {
        label.truncate(keep);
        label = label.trim_end_matches('-').to_string();
    }
    label.push_str(&suffix);
    label
}
