//! Kernel object naming
//!
//! Linux caps interface names at 15 bytes (IFNAMSIZ minus the NUL), so link
//! names are derived from a fixed-width digest of the logical names rather
//! than the names themselves. Namespace names have looser limits and stay
//! human-readable.

use sha2::{Digest, Sha256};

/// Maximum interface name length on Linux
pub const IFNAME_MAX: usize = 15;

/// Canonical interface name inside every subnet namespace
pub const NS_IFACE: &str = "eth0";

/// Deterministic 6-hex-char token for a sequence of logical names.
/// Parts are length-prefixed so ("a-b", "c") and ("a", "b-c") cannot collide.
fn token(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..3])
}

/// Host-side veth endpoint for a subnet (e.g. "veth-3a91bc")
pub fn veth_host(vpc: &str, subnet: &str) -> String {
    format!("veth-{}", token(&[vpc, subnet]))
}

/// Namespace-side veth endpoint for a subnet, before it is renamed to
/// [`NS_IFACE`] inside the namespace (e.g. "vpeer-3a91bc")
pub fn veth_ns(vpc: &str, subnet: &str) -> String {
    format!("vpeer-{}", token(&[vpc, subnet]))
}

/// Network namespace name for a subnet
pub fn namespace(vpc: &str, subnet: &str) -> String {
    format!("ns-{vpc}-{subnet}")
}

/// Bridge name for a VPC. Falls back to a hashed form when the plain name
/// would exceed the kernel limit.
pub fn bridge(vpc: &str) -> String {
    let name = format!("br-{vpc}");
    if name.len() <= IFNAME_MAX {
        name
    } else {
        format!("br-{}", token(&[vpc]))
    }
}

/// Veth endpoint pair for a peering link, one end per bridge
pub fn peer_links(vpc1: &str, vpc2: &str) -> (String, String) {
    let tok = token(&[vpc1, vpc2]);
    (format!("peer-{tok}a"), format!("peer-{tok}b"))
}
