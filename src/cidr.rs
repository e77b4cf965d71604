//! CIDR validation and address derivation
//!
//! Addressing convention: the first usable host address of a CIDR belongs to
//! the VPC bridge (the gateway), the second usable belongs to the subnet's
//! namespace interface.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parse an IPv4 CIDR, normalizing any host bits to the network address
pub fn parse(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
    Ok(net.trunc())
}

/// True when every address of `child` lies inside `parent` (reflexive)
pub fn contains(parent: &Ipv4Net, child: &Ipv4Net) -> bool {
    parent.contains(child)
}

/// True when the two networks share any address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(b) || b.contains(a)
}

/// First usable host address, assigned to the VPC bridge as the gateway
pub fn gateway_ip(net: &Ipv4Net) -> Result<Ipv4Addr> {
    net.hosts()
        .next()
        .ok_or_else(|| Error::InvalidCidr(format!("{net} has no usable addresses")))
}

/// Second usable host address, assigned to the namespace interface.
/// Falls back to the first usable for networks with a single host.
pub fn namespace_ip(net: &Ipv4Net) -> Result<Ipv4Addr> {
    let mut hosts = net.hosts();
    let first = hosts
        .next()
        .ok_or_else(|| Error::InvalidCidr(format!("{net} has no usable addresses")))?;
    Ok(hosts.next().unwrap_or(first))
}

/// Gateway shortcut for peering routes: the `.1` address next to the
/// namespace address. Looser than routing via the VPC-wide gateway, but the
/// bridge answers for it on the same segment.
pub fn local_gateway(ip: Ipv4Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        assert_eq!(parse("10.0.0.0/16").unwrap().to_string(), "10.0.0.0/16");
        // Host bits are truncated, not rejected
        assert_eq!(parse("10.0.1.5/24").unwrap().to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse("10.0.0.0").is_err());
        assert!(parse("10.0.0.0/33").is_err());
        assert!(parse("not-a-cidr").is_err());
        assert!(parse("fd00::/64").is_err());
    }

    #[test]
    fn test_containment() {
        let vpc = parse("10.0.0.0/16").unwrap();
        assert!(contains(&vpc, &parse("10.0.1.0/24").unwrap()));
        assert!(!contains(&vpc, &parse("10.1.0.0/24").unwrap()));
        assert!(!contains(&vpc, &parse("10.0.0.0/8").unwrap()));
    }

    #[test]
    fn test_containment_is_reflexive() {
        let vpc = parse("10.0.0.0/16").unwrap();
        assert!(contains(&vpc, &vpc));
    }

    #[test]
    fn test_overlap() {
        let a = parse("10.0.0.0/16").unwrap();
        let b = parse("10.0.128.0/17").unwrap();
        let c = parse("10.1.0.0/16").unwrap();
        assert!(overlaps(&a, &b));
        assert!(overlaps(&b, &a));
        assert!(!overlaps(&a, &c));
    }

    #[test]
    fn test_address_derivation() {
        let net = parse("10.0.1.0/24").unwrap();
        assert_eq!(gateway_ip(&net).unwrap(), "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(namespace_ip(&net).unwrap(), "10.0.1.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_local_gateway() {
        assert_eq!(
            local_gateway("10.0.1.2".parse().unwrap()),
            "10.0.1.1".parse::<Ipv4Addr>().unwrap()
        );
    }
}
