//! NAT gateway management
//!
//! Public subnets get source NAT out the VPC's uplink interface: a
//! masquerade rule for the subnet range plus permissive forward rules in
//! both directions. The same primitive backs `subnet create --kind public`
//! and the standalone `nat enable` command.

use crate::error::Result;
use crate::exec::{Executor, ping_from};
use crate::state::StateStore;
use ipnet::Ipv4Net;
use tracing::info;

/// Well-known external address probed for internet reachability
const PROBE_ADDR: &str = "8.8.8.8";

/// Install masquerade and forward rules for a subnet range
pub(crate) fn enable_masquerade(exec: &dyn Executor, cidr: &Ipv4Net, uplink: &str) -> Result<()> {
    let range = cidr.to_string();
    exec.run(&["sysctl", "-w", "net.ipv4.ip_forward=1"], true)?;
    exec.run(
        &[
            "iptables",
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &range,
            "-o",
            uplink,
            "-j",
            "MASQUERADE",
        ],
        true,
    )?;
    exec.run(
        &["iptables", "-A", "FORWARD", "-s", &range, "-j", "ACCEPT"],
        true,
    )?;
    exec.run(
        &["iptables", "-A", "FORWARD", "-d", &range, "-j", "ACCEPT"],
        true,
    )?;
    Ok(())
}

/// Remove masquerade and forward rules; tolerates already-absent rules
pub(crate) fn disable_masquerade(exec: &dyn Executor, cidr: &Ipv4Net, uplink: &str) -> Result<()> {
    let range = cidr.to_string();
    exec.run(
        &[
            "iptables",
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            &range,
            "-o",
            uplink,
            "-j",
            "MASQUERADE",
        ],
        false,
    )?;
    exec.run(
        &["iptables", "-D", "FORWARD", "-s", &range, "-j", "ACCEPT"],
        false,
    )?;
    exec.run(
        &["iptables", "-D", "FORWARD", "-d", &range, "-j", "ACCEPT"],
        false,
    )?;
    Ok(())
}

/// Manages NAT egress for subnets
pub struct NatManager<'a> {
    exec: &'a dyn Executor,
    store: &'a StateStore,
}

impl<'a> NatManager<'a> {
    pub fn new(exec: &'a dyn Executor, store: &'a StateStore) -> Self {
        Self { exec, store }
    }

    /// Configure NAT egress for a subnet
    pub fn enable(&self, vpc: &str, subnet: &str) -> Result<()> {
        let _lock = self.store.lock()?;
        let state = self.store.load()?;
        let vpc_rec = state.vpc(vpc)?;
        let subnet_rec = state.subnet(vpc, subnet)?;

        info!(vpc, subnet, uplink = %vpc_rec.interface, "enabling NAT gateway");
        enable_masquerade(self.exec, &subnet_rec.cidr, &vpc_rec.interface)?;
        info!(vpc, subnet, "NAT gateway enabled");
        Ok(())
    }

    /// Remove NAT egress for a subnet
    pub fn disable(&self, vpc: &str, subnet: &str) -> Result<()> {
        let _lock = self.store.lock()?;
        let state = self.store.load()?;
        let vpc_rec = state.vpc(vpc)?;
        let subnet_rec = state.subnet(vpc, subnet)?;

        info!(vpc, subnet, "removing NAT gateway");
        disable_masquerade(self.exec, &subnet_rec.cidr, &vpc_rec.interface)?;
        info!(vpc, subnet, "NAT gateway removed");
        Ok(())
    }

    /// Probe internet reachability from inside the subnet's namespace
    pub fn test_internet(&self, vpc: &str, subnet: &str) -> Result<bool> {
        let state = self.store.load()?;
        let subnet_rec = state.subnet(vpc, subnet)?;

        info!(vpc, subnet, target = PROBE_ADDR, "testing internet connectivity");
        ping_from(self.exec, &subnet_rec.namespace, PROBE_ADDR)
    }
}
