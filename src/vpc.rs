//! VPC lifecycle
//!
//! A VPC is one kernel bridge carrying a CIDR block. The bridge owns the
//! first usable address of the block and acts as the gateway for every
//! subnet namespace attached to it.

use crate::error::{Error, Result};
use crate::exec::{Executor, link_exists};
use crate::state::{StateStore, Vpc};
use crate::teardown::TeardownReport;
use crate::{cidr, ident, peering, subnet};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Manages VPC provisioning and the cascading teardown of everything a VPC
/// owns or references
pub struct VpcManager<'a> {
    exec: &'a dyn Executor,
    store: &'a StateStore,
}

impl<'a> VpcManager<'a> {
    pub fn new(exec: &'a dyn Executor, store: &'a StateStore) -> Self {
        Self { exec, store }
    }

    /// Create a new VPC
    pub fn create(&self, name: &str, cidr_str: &str, uplink: &str) -> Result<()> {
        info!(vpc = name, cidr = cidr_str, "creating VPC");

        let net = cidr::parse(cidr_str)?;

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;
        if state.vpcs.contains_key(name) {
            return Err(Error::VpcAlreadyExists(name.to_string()));
        }

        let bridge = ident::bridge(name);

        // Reset-over-reuse: a leftover bridge from a failed run is deleted
        // and recreated rather than trusted in unknown configuration
        if link_exists(self.exec, &bridge)? {
            warn!(bridge = %bridge, "stale bridge found, deleting");
            self.exec.run(&["ip", "link", "del", &bridge], false)?;
        }

        self.exec
            .run(&["ip", "link", "add", &bridge, "type", "bridge"], true)?;

        // The bridge takes the first usable address so it can route between
        // subnets and toward the uplink
        let gateway = cidr::gateway_ip(&net)?;
        let addr = format!("{}/{}", gateway, net.prefix_len());
        self.exec
            .run(&["ip", "addr", "add", &addr, "dev", &bridge], true)?;
        self.exec.run(&["ip", "link", "set", &bridge, "up"], true)?;

        self.exec
            .run(&["sysctl", "-w", "net.ipv4.ip_forward=1"], true)?;

        // Permissive forwarding scoped to this bridge; duplicates from a
        // prior run are harmless
        self.exec.run(
            &["iptables", "-A", "FORWARD", "-i", &bridge, "-o", &bridge, "-j", "ACCEPT"],
            false,
        )?;
        self.exec.run(
            &["iptables", "-A", "FORWARD", "-i", &bridge, "-j", "ACCEPT"],
            false,
        )?;
        self.exec.run(
            &["iptables", "-A", "FORWARD", "-o", &bridge, "-j", "ACCEPT"],
            false,
        )?;

        state.vpcs.insert(
            name.to_string(),
            Vpc {
                cidr: net,
                bridge: bridge.clone(),
                interface: uplink.to_string(),
                subnets: BTreeMap::new(),
            },
        );
        self.store.save(&state)?;

        info!(vpc = name, bridge = %bridge, uplink, "VPC created");
        Ok(())
    }

    /// Delete a VPC and everything it owns: subnets first, then any peering
    /// referencing it, then the bridge. Best-effort throughout.
    pub fn delete(&self, name: &str) -> Result<TeardownReport> {
        info!(vpc = name, "deleting VPC");

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;
        let vpc = state.vpc(name)?.clone();

        let mut report = TeardownReport::default();

        for (subnet_name, subnet_rec) in &vpc.subnets {
            subnet::teardown_subnet(self.exec, &vpc, subnet_name, subnet_rec, &mut report);
        }

        let peerings = std::mem::take(&mut state.peerings);
        for p in peerings {
            if p.involves(name) {
                info!(vpc1 = %p.vpc1, vpc2 = %p.vpc2, "removing peering");
                peering::teardown_peering_link(self.exec, &p, &mut report);
            } else {
                state.peerings.push(p);
            }
        }

        self.teardown_bridge(&vpc.bridge, &mut report);

        state.vpcs.remove(name);
        self.store.save(&state)?;

        info!(vpc = name, "VPC deleted");
        Ok(report)
    }

    /// Tear down every VPC and sweep orphaned kernel objects left behind by
    /// interrupted runs
    pub fn cleanup_all(&self) -> Result<TeardownReport> {
        info!("cleaning up all VPCs and resources");

        let names: Vec<String> = self.store.load()?.vpcs.keys().cloned().collect();
        let mut report = TeardownReport::default();

        for name in names {
            match self.delete(&name) {
                Ok(sub) => report.steps.extend(sub.steps),
                Err(e) => {
                    error!(vpc = %name, error = %e, "error deleting VPC");
                    report.record(format!("delete VPC {name}"), Err::<(), _>(e));
                }
            }
        }

        // Orphaned namespaces: present in the kernel, absent from state
        let listing = self.exec.run(&["ip", "netns", "list"], false)?;
        for line in listing.stdout.lines() {
            let Some(ns) = line.split_whitespace().next() else {
                continue;
            };
            if ns.starts_with("ns-") {
                warn!(namespace = ns, "removing orphaned namespace");
                report.record_cmd(
                    format!("delete orphaned namespace {ns}"),
                    self.exec.run(&["ip", "netns", "del", ns], false),
                );
            }
        }

        // Orphaned bridges
        let listing = self
            .exec
            .run(&["ip", "link", "show", "type", "bridge"], false)?;
        for name in parse_bridge_names(&listing.stdout) {
            if name.starts_with("br-") {
                warn!(bridge = %name, "removing orphaned bridge");
                self.teardown_bridge(&name, &mut report);
            }
        }

        info!("cleanup completed");
        Ok(report)
    }

    fn teardown_bridge(&self, bridge: &str, report: &mut TeardownReport) {
        match link_exists(self.exec, bridge) {
            Ok(true) => {
                report.record_cmd(
                    format!("bring down bridge {bridge}"),
                    self.exec.run(&["ip", "link", "set", bridge, "down"], false),
                );
                report.record_cmd(
                    format!("delete bridge {bridge}"),
                    self.exec.run(&["ip", "link", "del", bridge], false),
                );
            }
            Ok(false) => report.skip(format!("delete bridge {bridge}")),
            Err(e) => report.record(format!("delete bridge {bridge}"), Err::<(), _>(e)),
        }
    }
}

/// Extract interface names from `ip link show` output lines like
/// `3: br-demo: <BROADCAST,...>` or `4: veth-x@if5: <...>`
fn parse_bridge_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            parts.next()?.trim().parse::<u32>().ok()?;
            let name = parts.next()?.trim();
            let name = name.split('@').next()?;
            Some(name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;
    use crate::state::testing::temp_store;
    use crate::state::{Peering, SubnetKind};
    use crate::subnet::SubnetManager;

    #[test]
    fn test_create_vpc_records_bridge_and_no_subnets() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();

        VpcManager::new(&fake, &store)
            .create("demo", "10.0.0.0/16", "eth0")
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.vpcs.len(), 1);
        let vpc = state.vpc("demo").unwrap();
        assert_eq!(vpc.bridge, "br-demo");
        assert_eq!(vpc.cidr.to_string(), "10.0.0.0/16");
        assert!(vpc.subnets.is_empty());

        assert!(fake.ran("ip link add br-demo type bridge"));
        assert!(fake.ran("ip addr add 10.0.0.1/16 dev br-demo"));
        assert!(fake.ran("ip link set br-demo up"));
        assert!(fake.ran("sysctl -w net.ipv4.ip_forward=1"));
    }

    #[test]
    fn test_duplicate_vpc_rejected() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let mgr = VpcManager::new(&fake, &store);

        mgr.create("demo", "10.0.0.0/16", "eth0").unwrap();
        let err = mgr.create("demo", "10.1.0.0/16", "eth0").unwrap_err();
        assert!(matches!(err, Error::VpcAlreadyExists(_)));
    }

    #[test]
    fn test_invalid_cidr_rejected_before_any_command() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();

        let err = VpcManager::new(&fake, &store)
            .create("demo", "300.0.0.0/16", "eth0")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCidr(_)));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_stale_bridge_reset_before_recreate() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        fake.add_link("br-demo");

        VpcManager::new(&fake, &store)
            .create("demo", "10.0.0.0/16", "eth0")
            .unwrap();

        let calls = fake.calls();
        let del = calls.iter().position(|c| c == "ip link del br-demo");
        let add = calls.iter().position(|c| c == "ip link add br-demo type bridge");
        assert!(del.unwrap() < add.unwrap());
    }

    #[test]
    fn test_delete_cascades_to_subnets_and_peerings() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let vpcs = VpcManager::new(&fake, &store);
        vpcs.create("demo", "10.0.0.0/16", "eth0").unwrap();
        SubnetManager::new(&fake, &store)
            .create("demo", "web", "10.0.1.0/24", SubnetKind::Public)
            .unwrap();

        // Inject a peering record referencing the VPC
        let mut state = store.load().unwrap();
        state.peerings.push(Peering {
            vpc1: "demo".to_string(),
            vpc2: "other".to_string(),
            veth1: "peer-aaaaaaa".to_string(),
            veth2: "peer-aaaaab".to_string(),
        });
        store.save(&state).unwrap();

        let fake2 = FakeExecutor::new();
        fake2.add_link("br-demo");
        fake2.add_link("peer-aaaaaaa");
        fake2.add_namespace("ns-demo-web");
        let report = VpcManager::new(&fake2, &store).delete("demo").unwrap();

        assert!(fake2.ran("ip netns del ns-demo-web"));
        assert!(fake2.ran("ip link del br-demo"));
        assert!(fake2.ran("ip link del peer-aaaaaaa"));
        assert!(report.is_clean());

        let state = store.load().unwrap();
        assert!(state.vpcs.is_empty());
        assert!(state.peerings.is_empty());
    }

    #[test]
    fn test_delete_keeps_unrelated_peerings() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let vpcs = VpcManager::new(&fake, &store);
        vpcs.create("demo", "10.0.0.0/16", "eth0").unwrap();

        let mut state = store.load().unwrap();
        state.peerings.push(Peering {
            vpc1: "a".to_string(),
            vpc2: "b".to_string(),
            veth1: "peer-bbbbbba".to_string(),
            veth2: "peer-bbbbbbb".to_string(),
        });
        store.save(&state).unwrap();

        VpcManager::new(&fake, &store).delete("demo").unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.peerings.len(), 1);
        assert_eq!(state.peerings[0].vpc1, "a");
    }

    #[test]
    fn test_delete_unknown_vpc_fails() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let err = VpcManager::new(&fake, &store).delete("ghost").unwrap_err();
        assert!(matches!(err, Error::VpcNotFound(_)));
    }

    #[test]
    fn test_cleanup_all_empties_state() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let mgr = VpcManager::new(&fake, &store);
        mgr.create("demo", "10.0.0.0/16", "eth0").unwrap();
        mgr.create("other", "10.1.0.0/16", "eth0").unwrap();

        mgr.cleanup_all().unwrap();

        assert!(store.load().unwrap().vpcs.is_empty());
    }

    #[test]
    fn test_cleanup_sweeps_orphaned_namespaces() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        fake.add_namespace("ns-stale-thing");
        fake.add_namespace("unrelated");

        VpcManager::new(&fake, &store).cleanup_all().unwrap();

        assert!(fake.ran("ip netns del ns-stale-thing"));
        assert!(!fake.ran("ip netns del unrelated"));
    }

    #[test]
    fn test_parse_bridge_names() {
        let out = "3: br-demo: <BROADCAST,MULTICAST,UP> mtu 1500\n\
                   5: br-other@if2: <BROADCAST> mtu 1500\n\
                   garbage line\n";
        assert_eq!(parse_bridge_names(out), vec!["br-demo", "br-other"]);
    }
}
