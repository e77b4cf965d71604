//! VPC peering
//!
//! A peering is a veth pair strung between two VPC bridges plus, for every
//! ordered pair of subnets across the two VPCs, a route in each subnet's
//! namespace toward the other subnet's CIDR. The fan-out is O(subnets(a) *
//! subnets(b)) route operations, fine for the small subnet counts this tool
//! targets.

use crate::error::{Error, Result};
use crate::exec::{Executor, link_exists, run_in_ns};
use crate::state::{Peering, StateStore, Subnet};
use crate::teardown::TeardownReport;
use crate::{cidr, ident};
use ipnet::Ipv4Net;
use tracing::{debug, info};

/// Manages pairwise VPC connectivity
pub struct PeeringManager<'a> {
    exec: &'a dyn Executor,
    store: &'a StateStore,
}

impl<'a> PeeringManager<'a> {
    pub fn new(exec: &'a dyn Executor, store: &'a StateStore) -> Self {
        Self { exec, store }
    }

    /// Create a peering connection between two VPCs
    pub fn peer(&self, vpc1_name: &str, vpc2_name: &str) -> Result<()> {
        info!(vpc1 = vpc1_name, vpc2 = vpc2_name, "creating peering connection");

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;
        let vpc1 = state.vpc(vpc1_name)?.clone();
        let vpc2 = state.vpc(vpc2_name)?.clone();

        if state.find_peering(vpc1_name, vpc2_name).is_some() {
            return Err(Error::PeeringAlreadyExists(
                vpc1_name.to_string(),
                vpc2_name.to_string(),
            ));
        }
        if cidr::overlaps(&vpc1.cidr, &vpc2.cidr) {
            return Err(Error::CidrOverlap(
                vpc1.cidr.to_string(),
                vpc2.cidr.to_string(),
            ));
        }

        let (veth1, veth2) = ident::peer_links(vpc1_name, vpc2_name);
        self.exec.run(
            &["ip", "link", "add", &veth1, "type", "veth", "peer", "name", &veth2],
            true,
        )?;

        self.exec
            .run(&["ip", "link", "set", &veth1, "master", &vpc1.bridge], true)?;
        self.exec.run(&["ip", "link", "set", &veth1, "up"], true)?;
        self.exec
            .run(&["ip", "link", "set", &veth2, "master", &vpc2.bridge], true)?;
        self.exec.run(&["ip", "link", "set", &veth2, "up"], true)?;

        // Route fan-out across the Cartesian product of subnets. Best-effort:
        // a route may already exist from a previous partial attempt.
        for s1 in vpc1.subnets.values() {
            for s2 in vpc2.subnets.values() {
                self.add_route(s1, &s2.cidr)?;
                self.add_route(s2, &s1.cidr)?;
            }
        }

        state.peerings.push(Peering {
            vpc1: vpc1_name.to_string(),
            vpc2: vpc2_name.to_string(),
            veth1,
            veth2,
        });
        self.store.save(&state)?;

        info!(
            vpc1 = vpc1_name, cidr1 = %vpc1.cidr,
            vpc2 = vpc2_name, cidr2 = %vpc2.cidr,
            "peering connection created"
        );
        Ok(())
    }

    /// Remove the peering between two VPCs, in either name order
    pub fn unpeer(&self, vpc1_name: &str, vpc2_name: &str) -> Result<()> {
        info!(vpc1 = vpc1_name, vpc2 = vpc2_name, "removing peering connection");

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;

        let idx = state.find_peering(vpc1_name, vpc2_name).ok_or_else(|| {
            Error::PeeringNotFound(vpc1_name.to_string(), vpc2_name.to_string())
        })?;
        let peering = state.peerings.remove(idx);

        // Deleting one end destroys both
        self.exec
            .run(&["ip", "link", "del", &peering.veth1], false)?;

        // Remove fan-out routes, best-effort; the namespaces may be gone
        let vpc1 = state.vpc(&peering.vpc1)?.clone();
        let vpc2 = state.vpc(&peering.vpc2)?.clone();
        for s1 in vpc1.subnets.values() {
            for s2 in vpc2.subnets.values() {
                self.del_route(s1, &s2.cidr)?;
                self.del_route(s2, &s1.cidr)?;
            }
        }

        self.store.save(&state)?;

        info!(vpc1 = vpc1_name, vpc2 = vpc2_name, "peering connection removed");
        Ok(())
    }

    /// Route toward `dest` via the gateway adjacent to the subnet's own
    /// address rather than the VPC-wide gateway
    fn add_route(&self, from: &Subnet, dest: &Ipv4Net) -> Result<()> {
        let gw = cidr::local_gateway(from.ip).to_string();
        debug!(ns = %from.namespace, dest = %dest, via = %gw, "adding peering route");
        run_in_ns(
            self.exec,
            &from.namespace,
            &["ip", "route", "add", &dest.to_string(), "via", &gw],
            false,
        )?;
        Ok(())
    }

    fn del_route(&self, from: &Subnet, dest: &Ipv4Net) -> Result<()> {
        run_in_ns(
            self.exec,
            &from.namespace,
            &["ip", "route", "del", &dest.to_string()],
            false,
        )?;
        Ok(())
    }
}

/// Delete a peering's veth link during cascading VPC teardown
pub(crate) fn teardown_peering_link(
    exec: &dyn Executor,
    peering: &Peering,
    report: &mut TeardownReport,
) {
    let step = format!("delete peering link {}", peering.veth1);
    match link_exists(exec, &peering.veth1) {
        Ok(true) => report.record_cmd(step, exec.run(&["ip", "link", "del", &peering.veth1], false)),
        Ok(false) => report.skip(step),
        Err(e) => report.record(step, Err::<(), _>(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;
    use crate::state::SubnetKind;
    use crate::state::testing::temp_store;
    use crate::subnet::SubnetManager;
    use crate::vpc::VpcManager;

    fn store_with_two_vpcs() -> (tempfile::TempDir, crate::state::StateStore) {
        let (dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let vpcs = VpcManager::new(&fake, &store);
        vpcs.create("demo", "10.0.0.0/16", "eth0").unwrap();
        vpcs.create("other", "10.1.0.0/16", "eth0").unwrap();
        (dir, store)
    }

    #[test]
    fn test_peer_records_single_symmetric_peering() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();

        PeeringManager::new(&fake, &store).peer("demo", "other").unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.peerings.len(), 1);
        assert!(state.find_peering("demo", "other").is_some());
        assert!(state.find_peering("other", "demo").is_some());

        let (veth1, veth2) = ident::peer_links("demo", "other");
        assert!(fake.ran(&format!("ip link set {veth1} master br-demo")));
        assert!(fake.ran(&format!("ip link set {veth2} master br-other")));
    }

    #[test]
    fn test_duplicate_peering_rejected_in_either_order() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        let mgr = PeeringManager::new(&fake, &store);

        mgr.peer("demo", "other").unwrap();
        let err = mgr.peer("other", "demo").unwrap_err();
        assert!(matches!(err, Error::PeeringAlreadyExists(_, _)));
    }

    #[test]
    fn test_overlapping_cidrs_rejected() {
        let (_dir, store) = temp_store();
        let fake = FakeExecutor::new();
        let vpcs = VpcManager::new(&fake, &store);
        vpcs.create("a", "10.0.0.0/16", "eth0").unwrap();
        vpcs.create("b", "10.0.128.0/17", "eth0").unwrap();

        let fake2 = FakeExecutor::new();
        let err = PeeringManager::new(&fake2, &store).peer("a", "b").unwrap_err();
        assert!(matches!(err, Error::CidrOverlap(_, _)));
        assert!(fake2.calls().is_empty());
    }

    #[test]
    fn test_route_fanout_covers_subnet_product() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        let subnets = SubnetManager::new(&fake, &store);
        subnets.create("demo", "web", "10.0.1.0/24", SubnetKind::Private).unwrap();
        subnets.create("demo", "db", "10.0.2.0/24", SubnetKind::Private).unwrap();
        subnets.create("other", "app", "10.1.1.0/24", SubnetKind::Private).unwrap();

        let fake2 = FakeExecutor::new();
        PeeringManager::new(&fake2, &store).peer("demo", "other").unwrap();

        // 2 subnets x 1 subnet, one route in each direction
        assert_eq!(fake2.count("ip route add"), 4);
        assert!(fake2.ran("ip netns exec ns-demo-web ip route add 10.1.1.0/24 via 10.0.1.1"));
        assert!(fake2.ran("ip netns exec ns-other-app ip route add 10.0.1.0/24 via 10.1.1.1"));
        assert!(fake2.ran("ip netns exec ns-other-app ip route add 10.0.2.0/24 via 10.1.1.1"));
    }

    #[test]
    fn test_unpeer_in_reverse_order() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        let mgr = PeeringManager::new(&fake, &store);
        mgr.peer("demo", "other").unwrap();

        mgr.unpeer("other", "demo").unwrap();

        let state = store.load().unwrap();
        assert!(state.peerings.is_empty());
        let (veth1, _) = ident::peer_links("demo", "other");
        assert!(fake.ran(&format!("ip link del {veth1}")));
    }

    #[test]
    fn test_unpeer_without_peering_fails() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        let err = PeeringManager::new(&fake, &store)
            .unpeer("demo", "other")
            .unwrap_err();
        assert!(matches!(err, Error::PeeringNotFound(_, _)));
    }

    #[test]
    fn test_unpeer_removes_fanout_routes() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        SubnetManager::new(&fake, &store)
            .create("demo", "web", "10.0.1.0/24", SubnetKind::Private)
            .unwrap();
        SubnetManager::new(&fake, &store)
            .create("other", "app", "10.1.1.0/24", SubnetKind::Private)
            .unwrap();
        let mgr = PeeringManager::new(&fake, &store);
        mgr.peer("demo", "other").unwrap();

        let fake2 = FakeExecutor::new();
        PeeringManager::new(&fake2, &store).unpeer("demo", "other").unwrap();

        assert!(fake2.ran("ip netns exec ns-demo-web ip route del 10.1.1.0/24"));
        assert!(fake2.ran("ip netns exec ns-other-app ip route del 10.0.1.0/24"));
    }

    #[test]
    fn test_peer_with_missing_vpc_fails() {
        let (_dir, store) = store_with_two_vpcs();
        let fake = FakeExecutor::new();
        let err = PeeringManager::new(&fake, &store).peer("demo", "ghost").unwrap_err();
        assert!(matches!(err, Error::VpcNotFound(_)));
    }
}
