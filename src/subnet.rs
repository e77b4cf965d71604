//! Subnet lifecycle
//!
//! A subnet is one network namespace wired to its VPC bridge through a veth
//! pair. Provisioning runs in strict order: namespace, veth pair, bridge
//! attach, addressing, routing, forwarding, NAT. Partial failure aborts and
//! leaves kernel objects in place for the cascading delete to reap.

use crate::error::{Error, Result};
use crate::exec::{Executor, link_exists, namespace_exists, ping_from, run_in_ns};
use crate::state::{StateStore, Subnet, SubnetKind, Vpc};
use crate::teardown::TeardownReport;
use crate::{cidr, ident, nat};
use tracing::{info, warn};

/// Manages subnet provisioning inside a VPC
pub struct SubnetManager<'a> {
    exec: &'a dyn Executor,
    store: &'a StateStore,
}

impl<'a> SubnetManager<'a> {
    pub fn new(exec: &'a dyn Executor, store: &'a StateStore) -> Self {
        Self { exec, store }
    }

    /// Create a subnet within a VPC
    pub fn create(
        &self,
        vpc_name: &str,
        subnet_name: &str,
        cidr_str: &str,
        kind: SubnetKind,
    ) -> Result<()> {
        info!(vpc = vpc_name, subnet = subnet_name, cidr = cidr_str, "creating subnet");

        let net = cidr::parse(cidr_str)?;

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;
        let vpc = state.vpc(vpc_name)?.clone();

        if vpc.subnets.contains_key(subnet_name) {
            return Err(Error::SubnetAlreadyExists {
                vpc: vpc_name.to_string(),
                subnet: subnet_name.to_string(),
            });
        }
        if !cidr::contains(&vpc.cidr, &net) {
            return Err(Error::CidrNotContained {
                subnet: net.to_string(),
                vpc: vpc.cidr.to_string(),
            });
        }

        // Namespace, reset-over-reuse for stale leftovers
        let ns = ident::namespace(vpc_name, subnet_name);
        if namespace_exists(self.exec, &ns)? {
            warn!(namespace = %ns, "stale namespace found, deleting");
            self.exec.run(&["ip", "netns", "del", &ns], false)?;
        }
        self.exec.run(&["ip", "netns", "add", &ns], true)?;

        // Veth pair; the namespace end is renamed to the canonical name once
        // it is inside the namespace
        let veth_host = ident::veth_host(vpc_name, subnet_name);
        let veth_ns = ident::veth_ns(vpc_name, subnet_name);
        self.exec.run(
            &["ip", "link", "add", &veth_host, "type", "veth", "peer", "name", &veth_ns],
            true,
        )?;
        self.exec
            .run(&["ip", "link", "set", &veth_ns, "netns", &ns], true)?;
        run_in_ns(
            self.exec,
            &ns,
            &["ip", "link", "set", &veth_ns, "name", ident::NS_IFACE],
            true,
        )?;

        // Attach the host end to the VPC bridge
        self.exec
            .run(&["ip", "link", "set", &veth_host, "master", &vpc.bridge], true)?;
        self.exec.run(&["ip", "link", "set", &veth_host, "up"], true)?;

        // Address the namespace interface with the second usable host address
        let ns_ip = cidr::namespace_ip(&net)?;
        let addr = format!("{}/{}", ns_ip, net.prefix_len());
        run_in_ns(
            self.exec,
            &ns,
            &["ip", "addr", "add", &addr, "dev", ident::NS_IFACE],
            true,
        )?;
        run_in_ns(self.exec, &ns, &["ip", "link", "set", ident::NS_IFACE, "up"], true)?;
        run_in_ns(self.exec, &ns, &["ip", "link", "set", "lo", "up"], true)?;

        // Routes via the bridge gateway. The gateway lives on the bridge,
        // outside this subnet's range, so the kernel only accepts it with
        // the onlink flag. Best-effort: the route may survive a prior
        // partial attempt.
        let gateway = cidr::gateway_ip(&vpc.cidr)?.to_string();
        let vpc_range = vpc.cidr.to_string();
        run_in_ns(
            self.exec,
            &ns,
            &["ip", "route", "add", &vpc_range, "via", &gateway, "dev", ident::NS_IFACE, "onlink"],
            false,
        )?;
        run_in_ns(
            self.exec,
            &ns,
            &["ip", "route", "add", "default", "via", &gateway, "dev", ident::NS_IFACE, "onlink"],
            false,
        )?;

        run_in_ns(self.exec, &ns, &["sysctl", "-w", "net.ipv4.ip_forward=1"], true)?;

        if kind == SubnetKind::Public {
            info!(subnet = subnet_name, "configuring NAT for public subnet");
            nat::enable_masquerade(self.exec, &net, &vpc.interface)?;
        }

        state.vpc_mut(vpc_name)?.subnets.insert(
            subnet_name.to_string(),
            Subnet {
                cidr: net,
                kind,
                namespace: ns.clone(),
                veth_host,
                veth_ns: ident::NS_IFACE.to_string(),
                ip: ns_ip,
            },
        );
        self.store.save(&state)?;

        info!(vpc = vpc_name, subnet = subnet_name, namespace = %ns, ip = %ns_ip, "subnet created");
        Ok(())
    }

    /// Delete a subnet and its kernel objects
    pub fn delete(&self, vpc_name: &str, subnet_name: &str) -> Result<TeardownReport> {
        info!(vpc = vpc_name, subnet = subnet_name, "deleting subnet");

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;
        let vpc = state.vpc(vpc_name)?.clone();
        let subnet = state.subnet(vpc_name, subnet_name)?.clone();

        let mut report = TeardownReport::default();
        teardown_subnet(self.exec, &vpc, subnet_name, &subnet, &mut report);

        state.vpc_mut(vpc_name)?.subnets.remove(subnet_name);
        self.store.save(&state)?;

        info!(vpc = vpc_name, subnet = subnet_name, "subnet deleted");
        Ok(report)
    }

    /// Probe reachability from one subnet's namespace to another's address
    pub fn test_connectivity(
        &self,
        vpc_name: &str,
        from_subnet: &str,
        to_subnet: &str,
    ) -> Result<bool> {
        let state = self.store.load()?;
        let from = state.subnet(vpc_name, from_subnet)?;
        let to = state.subnet(vpc_name, to_subnet)?;

        info!(from = %from.namespace, target = %to.ip, "testing connectivity");
        ping_from(self.exec, &from.namespace, &to.ip.to_string())
    }
}

/// Tear down a subnet's kernel objects, best-effort, recording each step.
/// Shared between subnet delete and the cascading VPC delete.
pub(crate) fn teardown_subnet(
    exec: &dyn Executor,
    vpc: &Vpc,
    subnet_name: &str,
    subnet: &Subnet,
    report: &mut TeardownReport,
) {
    // Stop any workload still running inside the namespace. pkill exits
    // non-zero when nothing matched, so this step is always tolerated.
    report.record(
        format!("stop workloads in {}", subnet.namespace),
        stop_workloads(exec, &subnet.namespace),
    );

    if subnet.kind == SubnetKind::Public {
        report.record(
            format!("remove NAT rules for {subnet_name}"),
            nat::disable_masquerade(exec, &subnet.cidr, &vpc.interface),
        );
    } else {
        report.skip(format!("remove NAT rules for {subnet_name}"));
    }

    // Flush any namespace-local firewall rules
    report.record(
        format!("flush firewall rules in {}", subnet.namespace),
        flush_ns_rules(exec, &subnet.namespace),
    );

    // Deleting the host end destroys the namespace peer with it
    match link_exists(exec, &subnet.veth_host) {
        Ok(true) => report.record_cmd(
            format!("delete veth {}", subnet.veth_host),
            exec.run(&["ip", "link", "del", &subnet.veth_host], false),
        ),
        Ok(false) => report.skip(format!("delete veth {}", subnet.veth_host)),
        Err(e) => report.record(format!("delete veth {}", subnet.veth_host), Err::<(), _>(e)),
    }

    match namespace_exists(exec, &subnet.namespace) {
        Ok(true) => report.record_cmd(
            format!("delete namespace {}", subnet.namespace),
            exec.run(&["ip", "netns", "del", &subnet.namespace], false),
        ),
        Ok(false) => report.skip(format!("delete namespace {}", subnet.namespace)),
        Err(e) => report.record(format!("delete namespace {}", subnet.namespace), Err::<(), _>(e)),
    }
}

fn stop_workloads(exec: &dyn Executor, ns: &str) -> Result<()> {
    for proc in ["python3", "nginx"] {
        run_in_ns(exec, ns, &["pkill", "-9", proc], false)?;
    }
    Ok(())
}

fn flush_ns_rules(exec: &dyn Executor, ns: &str) -> Result<()> {
    run_in_ns(exec, ns, &["iptables", "-F"], false)?;
    run_in_ns(exec, ns, &["iptables", "-X"], false)?;
    Ok(())
}
