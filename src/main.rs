//! vpcctl - single-host VPC provisioning
//!
//! Builds VPC-like network topologies out of Linux network namespaces,
//! bridges, and veth pairs, with iptables for NAT and subnet firewalling.

mod cidr;
mod cli;
mod error;
mod exec;
mod firewall;
mod ident;
mod nat;
mod peering;
mod state;
mod subnet;
mod teardown;
mod vpc;

use cli::{Cli, Commands, FirewallAction, NatAction, PeeringAction, SubnetAction, VpcAction};
use error::Result;
use exec::SystemExecutor;
use firewall::PolicyManager;
use nat::NatManager;
use peering::PeeringManager;
use state::StateStore;
use subnet::SubnetManager;
use teardown::{Outcome, TeardownReport};
use tracing_subscriber::EnvFilter;
use vpc::VpcManager;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exec = SystemExecutor;
    let store = StateStore::new(&cli.state_file);

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            return Ok(());
        }

        Commands::Vpc { action } => {
            let vpcs = VpcManager::new(&exec, &store);
            match action {
                VpcAction::Create { name, cidr, interface } => {
                    vpcs.create(&name, &cidr, &interface)?;
                    println!("VPC '{}' created ({})", name, cidr);
                }
                VpcAction::Delete { name } => {
                    let report = vpcs.delete(&name)?;
                    print_report(&report);
                    println!("VPC '{}' deleted", name);
                }
                VpcAction::List => {
                    let state = store.load()?;
                    if state.vpcs.is_empty() {
                        println!("No VPCs");
                    }
                    for (name, vpc) in &state.vpcs {
                        println!(
                            "{}: {} (bridge {}, {} subnet{})",
                            name,
                            vpc.cidr,
                            vpc.bridge,
                            vpc.subnets.len(),
                            if vpc.subnets.len() == 1 { "" } else { "s" }
                        );
                    }
                }
            }
        }

        Commands::Subnet { action } => {
            let subnets = SubnetManager::new(&exec, &store);
            match action {
                SubnetAction::Create { vpc, name, cidr, kind } => {
                    subnets.create(&vpc, &name, &cidr, kind)?;
                    println!("Subnet '{}' created in VPC '{}' ({}, {})", name, vpc, cidr, kind);
                }
                SubnetAction::Delete { vpc, name } => {
                    let report = subnets.delete(&vpc, &name)?;
                    print_report(&report);
                    println!("Subnet '{}' deleted from VPC '{}'", name, vpc);
                }
                SubnetAction::List { vpc } => {
                    let state = store.load()?;
                    let vpc_rec = state.vpc(&vpc)?;
                    if vpc_rec.subnets.is_empty() {
                        println!("No subnets in VPC '{}'", vpc);
                    }
                    for (name, subnet) in &vpc_rec.subnets {
                        println!(
                            "{}: {} ({}) ns={} ip={}",
                            name, subnet.cidr, subnet.kind, subnet.namespace, subnet.ip
                        );
                    }
                }
            }
        }

        Commands::Peering { action } => {
            let peerings = PeeringManager::new(&exec, &store);
            match action {
                PeeringAction::Create { vpc1, vpc2 } => {
                    peerings.peer(&vpc1, &vpc2)?;
                    println!("Peering created between '{}' and '{}'", vpc1, vpc2);
                }
                PeeringAction::Delete { vpc1, vpc2 } => {
                    peerings.unpeer(&vpc1, &vpc2)?;
                    println!("Peering removed between '{}' and '{}'", vpc1, vpc2);
                }
                PeeringAction::List => {
                    let state = store.load()?;
                    if state.peerings.is_empty() {
                        println!("No peerings");
                    }
                    for p in &state.peerings {
                        println!("{} <-> {} ({} / {})", p.vpc1, p.vpc2, p.veth1, p.veth2);
                    }
                }
            }
        }

        Commands::Firewall { action } => {
            let policies = PolicyManager::new(&exec, &store);
            match action {
                FirewallAction::Apply { vpc, subnet, policy } => {
                    let policy = firewall::load_policy(&policy)?;
                    policies.apply(&vpc, &subnet, &policy)?;
                    println!("Policy applied to '{}/{}'", vpc, subnet);
                }
                FirewallAction::Clear { vpc, subnet } => {
                    policies.clear(&vpc, &subnet)?;
                    println!("Policy cleared from '{}/{}'", vpc, subnet);
                }
                FirewallAction::Show { vpc, subnet } => {
                    print!("{}", policies.show(&vpc, &subnet)?);
                }
            }
        }

        Commands::Nat { action } => {
            let nat = NatManager::new(&exec, &store);
            match action {
                NatAction::Enable { vpc, subnet } => {
                    nat.enable(&vpc, &subnet)?;
                    println!("NAT enabled for '{}/{}'", vpc, subnet);
                }
                NatAction::Disable { vpc, subnet } => {
                    nat.disable(&vpc, &subnet)?;
                    println!("NAT disabled for '{}/{}'", vpc, subnet);
                }
                NatAction::Test { vpc, subnet } => {
                    if nat.test_internet(&vpc, &subnet)? {
                        println!("Internet reachable from '{}/{}'", vpc, subnet);
                    } else {
                        println!("Internet NOT reachable from '{}/{}'", vpc, subnet);
                        std::process::exit(1);
                    }
                }
            }
        }

        Commands::Ping { vpc, from_subnet, to_subnet } => {
            let subnets = SubnetManager::new(&exec, &store);
            if subnets.test_connectivity(&vpc, &from_subnet, &to_subnet)? {
                println!("'{}' can reach '{}'", from_subnet, to_subnet);
            } else {
                println!("'{}' can NOT reach '{}'", from_subnet, to_subnet);
                std::process::exit(1);
            }
        }

        Commands::Cleanup => {
            let vpcs = VpcManager::new(&exec, &store);
            let report = vpcs.cleanup_all()?;
            print_report(&report);
            println!("Cleanup complete");
        }
    }

    Ok(())
}

/// Print each teardown step with its outcome
fn print_report(report: &TeardownReport) {
    for step in &report.steps {
        match &step.outcome {
            Outcome::Done => println!("  ok      {}", step.name),
            Outcome::Skipped => println!("  skipped {}", step.name),
            Outcome::Failed(msg) => println!("  FAILED  {} ({})", step.name, msg),
        }
    }
    if !report.is_clean() {
        eprintln!(
            "Warning: {} step(s) failed; some resources may need manual cleanup",
            report.failures().len()
        );
    }
}
