//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::state::{DEFAULT_STATE_FILE, SubnetKind};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vpcctl - single-host VPC provisioning over network namespaces
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Topology state file path
    #[arg(short, long, default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// VPC management
    Vpc {
        #[command(subcommand)]
        action: VpcAction,
    },

    /// Subnet management
    Subnet {
        #[command(subcommand)]
        action: SubnetAction,
    },

    /// VPC peering management
    Peering {
        #[command(subcommand)]
        action: PeeringAction,
    },

    /// Firewall policy management
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },

    /// NAT and internet access management
    Nat {
        #[command(subcommand)]
        action: NatAction,
    },

    /// Ping between two subnets of a VPC
    Ping {
        /// VPC name
        vpc: String,

        /// Subnet to ping from
        from_subnet: String,

        /// Subnet to ping to
        to_subnet: String,
    },

    /// Tear down every VPC and sweep orphaned namespaces and bridges
    Cleanup,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Actions for the vpc command
#[derive(Subcommand)]
pub enum VpcAction {
    /// Create a VPC (bridge plus forwarding rules)
    Create {
        /// VPC name
        name: String,

        /// VPC CIDR block (e.g., 10.0.0.0/16)
        #[arg(short, long)]
        cidr: String,

        /// Uplink interface for internet-bound traffic
        #[arg(short, long, default_value = "eth0")]
        interface: String,
    },

    /// Delete a VPC and everything inside it
    Delete {
        /// VPC name
        name: String,
    },

    /// List all VPCs
    List,
}

/// Actions for the subnet command
#[derive(Subcommand)]
pub enum SubnetAction {
    /// Create a subnet (namespace wired to the VPC bridge)
    Create {
        /// Parent VPC name
        vpc: String,

        /// Subnet name
        name: String,

        /// Subnet CIDR block, contained in the VPC CIDR
        #[arg(short, long)]
        cidr: String,

        /// Subnet type; public subnets get NAT to the internet
        #[arg(short = 't', long = "type", value_enum, default_value_t = SubnetKind::Private)]
        kind: SubnetKind,
    },

    /// Delete a subnet
    Delete {
        /// Parent VPC name
        vpc: String,

        /// Subnet name
        name: String,
    },

    /// List subnets of a VPC
    List {
        /// VPC name
        vpc: String,
    },
}

/// Actions for the peering command
#[derive(Subcommand)]
pub enum PeeringAction {
    /// Connect two VPCs
    Create {
        /// First VPC name
        vpc1: String,

        /// Second VPC name
        vpc2: String,
    },

    /// Disconnect two VPCs
    Delete {
        /// First VPC name
        vpc1: String,

        /// Second VPC name
        vpc2: String,
    },

    /// List peering connections
    List,
}

/// Actions for the firewall command
#[derive(Subcommand)]
pub enum FirewallAction {
    /// Apply a policy file to a subnet
    Apply {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,

        /// Policy file (JSON)
        #[arg(short, long)]
        policy: PathBuf,
    },

    /// Clear all rules from a subnet, restoring accept-all
    Clear {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,
    },

    /// Show the live rules in a subnet
    Show {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,
    },
}

/// Actions for the nat command
#[derive(Subcommand)]
pub enum NatAction {
    /// Enable NAT for a subnet
    Enable {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,
    },

    /// Disable NAT for a subnet
    Disable {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,
    },

    /// Test internet reachability from a subnet
    Test {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}
