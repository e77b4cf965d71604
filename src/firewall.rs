//! Firewall policy management
//!
//! Translates a declarative JSON rule-set into ordered iptables operations
//! inside a subnet's namespace. Defaults are asymmetric: ingress defaults to
//! deny-all, egress defaults to permit-all when no `egress` key is given.
//! Note the distinction between an absent `egress` key (explicit permit-all
//! default) and an empty `egress` array (zero rules appended, OUTPUT policy
//! left untouched) — both are reproduced faithfully.

use crate::error::{Error, Result};
use crate::exec::{Executor, run_in_ns};
use crate::state::StateStore;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// A declarative firewall policy, loaded from a JSON file
#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    /// Descriptive target subnet name; required but not cross-checked
    /// against the topology
    pub subnet: String,
    pub ingress: Option<Vec<Rule>>,
    pub egress: Option<Vec<Rule>>,
}

/// One ingress or egress rule
// TODO: support port ranges (iptables 8000:9000 syntax)
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// Port number or "*" for any
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// "allow" or "deny"; anything else is treated as deny with a warning
    #[serde(default = "default_action")]
    pub action: String,
    /// Source CIDR for ingress rules (default 0.0.0.0/0)
    pub source: Option<String>,
    /// Destination CIDR for egress rules (default 0.0.0.0/0)
    pub destination: Option<String>,
}

fn default_port() -> String {
    "*".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_action() -> String {
    "allow".to_string()
}

/// Traffic direction a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Translate one rule into the iptables arguments appended to the
/// namespace's chain. This is the full rule-translation contract: direction
/// picks the chain and the address match, the action picks the target.
pub fn translate_rule(direction: Direction, rule: &Rule) -> Vec<String> {
    let target = match rule.action.to_ascii_lowercase().as_str() {
        "allow" => "ACCEPT",
        "deny" => "DROP",
        other => {
            warn!(action = other, "unknown action, defaulting to DROP");
            "DROP"
        }
    };

    let (chain, addr_flag, addr) = match direction {
        Direction::Ingress => ("INPUT", "-s", rule.source.as_deref().unwrap_or("0.0.0.0/0")),
        Direction::Egress => (
            "OUTPUT",
            "-d",
            rule.destination.as_deref().unwrap_or("0.0.0.0/0"),
        ),
    };

    let mut args: Vec<String> = ["-A", chain, "-p", rule.protocol.as_str(), addr_flag, addr]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if rule.port != "*" {
        args.push("--dport".to_string());
        args.push(rule.port.clone());
    }
    args.push("-j".to_string());
    args.push(target.to_string());
    args
}

/// Load and validate a policy file
pub fn load_policy(path: &Path) -> Result<Policy> {
    let content = fs::read_to_string(path).map_err(|e| Error::PolicyRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let policy: Policy = serde_json::from_str(&content)?;
    if policy.subnet.is_empty() {
        return Err(Error::PolicyValidation(
            "policy must name a subnet".to_string(),
        ));
    }
    Ok(policy)
}

/// Applies and clears firewall policies on subnet namespaces
pub struct PolicyManager<'a> {
    exec: &'a dyn Executor,
    store: &'a StateStore,
}

impl<'a> PolicyManager<'a> {
    pub fn new(exec: &'a dyn Executor, store: &'a StateStore) -> Self {
        Self { exec, store }
    }

    /// Apply a policy to a subnet's namespace, replacing whatever was there
    pub fn apply(&self, vpc: &str, subnet: &str, policy: &Policy) -> Result<()> {
        info!(vpc, subnet, "applying firewall policy");

        let _lock = self.store.lock()?;
        let state = self.store.load()?;
        let ns = state.subnet(vpc, subnet)?.namespace.clone();

        // Start from a clean slate with deny-by-default ingress
        for chain in ["INPUT", "OUTPUT", "FORWARD"] {
            run_in_ns(self.exec, &ns, &["iptables", "-F", chain], true)?;
        }
        run_in_ns(self.exec, &ns, &["iptables", "-P", "INPUT", "DROP"], true)?;
        run_in_ns(self.exec, &ns, &["iptables", "-P", "FORWARD", "DROP"], true)?;

        // Established/related connections and loopback stay open both ways
        for chain in ["INPUT", "OUTPUT"] {
            run_in_ns(
                self.exec,
                &ns,
                &[
                    "iptables", "-A", chain, "-m", "state", "--state", "ESTABLISHED,RELATED",
                    "-j", "ACCEPT",
                ],
                true,
            )?;
        }
        run_in_ns(
            self.exec,
            &ns,
            &["iptables", "-A", "INPUT", "-i", "lo", "-j", "ACCEPT"],
            true,
        )?;
        run_in_ns(
            self.exec,
            &ns,
            &["iptables", "-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"],
            true,
        )?;

        if let Some(rules) = &policy.ingress {
            info!(count = rules.len(), "applying ingress rules");
            for rule in rules {
                self.append_rule(&ns, Direction::Ingress, rule)?;
            }
        }

        match &policy.egress {
            Some(rules) => {
                info!(count = rules.len(), "applying egress rules");
                for rule in rules {
                    self.append_rule(&ns, Direction::Egress, rule)?;
                }
            }
            None => {
                // No egress section at all: default to permit-all output
                run_in_ns(self.exec, &ns, &["iptables", "-P", "OUTPUT", "ACCEPT"], true)?;
            }
        }

        info!(vpc, subnet, "firewall policy applied");
        Ok(())
    }

    fn append_rule(&self, ns: &str, direction: Direction, rule: &Rule) -> Result<()> {
        info!(
            port = %rule.port,
            protocol = %rule.protocol,
            action = %rule.action,
            "adding rule"
        );
        let args = translate_rule(direction, rule);
        let mut argv: Vec<&str> = vec!["iptables"];
        argv.extend(args.iter().map(String::as_str));
        run_in_ns(self.exec, ns, &argv, true)?;
        Ok(())
    }

    /// Flush all rules, delete custom chains, reset every default to accept
    pub fn clear(&self, vpc: &str, subnet: &str) -> Result<()> {
        info!(vpc, subnet, "clearing firewall policy");

        let _lock = self.store.lock()?;
        let state = self.store.load()?;
        let ns = state.subnet(vpc, subnet)?.namespace.clone();

        run_in_ns(self.exec, &ns, &["iptables", "-F"], true)?;
        run_in_ns(self.exec, &ns, &["iptables", "-X"], true)?;
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            run_in_ns(self.exec, &ns, &["iptables", "-P", chain, "ACCEPT"], true)?;
        }

        info!(vpc, subnet, "firewall policy cleared");
        Ok(())
    }

    /// Dump the live rules in a subnet's namespace
    pub fn show(&self, vpc: &str, subnet: &str) -> Result<String> {
        let state = self.store.load()?;
        let ns = state.subnet(vpc, subnet)?.namespace.clone();

        let out = run_in_ns(self.exec, &ns, &["iptables", "-L", "-n", "-v"], false)?;
        Ok(out.stdout)
    }
}
