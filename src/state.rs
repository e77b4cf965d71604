//! Declarative topology state
//!
//! The single source of truth for VPCs, subnets, and peerings, persisted as
//! one JSON document. Every mutating operation reads the full state, applies
//! one change, and writes the full state back; the cycle runs under an
//! advisory file lock so two concurrent invocations cannot lose each other's
//! updates. Saves go through a temp file plus rename so a crash never leaves
//! a half-written document.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Default state file location
pub const DEFAULT_STATE_FILE: &str = "/var/lib/vpcctl/state.json";

/// Whether a subnet gets NAT egress to the internet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    Public,
    Private,
}

impl std::fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetKind::Public => write!(f, "public"),
            SubnetKind::Private => write!(f, "private"),
        }
    }
}

/// A subnet record: one namespace wired to the VPC bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: Ipv4Net,
    #[serde(rename = "type")]
    pub kind: SubnetKind,
    pub namespace: String,
    pub veth_host: String,
    pub veth_ns: String,
    pub ip: Ipv4Addr,
}

/// A VPC record: one bridge plus a CIDR block and its subnets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpc {
    pub cidr: Ipv4Net,
    pub bridge: String,
    /// Uplink interface used for NAT egress
    pub interface: String,
    #[serde(default)]
    pub subnets: BTreeMap<String, Subnet>,
}

/// A peering record: an unordered VPC pair and its bridge-to-bridge veths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peering {
    pub vpc1: String,
    pub vpc2: String,
    pub veth1: String,
    pub veth2: String,
}

impl Peering {
    /// Whether this peering connects the given pair, in either order
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.vpc1 == a && self.vpc2 == b) || (self.vpc1 == b && self.vpc2 == a)
    }

    /// Whether this peering references the given VPC
    pub fn involves(&self, vpc: &str) -> bool {
        self.vpc1 == vpc || self.vpc2 == vpc
    }
}

/// The aggregate topology model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyState {
    #[serde(default)]
    pub vpcs: BTreeMap<String, Vpc>,
    #[serde(default)]
    pub peerings: Vec<Peering>,
}

impl TopologyState {
    pub fn vpc(&self, name: &str) -> Result<&Vpc> {
        self.vpcs
            .get(name)
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    pub fn vpc_mut(&mut self, name: &str) -> Result<&mut Vpc> {
        self.vpcs
            .get_mut(name)
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    pub fn subnet(&self, vpc: &str, subnet: &str) -> Result<&Subnet> {
        self.vpc(vpc)?
            .subnets
            .get(subnet)
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            })
    }

    /// Find a peering between two VPCs regardless of name order
    pub fn find_peering(&self, a: &str, b: &str) -> Option<usize> {
        self.peerings.iter().position(|p| p.connects(a, b))
    }
}

/// On-disk state store
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current state; a missing file is an empty topology
    pub fn load(&self) -> Result<TopologyState> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TopologyState::default()),
            Err(e) => Err(Error::StateRead {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Persist the state atomically (temp file + rename)
    pub fn save(&self, state: &TopologyState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut content = serde_json::to_string_pretty(state)?;
        content.push('\n');
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Take the exclusive advisory lock guarding read-modify-write cycles.
    /// Blocks until the lock is available; released when the guard drops.
    pub fn lock(&self) -> Result<StateLock> {
        let lock_path = self.path.with_extension("lock");
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::StateLock {
                path: lock_path.clone(),
                source: e,
            })?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::StateLock {
                path: lock_path,
                source: io::Error::last_os_error(),
            });
        }

        Ok(StateLock { file })
    }
}

/// Held exclusive lock on the state file
pub struct StateLock {
    file: fs::File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use tempfile::TempDir;

    /// State store backed by a temp directory, cleaned up with the TempDir
    pub fn temp_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().expect("create temp dir");
        let store = StateStore::new(dir.path().join("state.json"));
        (dir, store)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::temp_store;
    use super::*;

    fn sample_state() -> TopologyState {
        let mut state = TopologyState::default();
        state.vpcs.insert(
            "demo".to_string(),
            Vpc {
                cidr: "10.0.0.0/16".parse().unwrap(),
                bridge: "br-demo".to_string(),
                interface: "eth0".to_string(),
                subnets: BTreeMap::new(),
            },
        );
        state.peerings.push(Peering {
            vpc1: "demo".to_string(),
            vpc2: "other".to_string(),
            veth1: "peer-abc123a".to_string(),
            veth2: "peer-abc123b".to_string(),
        });
        state
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let (_dir, store) = temp_store();
        let state = store.load().unwrap();
        assert!(state.vpcs.is_empty());
        assert!(state.peerings.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = temp_store();
        store.save(&sample_state()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.vpcs.len(), 1);
        assert_eq!(loaded.vpc("demo").unwrap().bridge, "br-demo");
        assert_eq!(loaded.peerings.len(), 1);
    }

    #[test]
    fn test_wire_layout() {
        let (_dir, store) = temp_store();
        let mut state = sample_state();
        state.vpc_mut("demo").unwrap().subnets.insert(
            "web".to_string(),
            Subnet {
                cidr: "10.0.1.0/24".parse().unwrap(),
                kind: SubnetKind::Public,
                namespace: "ns-demo-web".to_string(),
                veth_host: "veth-3a91bc".to_string(),
                veth_ns: "eth0".to_string(),
                ip: "10.0.1.2".parse().unwrap(),
            },
        );
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["vpcs"]["demo"]["cidr"], "10.0.0.0/16");
        let subnet = &raw["vpcs"]["demo"]["subnets"]["web"];
        assert_eq!(subnet["type"], "public");
        assert_eq!(subnet["ip"], "10.0.1.2");
        assert_eq!(subnet["veth_ns"], "eth0");
        assert_eq!(raw["peerings"][0]["vpc1"], "demo");
    }

    #[test]
    fn test_peering_lookup_is_symmetric() {
        let state = sample_state();
        assert!(state.find_peering("demo", "other").is_some());
        assert!(state.find_peering("other", "demo").is_some());
        assert!(state.find_peering("demo", "third").is_none());
    }

    #[test]
    fn test_missing_entities() {
        let state = sample_state();
        assert!(matches!(state.vpc("nope"), Err(Error::VpcNotFound(_))));
        assert!(matches!(
            state.subnet("demo", "nope"),
            Err(Error::SubnetNotFound { .. })
        ));
    }

    #[test]
    fn test_lock_guard() {
        let (_dir, store) = temp_store();
        let guard = store.lock().unwrap();
        drop(guard);
        // Re-acquirable after release
        let _again = store.lock().unwrap();
    }
}
