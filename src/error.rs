//! Unified error types for vpcctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // State store errors
    #[error("Failed to read state file '{path}': {source}")]
    StateRead { path: PathBuf, source: io::Error },

    #[error("Failed to lock state file '{path}': {source}")]
    StateLock { path: PathBuf, source: io::Error },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("VPC '{0}' not found")]
    VpcNotFound(String),

    #[error("VPC '{0}' already exists")]
    VpcAlreadyExists(String),

    #[error("Subnet '{subnet}' not found in VPC '{vpc}'")]
    SubnetNotFound { vpc: String, subnet: String },

    #[error("Subnet '{subnet}' already exists in VPC '{vpc}'")]
    SubnetAlreadyExists { vpc: String, subnet: String },

    #[error("Subnet CIDR {subnet} is not within VPC CIDR {vpc}")]
    CidrNotContained { subnet: String, vpc: String },

    #[error("VPC CIDRs overlap: {0} and {1}")]
    CidrOverlap(String, String),

    // Peering errors
    #[error("Peering already exists between '{0}' and '{1}'")]
    PeeringAlreadyExists(String, String),

    #[error("No peering exists between '{0}' and '{1}'")]
    PeeringNotFound(String, String),

    // Firewall policy errors
    #[error("Failed to read policy file '{path}': {source}")]
    PolicyRead { path: PathBuf, source: io::Error },

    #[error("Policy validation failed: {0}")]
    PolicyValidation(String),

    // Command execution errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
