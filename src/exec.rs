//! Privileged command execution
//!
//! Every kernel mutation goes through the `Executor` trait: one networking
//! command per call, built as an argument vector (never an interpolated
//! shell string), with captured output. This is the single seam between the
//! declarative model and the host, which makes it the natural place to
//! substitute a recording fake in tests.

use crate::error::{Error, Result};
use std::process::Command;
use tracing::debug;

/// Outcome of a single executed command
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Exit status code (-1 if terminated by signal)
    pub status: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes a single privileged networking command
pub trait Executor {
    /// Run `argv`, capturing output.
    ///
    /// With `check` set, a non-zero exit becomes `Error::CommandFailed`;
    /// without it, the caller inspects the status itself (used for
    /// existence probes and best-effort cleanup).
    fn run(&self, argv: &[&str], check: bool) -> Result<CmdOutput>;
}

/// Executor backed by `std::process::Command`
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, argv: &[&str], check: bool) -> Result<CmdOutput> {
        let (prog, args) = argv.split_first().ok_or_else(|| Error::CommandFailed {
            command: String::new(),
            message: "empty command".to_string(),
        })?;

        debug!(cmd = %argv.join(" "), "exec");

        let output = Command::new(prog)
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: argv.join(" "),
                message: e.to_string(),
            })?;

        let out = CmdOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if check && !out.success() {
            return Err(Error::CommandFailed {
                command: argv.join(" "),
                message: out.stderr.trim().to_string(),
            });
        }

        Ok(out)
    }
}

/// Run a command inside a network namespace via `ip netns exec`
pub fn run_in_ns(
    exec: &dyn Executor,
    ns: &str,
    argv: &[&str],
    check: bool,
) -> Result<CmdOutput> {
    let mut full: Vec<&str> = vec!["ip", "netns", "exec", ns];
    full.extend_from_slice(argv);
    exec.run(&full, check)
}

/// Bounded reachability probe from inside a namespace: 3 attempts,
/// 2-second timeout. The only operation in the system with a timeout.
pub fn ping_from(exec: &dyn Executor, ns: &str, addr: &str) -> Result<bool> {
    let out = run_in_ns(exec, ns, &["ping", "-c", "3", "-W", "2", addr], false)?;
    Ok(out.success())
}

/// Check whether a link (bridge, veth, ...) exists on the host
pub fn link_exists(exec: &dyn Executor, name: &str) -> Result<bool> {
    Ok(exec.run(&["ip", "link", "show", name], false)?.success())
}

/// Check whether a network namespace exists
pub fn namespace_exists(exec: &dyn Executor, name: &str) -> Result<bool> {
    let out = exec.run(&["ip", "netns", "list"], false)?;
    Ok(out
        .stdout
        .lines()
        .any(|line| line.split_whitespace().next() == Some(name)))
}
