//! Preflight checks for host tools.
//!
//! Every stage shells out. Checking the tools up front turns a half-finished
//! run with a cryptic spawn error into one message listing what to install.
//!
//! # Example
//!
//! ```rust
//! use board_pipeline::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("make") {
//!     println!("make not installed");
//! }
//!
//! let tools = &[("make", "make"), ("tar", "tar")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::deploy::DeploymentChannel;
use crate::process::is_root;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Needed by every board run. Each tuple is (command_name, package_name).
pub const BUILD_TOOLS: &[(&str, &str)] = &[("make", "make"), ("sh", "dash")];

/// Needed once the run goes past compiling.
pub const IMAGE_TOOLS: &[(&str, &str)] = &[("tar", "tar")];

pub const LOCAL_DEPLOY_TOOLS: &[(&str, &str)] = &[("dd", "coreutils")];

pub const REMOTE_DEPLOY_TOOLS: &[(&str, &str)] = &[("ssh", "openssh-client"), ("ip", "iproute2")];

pub const EMULATOR_TOOLS: &[(&str, &str)] = &[("make", "make"), ("tar", "tar"), ("ip", "iproute2")];

const SUDO: (&str, &str) = ("sudo", "sudo");

/// Tools a board run with this channel will invoke.
pub fn board_tools(channel: Option<&DeploymentChannel>) -> Vec<(&'static str, &'static str)> {
    let mut tools = BUILD_TOOLS.to_vec();
    match channel {
        None => {}
        Some(DeploymentChannel::LocalBlockDevice { .. }) => {
            tools.extend_from_slice(IMAGE_TOOLS);
            tools.extend_from_slice(LOCAL_DEPLOY_TOOLS);
            if !is_root() {
                tools.push(SUDO);
            }
        }
        Some(DeploymentChannel::RemoteSecureShell { interface, .. }) => {
            tools.extend_from_slice(IMAGE_TOOLS);
            tools.extend_from_slice(REMOTE_DEPLOY_TOOLS);
            if interface.is_some() && !is_root() {
                tools.push(SUDO);
            }
        }
    }
    tools
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with the package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
