//! External tools the driver shells out to
//!
//! - ssh (required by every command)
//! - sshpass (interactive sessions)
//! - npm (packing and publishing)
//! - git (ignored files of the source tree)

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::process::Command;

/// External tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// OpenSSH client
    Ssh,
    /// Password feeder for the SSH client
    Sshpass,
    /// Node package manager
    Npm,
    /// Git, to list ignored files
    Git,
}

impl Tool {
    /// Get the command name for this tool on the current host
    #[must_use]
    pub const fn command_name(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Sshpass => "sshpass",
            Self::Npm if cfg!(windows) => "npm.cmd",
            Self::Npm => "npm",
            Self::Git => "git",
        }
    }

    /// Locate this tool in `PATH`
    #[must_use]
    pub fn locate(&self) -> Option<PathBuf> {
        which::which(self.command_name()).ok()
    }

    /// Build a command for this tool
    #[must_use]
    pub fn command(&self) -> Command {
        Command::new(self.command_name())
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Fail unless an SSH client is installed
pub fn check_ssh() -> Result<()> {
    require(Tool::Ssh)
}

/// Fail unless `tool` is in `PATH`
pub fn require(tool: Tool) -> Result<()> {
    if tool.locate().is_none() {
        bail!("Missing {tool} binary in PATH");
    }
    Ok(())
}
