//! Machine records
//!
//! A machine is one build/test target. Machines with a `qemu` descriptor are booted and
//! stopped by this tool; machines without one are managed externally.

use crate::error::{FleetError, Result};
use crate::remote::{RemoteSession, SshTarget};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Host loopback address every forwarded SSH port listens on
pub const LOOPBACK: &str = "127.0.0.1";

/// Hardware acceleration interface handed to QEMU with `-accel`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    /// Linux kernel virtual machine
    Kvm,
    /// Windows hypervisor platform
    Whpx,
}

impl Accelerator {
    /// Value passed to `-accel`
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Whpx => "whpx",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to launch and reach a QEMU guest
#[derive(Debug, Clone, Deserialize)]
pub struct QemuDescriptor {
    /// QEMU system binary, e.g. `qemu-system-x86_64`
    pub binary: String,

    /// Arguments passed to the binary, relative to the machine directory
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Disk image file name inside the machine directory
    pub disk: String,

    /// Minimum version of the local machine files
    #[serde(default)]
    pub version: u32,

    /// Forwarded SSH port on the host
    pub ssh_port: u16,

    /// Forwarded VNC port on the host
    #[serde(default)]
    pub vnc_port: Option<u16>,

    /// SSH username
    pub username: String,

    /// SSH password
    pub password: String,

    /// Command run over SSH to power the guest off
    pub shutdown: String,

    /// Resolved acceleration, computed at load time
    #[serde(skip)]
    pub accelerate: Option<Accelerator>,
}

impl QemuDescriptor {
    /// SSH endpoint of the guest
    #[must_use]
    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: LOOPBACK.to_string(),
            port: self.ssh_port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// A remote shell command, optionally repeated
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RemoteCommand {
    /// Run once
    Shell(String),

    /// Run up to `repeat` times, stopping at the first failure
    Repeated {
        /// Command line
        command: String,
        /// Maximum number of runs, zero is rejected
        #[serde(default = "default_repeat")]
        repeat: NonZeroU32,
    },
}

fn default_repeat() -> NonZeroU32 {
    NonZeroU32::MIN
}

impl RemoteCommand {
    /// Command line
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            Self::Shell(command) => command,
            Self::Repeated { command, .. } => command,
        }
    }

    /// Maximum number of runs
    #[must_use]
    pub fn repeat(&self) -> u32 {
        match self {
            Self::Shell(_) => 1,
            Self::Repeated { repeat, .. } => repeat.get(),
        }
    }

    /// Same command with extra arguments appended
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        match self {
            Self::Shell(command) => Self::Shell(format!("{command}{suffix}")),
            Self::Repeated { command, repeat } => Self::Repeated {
                command: format!("{command}{suffix}"),
                repeat: *repeat,
            },
        }
    }
}

impl From<&str> for RemoteCommand {
    fn from(command: &str) -> Self {
        Self::Shell(command.to_string())
    }
}

/// Build configuration producing a redistributable binary
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSpec {
    /// Remote working directory the snapshot is uploaded to
    pub directory: String,

    /// Build command, run from the component directory
    pub build: RemoteCommand,

    /// Architecture tag used in artifact paths
    pub arch: String,
}

/// Test configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TestSpec {
    /// Remote working directory the snapshot is uploaded to
    pub directory: String,

    /// Build command, run before any test command
    pub build: RemoteCommand,

    /// Debug variant of the build command
    #[serde(default)]
    pub debug: Option<RemoteCommand>,

    /// Named test commands, run in order after a successful build
    #[serde(default)]
    pub commands: IndexMap<String, RemoteCommand>,
}

impl TestSpec {
    /// Build command for a release or debug run
    #[must_use]
    pub fn build_command(&self, debug: bool) -> RemoteCommand {
        if !debug {
            return self.build.clone();
        }
        self.debug
            .clone()
            .unwrap_or_else(|| self.build.with_suffix(" --debug"))
    }
}

/// Registry entry as stored on disk
#[derive(Debug, Clone, Deserialize)]
pub struct MachineSpec {
    /// Display name
    #[serde(default, alias = "title")]
    pub name: Option<String>,

    /// Target platform (`win32`, `linux`, `darwin`, ...)
    #[serde(default)]
    pub platform: String,

    /// Boot descriptor, absent for manual machines
    #[serde(default)]
    pub qemu: Option<QemuDescriptor>,

    /// Build suites
    #[serde(default)]
    pub builds: IndexMap<String, BuildSpec>,

    /// Test suites
    #[serde(default)]
    pub tests: IndexMap<String, TestSpec>,
}

/// A machine of the current run
pub struct Machine {
    /// Registry key
    pub key: String,

    /// Display name
    pub name: String,

    /// Target platform
    pub platform: String,

    /// Boot descriptor, absent for manual machines
    pub qemu: Option<QemuDescriptor>,

    /// Build suites
    pub builds: IndexMap<String, BuildSpec>,

    /// Test suites
    pub tests: IndexMap<String, TestSpec>,

    /// Whether this run booted the machine
    pub started: bool,

    /// Open SSH session
    pub session: Option<Arc<dyn RemoteSession>>,
}

impl Machine {
    /// Build a machine from its registry entry
    #[must_use]
    pub fn from_spec(key: impl Into<String>, spec: MachineSpec) -> Self {
        let key = key.into();
        let name = spec.name.unwrap_or_else(|| key.clone());

        Self {
            key,
            name,
            platform: spec.platform,
            qemu: spec.qemu,
            builds: spec.builds,
            tests: spec.tests,
            started: false,
            session: None,
        }
    }

    /// Whether boot and shutdown are handled by this tool
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.qemu.is_some()
    }

    /// Whether the target runs Windows
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.platform == "win32"
    }

    /// Whether a session is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Boot descriptor or an error for manual machines
    pub fn descriptor(&self) -> Result<&QemuDescriptor> {
        self.qemu.as_ref().ok_or_else(|| FleetError::Unmanaged {
            machine: self.name.clone(),
        })
    }

    /// Open session or an error
    pub fn session(&self) -> Result<Arc<dyn RemoteSession>> {
        self.session.clone().ok_or_else(|| FleetError::NotConnected {
            machine: self.name.clone(),
        })
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("qemu", &self.qemu)
            .field("builds", &self.builds.keys().collect::<Vec<_>>())
            .field("tests", &self.tests.keys().collect::<Vec<_>>())
            .field("started", &self.started)
            .field("connected", &self.session.is_some())
            .finish()
    }
}
