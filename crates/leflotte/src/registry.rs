//! Machine registry loading
//!
//! The registry is a JSON object mapping machine keys to [`MachineSpec`] entries. Loading is
//! all or nothing: a malformed document aborts the run.

use crate::error::{FleetError, Result};
use crate::machine::{Accelerator, Machine, MachineSpec};
use indexmap::IndexMap;
use std::path::Path;
use tracing::debug;

/// Default registry location, relative to the tool directory
pub const DEFAULT_REGISTRY_PATH: &str = "registry/machines.json";

/// QEMU binaries that can use the host hypervisor
const ACCELERATED_BINARIES: &[&str] = &["qemu-system-x86_64", "qemu-system-i386"];

/// Host operating system, as far as acceleration is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Linux host (KVM)
    Linux,
    /// Windows host (WHPX)
    Windows,
    /// Anything else, no acceleration
    Other,
}

impl HostOs {
    /// Detect the running host
    #[must_use]
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }

    /// Native hypervisor interface of this host
    #[must_use]
    pub const fn accelerator(&self) -> Option<Accelerator> {
        match self {
            Self::Linux => Some(Accelerator::Kvm),
            Self::Windows => Some(Accelerator::Whpx),
            Self::Other => None,
        }
    }
}

/// Acceleration for a QEMU binary on a host, if any
#[must_use]
pub fn resolve_accelerator(binary: &str, host: HostOs, enabled: bool) -> Option<Accelerator> {
    if !enabled || !ACCELERATED_BINARIES.contains(&binary) {
        return None;
    }
    host.accelerator()
}

/// All machines known to this tool, in registry order
#[derive(Debug, Default)]
pub struct Registry {
    machines: IndexMap<String, Machine>,
}

impl Registry {
    /// Load the registry from a JSON file
    pub fn load(path: &Path, host: HostOs, accelerate: bool) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| FleetError::RegistryIo {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&json, host, accelerate).map_err(|source| FleetError::RegistryParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a registry document
    pub fn parse(json: &str, host: HostOs, accelerate: bool) -> serde_json::Result<Self> {
        let specs: IndexMap<String, MachineSpec> = serde_json::from_str(json)?;

        let machines = specs
            .into_iter()
            .map(|(key, spec)| {
                let mut machine = Machine::from_spec(key.clone(), spec);
                if let Some(qemu) = machine.qemu.as_mut() {
                    qemu.accelerate = resolve_accelerator(&qemu.binary, host, accelerate);
                }
                debug!(key = %machine.key, accelerate = ?machine.qemu.as_ref().and_then(|q| q.accelerate), "Registered machine");
                (key, machine)
            })
            .collect();

        Ok(Self { machines })
    }

    /// Number of machines
    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the registry holds no machine
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Look up a machine by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Machine> {
        self.machines.get(key)
    }

    /// Iterate machines in registry order
    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Take ownership of the machines, in registry order
    #[must_use]
    pub fn into_machines(self) -> IndexMap<String, Machine> {
        self.machines
    }
}
