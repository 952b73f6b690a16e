//! leflotte - Fleet Core
//!
//! *La Flotte* (The Fleet) - Machine registry, lifecycle control and remote execution
//! for QEMU test fleets

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Error types shared by every phase
pub mod error;

/// Machine records loaded from the registry
pub mod machine;

/// Registry loading and host acceleration detection
pub mod registry;

/// Pattern-based machine selection
pub mod selector;

/// Fleet configuration from TOML and environment
pub mod config;

/// Aligned per-machine status output
pub mod console;

/// Run context threaded through every phase
pub mod context;

/// Boot, join and shutdown of machines
pub mod lifecycle;

/// Remote sessions, command execution and transfers
pub mod remote;

/// Scripted doubles for sessions, connectors and launchers
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::FleetConfig;
pub use context::{Backend, Fleet, RunContext, RunEnv, RunOptions};
pub use error::{FleetError, Result};
pub use machine::{Accelerator, BuildSpec, Machine, QemuDescriptor, RemoteCommand, TestSpec};
pub use registry::{HostOs, Registry};
pub use selector::select_machines;
