//! lepilote - Fleet Pilot
//!
//! *Le Pilote* (The Pilot) - Command-line driver that builds, tests and packages a source
//! tree on a fleet of QEMU guests and manually managed machines

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// CLI parsing and logging setup
pub mod cli;

/// Command verbs
pub mod commands;

/// Source snapshot and filtered tree copies
pub mod snapshot;

/// Distributable package assembly
pub mod package;

/// External tool lookup
pub mod tools;

pub use cli::{error_report, BootArgs, Cli, Commands};
pub use commands::dispatch;
