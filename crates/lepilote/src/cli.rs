// CLI Interface
//
// This module provides the command-line interface of the `qemu` fleet driver.

use crate::commands;
use crate::tools;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use leflotte::lifecycle::ProcessLauncher;
use leflotte::remote::Ssh2Connector;
use leflotte::selector::validate_pattern;
use leflotte::{
    select_machines, Backend, FleetConfig, FleetError, HostOs, Registry, RunContext, RunOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// qemu - Build, test and package on a fleet of virtual machines
#[derive(Parser, Debug)]
#[command(name = "qemu")]
#[command(author = "LeFlotte Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, test and package a source tree on a fleet of QEMU machines", long_about = None)]
#[command(subcommand_required = false)]
#[command(arg_required_else_help = false)]
pub struct Cli {
    /// Tool directory holding the registry, the machine files and qemu.toml
    #[arg(global = true, long = "dir", value_name = "TOOL_DIR")]
    pub tool_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(global = true, long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Subcommand to execute, `test` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Machine patterns shared by every command
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Machine keys or names, with `*`, `?` and `[...]` wildcards
    #[arg(value_name = "MACHINE", value_parser = parse_pattern)]
    pub patterns: Vec<String>,
}

/// Boot options of `test` and `start`
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct BootArgs {
    /// VNC keyboard layout handed to QEMU
    #[arg(short = 'k', long = "keyboard", value_name = "LAYOUT")]
    pub keyboard: Option<String>,

    /// Run without host acceleration
    #[arg(long = "no_accel")]
    pub no_accel: bool,
}

impl BootArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            keyboard_layout: self.keyboard.clone(),
            accelerate: !self.no_accel,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the machines and perform the tests (default)
    Test {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,

        /// Boot options
        #[command(flatten)]
        boot: BootArgs,
    },

    /// Same as test, with a debug build
    Debug {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Prepare the package and create the npm tarball
    Pack {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Prepare the package and publish it
    Publish {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Build redistributable binaries and assemble the package directory
    Prepare {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Start the machines and leave them running
    Start {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,

        /// Boot options
        #[command(flatten)]
        boot: BootArgs,
    },

    /// Stop the machines
    Stop {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Print connection details of the machines
    Info {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Open an interactive SSH session with one machine
    Ssh {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },

    /// Restore the base snapshot of the machine disks
    Reset {
        /// Machines to operate on
        #[command(flatten)]
        selection: Selection,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Test {
            selection: Selection::default(),
            boot: BootArgs::default(),
        }
    }
}

impl Commands {
    /// Machine patterns given to the command
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        match self {
            Commands::Test { selection, .. }
            | Commands::Debug { selection }
            | Commands::Pack { selection }
            | Commands::Publish { selection }
            | Commands::Prepare { selection }
            | Commands::Start { selection, .. }
            | Commands::Stop { selection }
            | Commands::Info { selection }
            | Commands::Ssh { selection }
            | Commands::Reset { selection } => &selection.patterns,
        }
    }

    /// Operator options of the run
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        match self {
            Commands::Test { boot, .. } | Commands::Start { boot, .. } => boot.options(),
            _ => RunOptions::default(),
        }
    }
}

fn parse_pattern(text: &str) -> std::result::Result<String, String> {
    validate_pattern(text).map_err(|e| e.to_string())?;
    Ok(text.to_string())
}

impl Cli {
    /// Run the CLI
    ///
    /// # Returns
    ///
    /// `Ok(true)` when the command succeeded, `Ok(false)` when it ran and failed, `Err`
    /// on fatal errors
    pub async fn run(self) -> Result<bool> {
        init_logging_impl(self.verbose);

        let tool_dir = get_tool_dir(self.tool_dir)?;
        let command = self.command.unwrap_or_default();
        debug!(tool_dir = %tool_dir.display(), command = ?command, "Starting");

        tools::check_ssh()?;

        let config = FleetConfig::load(&tool_dir)?;
        let options = command.run_options();
        let registry = Registry::load(&config.paths.registry, HostOs::current(), options.accelerate)
            .with_context(|| format!("Failed to load registry {:?}", config.paths.registry))?;
        let machines = select_machines(registry, command.patterns())?;
        info!(count = machines.len(), "Machines selected");

        let backend = Backend {
            connector: Arc::new(Ssh2Connector),
            launcher: Arc::new(ProcessLauncher::new()),
        };
        let mut ctx = RunContext::new(machines, config, options, backend);

        commands::dispatch(&mut ctx, &command).await
    }
}

/// Message printed when a run stops on an error
///
/// Fatal fleet errors already name the registry, pattern or tool at fault and are
/// reported alone. Anything else keeps its whole context chain.
#[must_use]
pub fn error_report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<FleetError>() {
        Some(fleet) if fleet.is_fatal() => format!("Error: {fleet}"),
        _ => format!("Error: {err:#}"),
    }
}

/// Initialize logging
fn init_logging_impl(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Get tool directory from explicit path or current directory
fn get_tool_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve tool directory {:?}", dir))
}
