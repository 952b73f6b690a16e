//! Boot, join and shutdown of machines
//!
//! Each phase runs one task per machine and waits for all of them; a failing machine is
//! excluded from the rest of the run without disturbing its siblings.

use crate::console::Status;
use crate::context::{RunContext, RunEnv, RunOptions};
use crate::error::{FleetError, Result};
use crate::machine::{Machine, QemuDescriptor};
use crate::remote::CommandOutput;
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// QEMU tool probed to detect an installation
const QEMU_PROBE_TOOL: &str = "qemu-img";

/// Name of the file holding the version of the local machine files
const VERSION_FILE: &str = "VERSION";

/// How to spawn a hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Resolved binary
    pub binary: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory, the machine directory
    pub cwd: PathBuf,
    /// Put the process in its own group so it outlives this tool
    pub detach: bool,
    /// How long the process must stay up to count as launched
    pub settle: Duration,
}

/// Abstraction for hypervisor processes and QEMU tools, enabling test doubles.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Make sure QEMU is installed, fatal otherwise
    fn check(&self) -> Result<()>;

    /// Full path of a QEMU binary
    fn binary_path(&self, name: &str) -> PathBuf;

    /// Spawn a hypervisor and wait for it to settle
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Run a QEMU tool to completion
    async fn run_tool(&self, binary: &Path, args: &[String], cwd: &Path) -> Result<CommandOutput>;
}

/// Launches real processes
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    prefix: OnceCell<PathBuf>,
}

impl ProcessLauncher {
    /// Launcher with QEMU not yet located
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn tool_responds(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn detect_prefix() -> Result<PathBuf> {
    if tool_responds(QEMU_PROBE_TOOL) {
        return Ok(PathBuf::new());
    }

    #[cfg(windows)]
    if let Some(prefix) = registry_install_dir() {
        return Ok(prefix);
    }

    Err(FleetError::MissingTool(
        "QEMU does not seem to be installed".to_string(),
    ))
}

#[cfg(windows)]
fn registry_install_dir() -> Option<PathBuf> {
    let output = std::process::Command::new("reg")
        .args(["query", r"HKEY_LOCAL_MACHINE\SOFTWARE\QEMU", "/v", "Install_Dir"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let prefix = parse_install_dir(&String::from_utf8_lossy(&output.stdout))?;
    let probe = prefix.join(format!("{QEMU_PROBE_TOOL}{}", std::env::consts::EXE_SUFFIX));
    probe.exists().then_some(prefix)
}

/// Extract `Install_Dir` from `reg query` output
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_install_dir(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix("Install_Dir")?;
        let rest = rest.trim_start();
        let kind_end = rest.find(char::is_whitespace)?;
        if !rest[..kind_end].starts_with("REG_") {
            return None;
        }
        let value = rest[kind_end..].trim();
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}

#[cfg(unix)]
fn detach(command: &mut tokio::process::Command) {
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut tokio::process::Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn check(&self) -> Result<()> {
        let prefix = self.prefix.get_or_try_init(detect_prefix)?;
        debug!(prefix = ?prefix, "QEMU located");
        Ok(())
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
        match self.prefix.get() {
            Some(prefix) => prefix.join(file),
            None => PathBuf::from(file),
        }
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let binary = spec.binary.display().to_string();

        let mut command = tokio::process::Command::new(&spec.binary);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if spec.detach {
            detach(&mut command);
        }

        let mut child = command
            .spawn()
            .map_err(|e| FleetError::launch(&binary, e.to_string()))?;
        debug!(binary, pid = ?child.id(), detach = spec.detach, "Hypervisor spawned");

        tokio::select! {
            status = child.wait() => {
                let message = match status {
                    Ok(status) => format!("exited early ({status})"),
                    Err(e) => e.to_string(),
                };
                Err(FleetError::launch(binary, message))
            }
            _ = tokio::time::sleep(spec.settle) => Ok(()),
        }
    }

    async fn run_tool(&self, binary: &Path, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(binary)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FleetError::launch(binary.display().to_string(), e.to_string()))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Arguments handed to the hypervisor
#[must_use]
pub fn boot_arguments(qemu: &QemuDescriptor, options: &RunOptions) -> Vec<String> {
    let mut args = qemu.arguments.clone();
    if let Some(layout) = &options.keyboard_layout {
        args.push("-k".to_string());
        args.push(layout.clone());
    }
    if let Some(accel) = qemu.accelerate {
        args.push("-accel".to_string());
        args.push(accel.to_string());
    }
    args
}

/// Version of the local machine files, 0 when unknown
#[must_use]
pub fn local_version(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join(VERSION_FILE))
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

/// Connect to a machine, retrying.
///
/// # Arguments
///
/// * `tries` - Connection attempts, spaced by the configured retry delay
pub async fn join(env: &RunEnv, machine: &mut Machine, tries: u32) -> Result<()> {
    let target = machine.descriptor()?.ssh_target();
    let delay = env.config.timings.connect_retry_delay();

    for attempt in 1..=tries {
        match env.backend.connector.connect(&target).await {
            Ok(session) => {
                machine.session = Some(session);
                return Ok(());
            }
            Err(err) => {
                debug!(machine = %machine.key, attempt, tries, error = %err, "Connection attempt failed");
                if attempt < tries {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(FleetError::ConnectFailed {
        machine: machine.name.clone(),
    })
}

/// Launch a machine and connect to it.
///
/// When the launch fails or the machine never answers, a short probe checks whether it
/// was already running. A running machine is joined with `started` left false, so this
/// run will not shut it down.
pub async fn boot(env: &RunEnv, machine: &mut Machine, dir: &Path, detach: bool) -> Result<()> {
    let qemu = machine.descriptor()?;
    let spec = LaunchSpec {
        binary: env.backend.launcher.binary_path(&qemu.binary),
        args: boot_arguments(qemu, &env.options),
        cwd: dir.to_path_buf(),
        detach,
        settle: env.config.timings.settle(),
    };
    let timings = &env.config.timings;

    let first = match env.backend.launcher.launch(&spec).await {
        Ok(()) => match join(env, machine, timings.boot_tries).await {
            Ok(()) => {
                machine.started = true;
                return Ok(());
            }
            Err(err) => err,
        },
        Err(err) => err,
    };

    debug!(machine = %machine.key, error = %first, "Boot failed, probing for a running machine");
    machine.started = false;
    join(env, machine, timings.probe_tries)
        .await
        .map_err(|_| first)
}

enum StartOutcome {
    Ready,
    Missing,
    Stale,
    Failed,
}

async fn start_machine(env: &RunEnv, machine: &mut Machine, detach: bool) -> StartOutcome {
    let log = &env.log;

    let Some(required) = machine.qemu.as_ref().map(|q| q.version) else {
        if machine.is_connected() {
            log.line(&machine.name, "Manual", Status::Ok);
            return StartOutcome::Ready;
        }
        log.line(&machine.name, "Manual", Status::Ignore);
        return StartOutcome::Missing;
    };

    let dir = env.config.paths.machine_dir(&machine.key);
    if !dir.is_dir() {
        log.line(&machine.name, "Missing files", Status::Ignore);
        return StartOutcome::Missing;
    }

    let version = local_version(&dir);
    if version < required {
        debug!(machine = %machine.key, version, required, "Stale machine files");
        log.line(&machine.name, "Machine version mismatch", Status::Ignore);
        return StartOutcome::Stale;
    }

    match boot(env, machine, &dir, detach).await {
        Ok(()) if machine.started => {
            let accel = machine
                .qemu
                .as_ref()
                .and_then(|q| q.accelerate)
                .map_or("emulated", |a| a.as_str());
            log.line(&machine.name, &format!("Start ({accel})"), Status::Ok);
            StartOutcome::Ready
        }
        Ok(()) => {
            log.line(&machine.name, "Join", Status::Ok);
            StartOutcome::Ready
        }
        Err(err) => {
            warn!(machine = %machine.key, error = %err, "Machine did not start");
            log.line(&machine.name, "Start", Status::Error);
            StartOutcome::Failed
        }
    }
}

/// Boot every active machine.
///
/// Machines without local files are excluded and counted missing; stale machine files
/// also fail the phase.
///
/// # Returns
///
/// `Ok(true)` when no machine failed, `Err(NoMachineAvailable)` when every considered
/// machine was missing
pub async fn start(ctx: &mut RunContext, detach: bool) -> Result<bool> {
    ctx.env.backend.launcher.check()?;

    let RunContext { fleet, env } = ctx;
    let env: &RunEnv = env;
    env.log.phase("Starting up machines...");

    let considered = fleet.active().count();
    let outcomes = join_all(fleet.active_mut().map(|machine| async move {
        let outcome = start_machine(env, machine, detach).await;
        (machine.key.clone(), outcome)
    }))
    .await;

    let mut success = true;
    let mut missing = 0;
    for (key, outcome) in outcomes {
        match outcome {
            StartOutcome::Ready => {}
            StartOutcome::Missing => {
                fleet.ignore(key);
                missing += 1;
            }
            StartOutcome::Stale => {
                fleet.ignore(key);
                missing += 1;
                success = false;
            }
            StartOutcome::Failed => {
                fleet.ignore(key);
                success = false;
            }
        }
    }

    if considered > 0 && missing == considered {
        return Err(FleetError::NoMachineAvailable);
    }

    info!(considered, missing, success, "Start phase finished");
    Ok(success)
}

async fn stop_machine(env: &RunEnv, machine: &mut Machine) -> bool {
    let log = &env.log;

    if !machine.is_connected()
        && join(env, machine, env.config.timings.probe_tries)
            .await
            .is_err()
    {
        log.line(&machine.name, "Already down", Status::Ok);
        return true;
    }

    let result = async {
        let session = machine.session()?;
        let command = machine.descriptor()?.shutdown.clone();
        session
            .shutdown(&command, env.config.timings.shutdown_timeout())
            .await
    }
    .await;

    match result {
        Ok(()) => {
            machine.session = None;
            log.line(&machine.name, "Stop", Status::Ok);
            true
        }
        Err(err) => {
            warn!(machine = %machine.key, error = %err, "Shutdown failed");
            log.line(&machine.name, "Stop", Status::Error);
            false
        }
    }
}

/// Shut machines down.
///
/// Only machines booted by this run are stopped unless `all` is set. Manual machines are
/// never touched. A machine that cannot be reached counts as already down.
///
/// # Returns
///
/// `true` when every shutdown went through
pub async fn stop(ctx: &mut RunContext, all: bool) -> bool {
    let RunContext { fleet, env } = ctx;
    let env: &RunEnv = env;
    env.log.phase("Sending shutdown commands...");

    let outcomes = join_all(
        fleet
            .machines
            .iter_mut()
            .filter(|m| m.is_managed() && (all || m.started))
            .map(|machine| async move {
                let ok = stop_machine(env, machine).await;
                (machine.key.clone(), ok)
            }),
    )
    .await;

    fleet.absorb(outcomes)
}
