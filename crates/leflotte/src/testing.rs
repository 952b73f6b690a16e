//! Scripted doubles for sessions, connectors and launchers
//!
//! Nothing here touches the network or spawns processes. Sessions answer commands from
//! a small rule table and record what they were asked to do.

use crate::error::{FleetError, Result};
use crate::lifecycle::{LaunchSpec, Launcher};
use crate::remote::{CommandOutput, Connector, EntryFilter, RemoteSession, SshTarget};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct ExitRule {
    pattern: String,
    codes: VecDeque<i32>,
    fallback: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct SessionRecord {
    execs: Vec<(String, Option<String>)>,
    uploads: Vec<String>,
    fetches: Vec<String>,
    shutdowns: Vec<String>,
}

/// Session answering from a rule table
#[derive(Debug, Default)]
pub struct ScriptedSession {
    rules: Mutex<Vec<ExitRule>>,
    record: Mutex<SessionRecord>,
    remote_files: Vec<String>,
    fail_uploads: bool,
    fail_fetches: bool,
    hang_shutdown: bool,
}

impl ScriptedSession {
    /// Session where every command succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, pattern: &str, codes: &[i32], fallback: i32, stderr: &str) -> Self {
        lock(&self.rules).push(ExitRule {
            pattern: pattern.to_string(),
            codes: codes.iter().copied().collect(),
            fallback,
            stderr: stderr.to_string(),
        });
        self
    }

    /// Commands containing `pattern` always exit with `code`
    #[must_use]
    pub fn with_exit(self, pattern: &str, code: i32) -> Self {
        self.rule(pattern, &[], code, "")
    }

    /// Commands containing `pattern` exit with `codes` in turn, then succeed
    #[must_use]
    pub fn with_exits(self, pattern: &str, codes: &[i32]) -> Self {
        self.rule(pattern, codes, 0, "")
    }

    /// Commands containing `pattern` always fail with `code` and print `stderr`
    #[must_use]
    pub fn with_failure(self, pattern: &str, code: i32, stderr: &str) -> Self {
        self.rule(pattern, &[], code, stderr)
    }

    /// Files listed in any remote directory that gets downloaded
    #[must_use]
    pub fn with_remote_files(mut self, names: &[&str]) -> Self {
        self.remote_files = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Every upload fails
    #[must_use]
    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Every download fails
    #[must_use]
    pub fn failing_fetches(mut self) -> Self {
        self.fail_fetches = true;
        self
    }

    /// The connection never drops after a shutdown command
    #[must_use]
    pub fn hanging_shutdown(mut self) -> Self {
        self.hang_shutdown = true;
        self
    }

    /// Commands run so far with their working directory
    #[must_use]
    pub fn execs(&self) -> Vec<(String, Option<String>)> {
        lock(&self.record).execs.clone()
    }

    /// Command lines run so far
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.record)
            .execs
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// Number of commands run that contain `pattern`
    #[must_use]
    pub fn count(&self, pattern: &str) -> usize {
        lock(&self.record)
            .execs
            .iter()
            .filter(|(command, _)| command.contains(pattern))
            .count()
    }

    /// Remote directories uploaded to
    #[must_use]
    pub fn uploads(&self) -> Vec<String> {
        lock(&self.record).uploads.clone()
    }

    /// Remote directories downloaded from
    #[must_use]
    pub fn fetches(&self) -> Vec<String> {
        lock(&self.record).fetches.clone()
    }

    /// Shutdown commands sent
    #[must_use]
    pub fn shutdowns(&self) -> Vec<String> {
        lock(&self.record).shutdowns.clone()
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput> {
        lock(&self.record)
            .execs
            .push((command.to_string(), cwd.map(str::to_string)));

        let mut rules = lock(&self.rules);
        let output = match rules.iter_mut().find(|r| command.contains(&r.pattern)) {
            Some(rule) => CommandOutput {
                code: rule.codes.pop_front().unwrap_or(rule.fallback),
                stdout: String::new(),
                stderr: rule.stderr.clone(),
            },
            None => CommandOutput::default(),
        };
        Ok(output)
    }

    async fn put_directory(&self, _local: &Path, remote: &str, _concurrency: usize) -> Result<()> {
        if self.fail_uploads {
            return Err(FleetError::Ssh(format!("Failed to upload to {remote}")));
        }
        lock(&self.record).uploads.push(remote.to_string());
        Ok(())
    }

    async fn get_directory(
        &self,
        local: &Path,
        remote: &str,
        filter: EntryFilter,
        _concurrency: usize,
    ) -> Result<()> {
        if self.fail_fetches {
            return Err(FleetError::Ssh(format!("Failed to download {remote}")));
        }
        lock(&self.record).fetches.push(remote.to_string());

        for name in self.remote_files.iter().filter(|name| filter(name.as_str())) {
            let path = local.join(name);
            std::fs::write(&path, name.as_bytes())
                .map_err(|e| FleetError::io(format!("Failed to write {path:?}"), e))?;
        }
        Ok(())
    }

    async fn shutdown(&self, command: &str, timeout: Duration) -> Result<()> {
        lock(&self.record).shutdowns.push(command.to_string());
        if self.hang_shutdown {
            return Err(FleetError::Timeout(timeout));
        }
        Ok(())
    }
}

/// Connector handing out scripted sessions by port
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    sessions: HashMap<u16, Arc<ScriptedSession>>,
    refusals: Mutex<HashMap<u16, u32>>,
    attempts: Mutex<HashMap<u16, u32>>,
}

impl ScriptedConnector {
    /// Connector refusing every port
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections on `port` with `session`
    #[must_use]
    pub fn with_session(mut self, port: u16, session: Arc<ScriptedSession>) -> Self {
        self.sessions.insert(port, session);
        self
    }

    /// Refuse the first `count` attempts on `port`
    #[must_use]
    pub fn refusing_first(self, port: u16, count: u32) -> Self {
        lock(&self.refusals).insert(port, count);
        self
    }

    /// Connection attempts made on `port`
    #[must_use]
    pub fn attempts(&self, port: u16) -> u32 {
        lock(&self.attempts).get(&port).copied().unwrap_or(0)
    }

    /// Connection attempts made on every port
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        lock(&self.attempts).values().sum()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>> {
        *lock(&self.attempts).entry(target.port).or_insert(0) += 1;

        if let Some(remaining) = lock(&self.refusals).get_mut(&target.port) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FleetError::Ssh(format!("Connection refused by {target}")));
            }
        }

        match self.sessions.get(&target.port) {
            Some(session) => Ok(session.clone() as Arc<dyn RemoteSession>),
            None => Err(FleetError::Ssh(format!("Connection refused by {target}"))),
        }
    }
}

/// Launcher recording what it would have spawned
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    missing_qemu: bool,
    fail_launches: bool,
    tool_exit: i32,
    tool_stderr: String,
    launches: Mutex<Vec<LaunchSpec>>,
    tool_runs: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl RecordingLauncher {
    /// Launcher where QEMU is installed and every launch settles
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// QEMU is not installed
    #[must_use]
    pub fn without_qemu(mut self) -> Self {
        self.missing_qemu = true;
        self
    }

    /// Every hypervisor exits right away
    #[must_use]
    pub fn failing_launches(mut self) -> Self {
        self.fail_launches = true;
        self
    }

    /// QEMU tools exit with `code` and print `stderr`
    #[must_use]
    pub fn with_tool_failure(mut self, code: i32, stderr: &str) -> Self {
        self.tool_exit = code;
        self.tool_stderr = stderr.to_string();
        self
    }

    /// Hypervisors launched so far
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        lock(&self.launches).clone()
    }

    /// Tools run so far with their arguments
    #[must_use]
    pub fn tool_runs(&self) -> Vec<(PathBuf, Vec<String>)> {
        lock(&self.tool_runs).clone()
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    fn check(&self) -> Result<()> {
        if self.missing_qemu {
            return Err(FleetError::MissingTool(
                "QEMU does not seem to be installed".to_string(),
            ));
        }
        Ok(())
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        lock(&self.launches).push(spec.clone());
        if self.fail_launches {
            return Err(FleetError::launch(
                spec.binary.display().to_string(),
                "exited early (exit status: 1)",
            ));
        }
        Ok(())
    }

    async fn run_tool(&self, binary: &Path, args: &[String], _cwd: &Path) -> Result<CommandOutput> {
        lock(&self.tool_runs).push((binary.to_path_buf(), args.to_vec()));
        Ok(CommandOutput {
            code: self.tool_exit,
            stdout: String::new(),
            stderr: self.tool_stderr.clone(),
        })
    }
}
