use crate::error::{FleetError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Login
    pub username: String,
    /// Password, also used to answer keyboard-interactive prompts
    pub password: String,
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Result of a remote command, `code == 0` is success
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `-1` when the command could not be run at all
    pub code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Fold an execution error into a failed result
    #[must_use]
    pub fn from_error(err: FleetError) -> Self {
        Self {
            code: -1,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }
}

/// Decides which remote directory entries get downloaded, by base name
pub type EntryFilter = fn(&str) -> bool;

/// Open session with one machine.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command, in `cwd` when given
    async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput>;

    /// Recursively copy a local directory to a remote path
    async fn put_directory(&self, local: &Path, remote: &str, concurrency: usize) -> Result<()>;

    /// Copy the files directly inside a remote directory to a local one
    async fn get_directory(
        &self,
        local: &Path,
        remote: &str,
        filter: EntryFilter,
        concurrency: usize,
    ) -> Result<()>;

    /// Send the shutdown command and wait until the peer drops the connection
    async fn shutdown(&self, command: &str, timeout: Duration) -> Result<()>;
}

/// Opens sessions, enabling test doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one connection attempt
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>>;
}
