//! Fleet error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors raised while loading, selecting and driving machines
#[derive(Debug, Error)]
pub enum FleetError {
    /// Registry file could not be read
    #[error("Failed to read registry {path:?}: {source}")]
    RegistryIo {
        /// Registry path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Registry file is not valid JSON or has the wrong shape
    #[error("Malformed registry {path:?}: {source}")]
    RegistryParse {
        /// Registry path
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// The registry holds no machine at all
    #[error("Could not detect any machine")]
    EmptyRegistry,

    /// A machine pattern is syntactically invalid
    #[error("Machine pattern '{0}' is not valid")]
    InvalidPattern(String),

    /// A machine pattern matched nothing
    #[error("Pattern '{0}' does not match any machine")]
    UnmatchedPattern(String),

    /// Every considered machine was missing
    #[error("No machine available")]
    NoMachineAvailable,

    /// The machine has no boot descriptor
    #[error("Machine {machine} is not managed by QEMU")]
    Unmanaged {
        /// Display name
        machine: String,
    },

    /// Connection attempts were exhausted
    #[error("Failed to connect to {machine}")]
    ConnectFailed {
        /// Display name
        machine: String,
    },

    /// No session is open for the machine
    #[error("Machine {machine} is not connected")]
    NotConnected {
        /// Display name
        machine: String,
    },

    /// The hypervisor process could not be launched or died early
    #[error("Failed to launch {binary}: {message}")]
    Launch {
        /// Binary that was launched
        binary: String,
        /// Failure description
        message: String,
    },

    /// SSH transport or SFTP failure
    #[error("SSH error: {0}")]
    Ssh(String),

    /// A remote helper command exited with a non-zero code
    #[error("Remote command '{command}' exited with code {code}")]
    RemoteCommand {
        /// Command line
        command: String,
        /// Exit code
        code: i32,
    },

    /// An operation exceeded its time budget
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A required host tool is not installed
    #[error("{0}")]
    MissingTool(String),

    /// I/O errors with context
    #[error("I/O error: {context}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl FleetError {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a launch error
    pub fn launch(binary: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::Launch {
            binary: binary.into(),
            message: message.into(),
        }
    }

    /// Errors that abort the whole run before or instead of any per-machine work.
    ///
    /// Everything else is recoverable at the machine level: the machine gets ignored
    /// and the other machines carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::RegistryIo { .. }
                | FleetError::RegistryParse { .. }
                | FleetError::EmptyRegistry
                | FleetError::InvalidPattern(_)
                | FleetError::UnmatchedPattern(_)
                | FleetError::NoMachineAvailable
                | FleetError::MissingTool(_)
        )
    }
}

impl From<ssh2::Error> for FleetError {
    fn from(err: ssh2::Error) -> Self {
        FleetError::Ssh(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FleetError::EmptyRegistry.is_fatal());
        assert!(FleetError::UnmatchedPattern("x".into()).is_fatal());
        assert!(FleetError::NoMachineAvailable.is_fatal());
        assert!(FleetError::MissingTool("QEMU does not seem to be installed".into()).is_fatal());

        assert!(!FleetError::ConnectFailed { machine: "a".into() }.is_fatal());
        assert!(!FleetError::Timeout(Duration::from_secs(60)).is_fatal());
        assert!(!FleetError::Ssh("reset".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = FleetError::ConnectFailed {
            machine: "Debian x64".into(),
        };
        assert_eq!(err.to_string(), "Failed to connect to Debian x64");

        let err = FleetError::UnmatchedPattern("freebsd*".into());
        assert_eq!(err.to_string(), "Pattern 'freebsd*' does not match any machine");
    }
}
