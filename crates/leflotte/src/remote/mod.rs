//! Remote execution over SSH sessions

/// Session and connector abstractions, enabling test doubles.
pub mod session;
/// Platform-specific remote command composition.
pub mod shell;
/// libssh2-backed sessions.
pub mod ssh;
/// Command execution with repeat semantics.
pub mod exec;
/// Snapshot upload and artifact download.
pub mod transfer;

pub use exec::exec_remote;
pub use session::{CommandOutput, Connector, EntryFilter, RemoteSession, SshTarget};
pub use shell::RemoteShell;
pub use ssh::{Ssh2Connector, Ssh2Session};
pub use transfer::{fetch_artifacts, is_stray_version_artifact, upload};
