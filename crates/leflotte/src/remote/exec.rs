use super::session::CommandOutput;
use super::shell::RemoteShell;
use crate::error::Result;
use crate::machine::{Machine, RemoteCommand};
use tracing::debug;

/// Run a command on a machine.
///
/// The command runs up to `repeat` times and stops at the first non-zero exit, so a flaky
/// step gets retried without hiding a real failure. The result of the last run is
/// returned.
///
/// # Arguments
///
/// * `machine` - Connected machine
/// * `command` - Command line and repeat count
/// * `cwd` - Remote working directory
///
/// # Returns
///
/// `Result<CommandOutput>` - Output of the last run, or why nothing could be run. Callers
/// that only care about the exit code fold errors with [`CommandOutput::from_error`].
pub async fn exec_remote(
    machine: &Machine,
    command: &RemoteCommand,
    cwd: Option<&str>,
) -> Result<CommandOutput> {
    let session = machine.session()?;
    let shell = RemoteShell::for_machine(machine);
    let (line, cwd) = shell.compose(command.command(), cwd);

    let mut output = CommandOutput::default();
    for attempt in 1..=command.repeat() {
        output = session.exec(&line, cwd.as_deref()).await?;
        debug!(machine = %machine.key, attempt, code = output.code, "Remote command finished");

        if !output.success() {
            break;
        }
    }

    Ok(output)
}
