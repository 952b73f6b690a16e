use super::exec::exec_remote;
use crate::console::Status;
use crate::context::{RunContext, RunEnv};
use crate::error::{FleetError, Result};
use crate::machine::{Machine, RemoteCommand};
use futures::future::join_all;
use std::path::Path;
use tracing::{debug, warn};

/// Whether a downloaded entry is a stray version-prefixed temporary such as `v18.2.0.tmp`
#[must_use]
pub fn is_stray_version_artifact(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn keep_artifact(name: &str) -> bool {
    !is_stray_version_artifact(name)
}

/// Copy the snapshot to every active machine.
///
/// Each remote directory picked by `choose` is wiped, then filled with the snapshot.
/// Machines whose directories cannot be wiped or filled are excluded from the rest of
/// the run, the other machines are not affected.
///
/// # Returns
///
/// `true` when every machine received its copies
pub async fn upload<F>(ctx: &mut RunContext, snapshot: &Path, choose: F) -> bool
where
    F: Fn(&Machine) -> Vec<String>,
{
    let RunContext { fleet, env } = ctx;
    let env: &RunEnv = env;
    env.log.phase("Upload source code...");

    let tasks = fleet.active().map(|machine| {
        let directories = choose(machine);
        async move {
            let result = upload_machine(env, machine, snapshot, &directories).await;
            if let Err(err) = &result {
                warn!(machine = %machine.key, error = %err, "Upload failed");
            }

            env.log
                .line(&machine.name, "Upload", Status::from_success(result.is_ok()));
            (machine.key.clone(), result.is_ok())
        }
    });

    let outcomes = join_all(tasks).await;
    fleet.absorb(outcomes)
}

async fn upload_machine(
    env: &RunEnv,
    machine: &Machine,
    snapshot: &Path,
    directories: &[String],
) -> Result<()> {
    let session = machine.session()?;
    let concurrency = env.config.transfer.upload_concurrency();

    for directory in directories {
        remove_remote_dir(env, machine, directory).await?;
        session.put_directory(snapshot, directory, concurrency).await?;
    }

    Ok(())
}

/// Remove a remote directory, retrying on failure
async fn remove_remote_dir(env: &RunEnv, machine: &Machine, directory: &str) -> Result<()> {
    let timings = &env.config.timings;
    let command = RemoteCommand::from(format!("rm -rf \"{directory}\"").as_str());

    let mut code = -1;
    for attempt in 1..=timings.delete_retries {
        let output = exec_remote(machine, &command, None)
            .await
            .unwrap_or_else(crate::remote::CommandOutput::from_error);
        if output.success() {
            return Ok(());
        }

        code = output.code;
        debug!(machine = %machine.key, directory, attempt, code, "Remote delete failed");
        if attempt < timings.delete_retries {
            tokio::time::sleep(timings.delete_retry_delay()).await;
        }
    }

    Err(FleetError::RemoteCommand {
        command: command.command().to_string(),
        code,
    })
}

/// Download the build outputs of a machine.
///
/// The local directory is recreated first. Only the files directly inside `remote_dir`
/// are copied, stray version-prefixed temporaries are skipped.
pub async fn fetch_artifacts(
    machine: &Machine,
    remote_dir: &str,
    local_dir: &Path,
    concurrency: usize,
) -> Result<()> {
    let session = machine.session()?;

    match std::fs::remove_dir_all(local_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(FleetError::io(format!("Failed to clear {local_dir:?}"), e)),
    }
    std::fs::create_dir_all(local_dir)
        .map_err(|e| FleetError::io(format!("Failed to create {local_dir:?}"), e))?;

    session
        .get_directory(local_dir, remote_dir, keep_artifact, concurrency)
        .await
}
