use crate::package::{self, Manifest};
use crate::snapshot;
use crate::tools::Tool;
use anyhow::{Context, Result};
use futures::future::join_all;
use leflotte::console::Status;
use leflotte::lifecycle;
use leflotte::remote::{exec_remote, fetch_artifacts, upload, CommandOutput};
use leflotte::{BuildSpec, Machine, RunContext, RunEnv};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Build the redistributable binaries that are missing and assemble the package.
///
/// Machines whose binaries all exist locally are excluded before anything boots. The
/// others build every build suite once and their outputs are downloaded next to the
/// existing ones.
///
/// # Returns
///
/// `Ok(Some(dist))` with the package directory, `Ok(None)` when a build failed
pub async fn prepare(ctx: &mut RunContext) -> Result<Option<PathBuf>> {
    let snapshot_dir = snapshot::snapshot(&ctx.env.config, ctx.log())?;
    let component_dir = ctx.env.config.paths.component_dir();
    let manifest = Manifest::load(&component_dir)?;

    ctx.log().say(format!(">> Version: {}", manifest.version));
    ctx.log().phase("Checking build archives...");

    let mut artifacts = Vec::new();
    let mut ready = Vec::new();
    for machine in &ctx.fleet.machines {
        let mut needed = false;
        for (suite, build) in &machine.builds {
            let dir = manifest.artifact_dir(&component_dir, &machine.platform, &build.arch);
            let action = format!("{suite} > Status");

            if dir.join(manifest.binary_name()).exists() {
                ctx.log().line(&machine.name, &action, Status::Ok);
            } else if !machine.is_managed() {
                ctx.log().line(&machine.name, &action, Status::Tag("manual".to_string()));
                needed = true;
            } else {
                ctx.log().line(&machine.name, &action, Status::Tag("missing".to_string()));
                needed = true;
            }
            artifacts.push(dir);
        }

        if !needed {
            ready.push(machine.key.clone());
        }
    }
    for key in ready {
        ctx.fleet.ignore(key);
    }
    let ready = ctx.fleet.ignored.len();

    let mut success = true;
    if ready < ctx.fleet.machines.len() {
        success &= lifecycle::start(ctx, false).await?;
        success &= upload(ctx, &snapshot_dir, build_directories).await;

        let RunContext { fleet, env } = &mut *ctx;
        let env: &RunEnv = env;
        env.log.phase("Run build commands...");

        let outcomes = join_all(fleet.active().map(|machine| async move {
            let ok = build_machine(env, machine).await;
            (machine.key.clone(), ok)
        }))
        .await;
        success &= fleet.absorb(outcomes);
    }

    {
        let RunContext { fleet, env } = &mut *ctx;
        let env: &RunEnv = env;
        env.log.phase("Get build artifacts");

        let component_dir = &component_dir;
        let manifest = &manifest;
        let outcomes = join_all(fleet.active().map(|machine| async move {
            let ok = fetch_machine(env, machine, component_dir, manifest).await;
            env.log.line(&machine.name, "Pack", Status::from_success(ok));
            (machine.key.clone(), ok)
        }))
        .await;
        success &= fleet.absorb(outcomes);
    }

    if ctx.fleet.any_started() {
        success &= lifecycle::stop(ctx, false).await;
    }
    success &= ctx.fleet.ignored.len() == ready;

    if !success {
        ctx.log().summary(false, ctx.fleet.has_ignored());
        return Ok(None);
    }

    let dist = package::assemble(&ctx.env.config, &snapshot_dir, &manifest, &artifacts, ctx.log())?;
    info!(dist = %dist.display(), binaries = artifacts.len(), "Package ready");
    Ok(Some(dist))
}

fn build_directories(machine: &Machine) -> Vec<String> {
    machine.builds.values().map(|b| b.directory.clone()).collect()
}

fn remote_component(env: &RunEnv, build: &BuildSpec) -> String {
    format!(
        "{}/{}",
        build.directory.trim_end_matches('/'),
        env.config.paths.component_remote()
    )
}

async fn build_machine(env: &RunEnv, machine: &Machine) -> bool {
    let builds = machine.builds.iter().map(|(suite, build)| async move {
        let cwd = remote_component(env, build);
        let started = Instant::now();
        let output = exec_remote(machine, &build.build, Some(&cwd))
            .await
            .unwrap_or_else(CommandOutput::from_error);

        let action = format!("{suite} > Build");
        if output.success() {
            env.log.line(&machine.name, &action, Status::Elapsed(started.elapsed()));
            true
        } else {
            debug!(machine = %machine.key, suite, code = output.code, "Build failed");
            env.log.line(&machine.name, &action, Status::Error);
            env.log.output(&output.stdout, &output.stderr);
            false
        }
    });

    join_all(builds).await.into_iter().all(|ok| ok)
}

async fn fetch_machine(env: &RunEnv, machine: &Machine, component_dir: &Path, manifest: &Manifest) -> bool {
    let concurrency = env.config.transfer.fetch_concurrency;
    let mut ok = true;

    for build in machine.builds.values() {
        let remote = format!("{}/build", remote_component(env, build));
        let local = manifest.artifact_dir(component_dir, &machine.platform, &build.arch);

        if let Err(err) = fetch_artifacts(machine, &remote, &local, concurrency).await {
            warn!(machine = %machine.key, remote, error = %err, "Failed to fetch build artifacts");
            ok = false;
        }
    }

    ok
}

/// Prepare the package and create its tarball in the build directory
pub async fn pack(ctx: &mut RunContext) -> Result<bool> {
    let Some(dist) = prepare(ctx).await? else {
        return Ok(false);
    };

    let destination = ctx.env.config.paths.build.to_string_lossy().into_owned();
    run_npm(&dist, &["pack", "--pack-destination", &destination])
}

/// Prepare the package and publish it
pub async fn publish(ctx: &mut RunContext) -> Result<bool> {
    let Some(dist) = prepare(ctx).await? else {
        return Ok(false);
    };

    run_npm(&dist, &["publish"])
}

fn run_npm(cwd: &Path, args: &[&str]) -> Result<bool> {
    let status = Tool::Npm
        .command()
        .args(args)
        .current_dir(cwd)
        .status()
        .with_context(|| format!("Failed to run {} {}", Tool::Npm, args.join(" ")))?;

    debug!(status = %status, "npm finished");
    Ok(status.success())
}
