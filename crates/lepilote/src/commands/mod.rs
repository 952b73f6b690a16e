//! Command verbs
//!
//! Every verb works on a [`RunContext`] holding the selected machines and reports a
//! boolean outcome; errors are reserved for conditions that abort the whole run.


/// `prepare`, `pack` and `publish`
pub mod prepare;

/// `info`, `ssh` and `reset`
pub mod machine;

use crate::cli::Commands;
use anyhow::Result;
use leflotte::lifecycle;
use leflotte::RunContext;

/// Run a command on the selected machines
///
/// # Returns
///
/// `Ok(true)` when the command succeeded
pub async fn dispatch(ctx: &mut RunContext, command: &Commands) -> Result<bool> {
    ctx.log()
        .say(format!("Machines: {}", ctx.fleet.names().join(", ")));
    ctx.log().say("");

    match command {
        Commands::Test { .. } => test::run_tests(ctx, false).await,
        Commands::Debug { .. } => test::run_tests(ctx, true).await,
        Commands::Pack { .. } => prepare::pack(ctx).await,
        Commands::Publish { .. } => prepare::publish(ctx).await,
        Commands::Prepare { .. } => Ok(prepare::prepare(ctx).await?.is_some()),
        Commands::Start { .. } => Ok(lifecycle::start(ctx, true).await?),
        Commands::Stop { .. } => Ok(lifecycle::stop(ctx, true).await),
        Commands::Info { .. } => machine::info(ctx),
        Commands::Ssh { .. } => machine::ssh(ctx),
        Commands::Reset { .. } => machine::reset(ctx).await,
    }
}
