//! `nbx stop`: Stop a running container.

use clap::Args;
use nestbox_runtime::engine::{Engine, StopOutcome};

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container id or unambiguous prefix.
    pub container: String,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the id does not resolve or the record cannot be
/// updated.
pub fn execute(engine: &Engine, args: &StopArgs) -> anyhow::Result<()> {
    match engine.stop(&args.container)? {
        StopOutcome::Stopped => println!("{}", args.container),
        StopOutcome::NotRunning(status) => {
            eprintln!("container {} is not running ({status})", args.container);
        }
    }
    Ok(())
}
