//! `nbx rm`: Remove a stopped container.

use clap::Args;
use nestbox_runtime::engine::Engine;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container id or unambiguous prefix.
    pub container: String,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns an error if the container is still running or does not exist.
pub fn execute(engine: &Engine, args: &RmArgs) -> anyhow::Result<()> {
    let id = engine.remove(&args.container)?;
    println!("{id}");
    Ok(())
}
