//! `nbx inspect`: Print a container's record.

use clap::Args;
use nestbox_runtime::engine::Engine;

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Container id or unambiguous prefix.
    pub container: String,
}

/// Executes the `inspect` command.
///
/// # Errors
///
/// Returns an error if the container is not found.
pub fn execute(engine: &Engine, args: &InspectArgs) -> anyhow::Result<()> {
    let record = engine.inspect(&args.container)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
