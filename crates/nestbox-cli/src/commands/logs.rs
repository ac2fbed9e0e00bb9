//! `nbx logs`: Print a container's log.

use std::io::Write;

use clap::Args;
use nestbox_runtime::engine::Engine;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container id or unambiguous prefix.
    pub container: String,
}

/// Executes the `logs` command.
///
/// Streams the log bytes unchanged to stdout.
///
/// # Errors
///
/// Returns an error if the container is not found or the log is unreadable.
pub fn execute(engine: &Engine, args: &LogsArgs) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    let _ = engine.logs(&args.container, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}
