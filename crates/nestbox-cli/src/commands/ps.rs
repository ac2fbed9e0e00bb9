//! `nbx ps`: List containers.

use clap::Args;
use nestbox_runtime::engine::Engine;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only show running containers.
    #[arg(short, long)]
    pub running: bool,
}

/// Executes the `ps` command.
///
/// Listing first reconciles records whose process has died, so the table
/// never shows a dead process as running.
///
/// # Errors
///
/// Returns an error if the state directory cannot be read.
pub fn execute(engine: &Engine, args: &PsArgs) -> anyhow::Result<()> {
    let records: Vec<_> = engine
        .list()?
        .into_iter()
        .filter(|r| !args.running || r.is_running())
        .collect();

    if records.is_empty() {
        println!("No containers found.");
        return Ok(());
    }
    print!("{}", output::container_table(&records));
    Ok(())
}
