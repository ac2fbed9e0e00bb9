//! CLI command definitions and dispatch.

pub mod inspect;
pub mod logs;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nestbox_common::config::RuntimeConfig;
use nestbox_common::constants::{DEFAULT_CGROUP_ROOT, DEFAULT_STATE_DIR};
use nestbox_runtime::engine::Engine;

/// Nestbox: a minimal Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "nbx", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding container records, logs, and the IP pool.
    #[arg(long, global = true, env = "NBX_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Parent cgroup under which container scopes are created.
    #[arg(long, global = true, env = "NBX_CGROUP_ROOT", default_value = DEFAULT_CGROUP_ROOT)]
    pub cgroup_root: PathBuf,

    /// Log runtime diagnostics at debug level.
    #[arg(long, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Runtime configuration assembled from the global flags.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::with_state_dir(&self.state_dir);
        config.cgroup_root.clone_from(&self.cgroup_root);
        config
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new container.
    Run(run::RunArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Remove a stopped container and its log.
    Rm(rm::RmArgs),
    /// Print a container's log.
    Logs(logs::LogsArgs),
    /// Print a container's full record as JSON.
    Inspect(inspect::InspectArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// Only a foreground `run` produces a non-zero success code: the exit code
/// of the container's command.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(cli.config())?;
    match cli.command {
        Command::Run(args) => run::execute(&engine, args),
        Command::Ps(args) => ps::execute(&engine, &args).map(|()| ExitCode::SUCCESS),
        Command::Stop(args) => stop::execute(&engine, &args).map(|()| ExitCode::SUCCESS),
        Command::Rm(args) => rm::execute(&engine, &args).map(|()| ExitCode::SUCCESS),
        Command::Logs(args) => logs::execute(&engine, &args).map(|()| ExitCode::SUCCESS),
        Command::Inspect(args) => inspect::execute(&engine, &args).map(|()| ExitCode::SUCCESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_reach_the_config() {
        let cli = Cli::try_parse_from([
            "nbx",
            "ps",
            "--state-dir",
            "/tmp/nbx-state",
            "--cgroup-root",
            "/sys/fs/cgroup/test",
        ])
        .expect("parse");
        let config = cli.config();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/nbx-state"));
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup/test"));
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["nbx", "run", "--detach"]).is_err());
    }

    #[test]
    fn run_keeps_command_flags_for_the_container() {
        let cli = Cli::try_parse_from([
            "nbx", "run", "--memory-limit", "512M", "-v", "/a:/b", "ls", "-la", "/",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            unreachable!("expected run");
        };
        assert_eq!(args.memory_limit.as_deref(), Some("512M"));
        assert_eq!(args.volume, ["/a:/b"]);
        assert_eq!(args.command, ["ls", "-la", "/"]);
        assert!(!args.detach);
    }
}
