//! `plsd attach` — Run a command inside a running container.

use clap::Args;
use nix::unistd::Pid;

use palisade_runtime::attach;

use super::TargetArgs;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container identity and namespace selection.
    #[command(flatten)]
    pub target: TargetArgs,

    /// Container init PID; resolved via the PID file when omitted.
    #[arg(short = 't', long)]
    pub target_pid: Option<i32>,

    /// Command to run inside the container (after `--`); a shell when
    /// omitted.
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Executes the `attach` command.
///
/// # Errors
///
/// Returns an error if the container cannot be resolved or the attach
/// fork fails.
pub fn execute(args: AttachArgs) -> anyhow::Result<()> {
    let mut spec = args.target.to_spec()?;
    if let Some(pid) = args.target_pid {
        spec.record_pid(Pid::from_raw(pid));
    }

    let status = attach::attach(&mut spec, &args.command)?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
