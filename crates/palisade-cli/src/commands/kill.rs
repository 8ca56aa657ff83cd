//! `plsd kill` — Signal a running container and await its teardown.

use std::str::FromStr;

use anyhow::Context;
use clap::Args;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::TargetArgs;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container identity.
    #[command(flatten)]
    pub target: TargetArgs,

    /// Container init PID; resolved via the PID file when omitted.
    #[arg(short = 't', long)]
    pub target_pid: Option<i32>,

    /// Signal to deliver.
    #[arg(short, long, default_value = "SIGTERM")]
    pub signal: String,

    /// Seconds to wait for the container's lock to be released; a
    /// negative value returns immediately after delivery.
    #[arg(long, default_value_t = 10)]
    pub timeout: i64,
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if the signal name is unknown, the container
/// cannot be resolved, or delivery fails. Timeout exhaustion exits the
/// process with status 1.
pub fn execute(args: KillArgs) -> anyhow::Result<()> {
    let mut spec = args.target.to_spec()?;
    if let Some(pid) = args.target_pid {
        spec.record_pid(Pid::from_raw(pid));
    }

    let name = args.signal.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    let signal = Signal::from_str(&name).with_context(|| format!("--signal {}", args.signal))?;

    palisade_runtime::kill::kill(&mut spec, signal, args.timeout)?;
    Ok(())
}
