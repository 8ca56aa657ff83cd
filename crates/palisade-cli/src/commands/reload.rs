//! `plsd reload` — Re-apply cgroup or resource-limit settings.

use std::str::FromStr;

use anyhow::Context;
use clap::Args;
use nix::unistd::Pid;

use palisade_core::cgroup::{Cgroup2Config, CgroupConfig};
use palisade_runtime::reload::{ReloadTarget, reload};

use super::TargetArgs;

/// Arguments for the `reload` command.
#[derive(Args, Debug)]
pub struct ReloadArgs {
    /// Container identity.
    #[command(flatten)]
    pub target: TargetArgs,

    /// Container init PID; resolved via the PID file when omitted.
    #[arg(short = 't', long)]
    pub target_pid: Option<i32>,

    /// Settings groups to re-apply (comma-separated: cgroup,resource).
    #[arg(long, value_delimiter = ',', required = true)]
    pub targets: Vec<String>,

    /// New resource limit as NAME:SOFT:HARD.
    #[arg(long = "limit", value_name = "NAME:SOFT:HARD")]
    pub limits: Vec<String>,

    /// New cgroup v1 setting as CONTROLLER:KEY=VALUE.
    #[arg(long = "cgroup", value_name = "CTL:KEY=VALUE")]
    pub cgroups: Vec<String>,

    /// New cgroup v2 unified setting as KEY=VALUE.
    #[arg(long = "cgroup2", value_name = "KEY=VALUE")]
    pub cgroups2: Vec<String>,
}

/// Executes the `reload` command.
///
/// # Errors
///
/// Returns an error if a target or setting cannot be parsed, or the
/// resource-limit reapplication fails.
pub fn execute(args: ReloadArgs) -> anyhow::Result<()> {
    let mut spec = args.target.to_spec()?;
    if let Some(pid) = args.target_pid {
        spec.record_pid(Pid::from_raw(pid));
    }

    let targets = args
        .targets
        .iter()
        .map(|t| ReloadTarget::from_str(t).with_context(|| format!("--targets {t}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut cgroup = CgroupConfig::default();
    for entry in &args.cgroups {
        cgroup.entries.push(super::parse_cgroup_entry(entry)?);
    }
    let mut cgroup2 = Cgroup2Config::default();
    for entry in &args.cgroups2 {
        cgroup2.settings.push(super::parse_cgroup2_entry(entry)?);
    }
    let limits = args
        .limits
        .iter()
        .map(|l| super::parse_limit(l))
        .collect::<anyhow::Result<Vec<_>>>()?;

    reload(
        &mut spec,
        (!cgroup.is_empty()).then_some(&cgroup),
        (!cgroup2.is_empty()).then_some(&cgroup2),
        (!limits.is_empty()).then_some(limits.as_slice()),
        &targets,
    )?;
    Ok(())
}
