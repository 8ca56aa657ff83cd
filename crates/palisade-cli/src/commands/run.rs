//! `plsd run` — Create and supervise a container.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use palisade_core::cgroup::{Cgroup2Config, CgroupConfig};
use palisade_runtime::{create, daemon};

use super::TargetArgs;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container identity and namespace selection.
    #[command(flatten)]
    pub target: TargetArgs,

    /// New root directory for the container.
    #[arg(long)]
    pub chroot: Option<PathBuf>,

    /// Working directory, resolved under the chroot when one is set.
    #[arg(long, default_value = "/")]
    pub workdir: PathBuf,

    /// Detach the creation and supervision flow into the background.
    #[arg(short, long)]
    pub daemon: bool,

    /// Resource limit as NAME:SOFT:HARD; SOFT/HARD may be `unlimited`.
    #[arg(long = "limit", value_name = "NAME:SOFT:HARD")]
    pub limits: Vec<String>,

    /// Cgroup v1 setting as CONTROLLER:KEY=VALUE.
    #[arg(long = "cgroup", value_name = "CTL:KEY=VALUE")]
    pub cgroups: Vec<String>,

    /// Cgroup v2 unified setting as KEY=VALUE.
    #[arg(long = "cgroup2", value_name = "KEY=VALUE")]
    pub cgroups2: Vec<String>,

    /// Target uid to switch to before exec.
    #[arg(long)]
    pub uid: Option<u32>,

    /// Target gid to switch to before exec.
    #[arg(long)]
    pub gid: Option<u32>,

    /// Supplementary groups for the container process.
    #[arg(long, value_delimiter = ',')]
    pub groups: Vec<u32>,

    /// Wait-loop poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub wait_interval_ms: u64,

    /// Init command and arguments (after `--`).
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the spec is invalid or the creation flow fails.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut spec = args.target.to_spec()?;
    spec.filesystem.chroot = args.chroot;
    spec.filesystem.workdir = args.workdir;
    spec.daemon = args.daemon;
    spec.command.argv = args.command;
    spec.command.env = std::env::vars().collect();
    spec.guid.uid = args.uid;
    spec.guid.gid = args.gid;
    spec.guid.groups = args.groups;
    spec.wait_interval = Duration::from_millis(args.wait_interval_ms);

    let mut cgroup = CgroupConfig::default();
    for entry in &args.cgroups {
        cgroup.entries.push(super::parse_cgroup_entry(entry)?);
    }
    spec.cgroup = cgroup;

    let mut cgroup2 = Cgroup2Config::default();
    for entry in &args.cgroups2 {
        cgroup2.settings.push(super::parse_cgroup2_entry(entry)?);
    }
    spec.cgroup2 = cgroup2;

    for limit in &args.limits {
        spec.rlimits.push(super::parse_limit(limit)?);
    }

    daemon::boot(&mut spec, |spec| {
        let pid = create::spawn_supervisor(spec)?;
        Ok(vec![pid])
    })?;
    Ok(())
}
