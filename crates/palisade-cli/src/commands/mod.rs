//! CLI command definitions and dispatch.

pub mod attach;
pub mod kill;
pub mod reload;
pub mod run;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};

use palisade_core::cgroup::CgroupEntry;
use palisade_core::namespace::Namespace;
use palisade_core::rlimit::{LimitValue, ResourceKind, RlimitEntry};
use palisade_runtime::spec::ContainerSpec;

/// Palisade — container runtime supervisor.
#[derive(Parser, Debug)]
#[command(name = "plsd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and supervise a container.
    Run(run::RunArgs),
    /// Run a command inside a running container.
    Attach(attach::AttachArgs),
    /// Signal a running container and await its teardown.
    Kill(kill::KillArgs),
    /// Re-apply cgroup or resource-limit settings to a running container.
    Reload(reload::ReloadArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::Attach(args) => attach::execute(args),
        Command::Kill(args) => kill::execute(args),
        Command::Reload(args) => reload::execute(args),
    }
}

/// Arguments identifying a container, shared by every subcommand.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Container name.
    #[arg(long)]
    pub name: String,

    /// Project name scoping the creation lock; the container name when
    /// omitted.
    #[arg(long)]
    pub project: Option<String>,

    /// Path of the container's PID file.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Namespaces the container uses (comma-separated:
    /// mount,uts,ipc,net,pid,user).
    #[arg(long, value_delimiter = ',')]
    pub namespaces: Vec<String>,
}

impl TargetArgs {
    /// Builds the base container spec these arguments describe.
    pub(crate) fn to_spec(&self) -> anyhow::Result<ContainerSpec> {
        let project = self.project.clone().unwrap_or_else(|| self.name.clone());
        let mut spec = ContainerSpec::new(&self.name, project);
        if let Some(pid_file) = &self.pid_file {
            spec.pid_file = pid_file.clone();
        }
        for ns in &self.namespaces {
            let ns = Namespace::from_str(ns).with_context(|| format!("--namespaces {ns}"))?;
            spec.namespaces.create(ns);
        }
        Ok(spec)
    }
}

/// Parses a `NAME:SOFT:HARD` resource-limit triple.
pub(crate) fn parse_limit(value: &str) -> anyhow::Result<RlimitEntry> {
    let parts: Vec<&str> = value.split(':').collect();
    let [name, soft, hard] = parts.as_slice() else {
        bail!("invalid limit `{value}`, expected NAME:SOFT:HARD");
    };
    Ok(RlimitEntry {
        resource: ResourceKind::from_str(name).with_context(|| format!("--limit {value}"))?,
        soft: LimitValue::from_str(soft).with_context(|| format!("--limit {value}"))?,
        hard: LimitValue::from_str(hard).with_context(|| format!("--limit {value}"))?,
    })
}

/// Parses a `CONTROLLER:KEY=VALUE` cgroup v1 setting.
pub(crate) fn parse_cgroup_entry(value: &str) -> anyhow::Result<CgroupEntry> {
    let Some((controller, setting)) = value.split_once(':') else {
        bail!("invalid cgroup setting `{value}`, expected CONTROLLER:KEY=VALUE");
    };
    let Some((key, val)) = setting.split_once('=') else {
        bail!("invalid cgroup setting `{value}`, expected CONTROLLER:KEY=VALUE");
    };
    Ok(CgroupEntry {
        controller: controller.to_owned(),
        key: key.to_owned(),
        value: val.to_owned(),
    })
}

/// Parses a `KEY=VALUE` cgroup v2 setting.
pub(crate) fn parse_cgroup2_entry(value: &str) -> anyhow::Result<(String, String)> {
    let Some((key, val)) = value.split_once('=') else {
        bail!("invalid cgroup v2 setting `{value}`, expected KEY=VALUE");
    };
    Ok((key.to_owned(), val.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_triples_parse() {
        let entry = parse_limit("nofile:1024:unlimited").expect("parse");
        assert_eq!(entry.resource, ResourceKind::Nofile);
        assert_eq!(entry.soft, LimitValue::Value(1024));
        assert_eq!(entry.hard, LimitValue::Unlimited);
        assert!(parse_limit("nofile:1024").is_err());
    }

    #[test]
    fn cgroup_settings_parse() {
        let entry = parse_cgroup_entry("cpu:cpu.shares=512").expect("parse");
        assert_eq!(entry.controller, "cpu");
        assert_eq!(entry.key, "cpu.shares");
        assert_eq!(entry.value, "512");
        assert!(parse_cgroup_entry("cpu.shares=512").is_err());

        let (key, value) = parse_cgroup2_entry("memory.max=256M").expect("parse");
        assert_eq!(key, "memory.max");
        assert_eq!(value, "256M");
    }
}
