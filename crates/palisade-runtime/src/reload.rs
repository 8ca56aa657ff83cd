//! Reload: re-apply cgroup and resource-limit settings to a running
//! container without recreating it.
//!
//! Cgroup reapplication errors are caught and logged and do not abort
//! the remaining targets; the `after_reload` hook always fires at the
//! end, regardless of per-target failures.

use std::str::FromStr;

use palisade_common::error::{Result, RuntimeError};
use palisade_core::cgroup::{self, Cgroup2Config, CgroupConfig};
use palisade_core::rlimit::{self, RlimitEntry};

use crate::hooks::{self, HookPoint};
use crate::spec::ContainerSpec;

/// A reloadable settings group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTarget {
    /// Cgroup v1/v2 settings.
    Cgroup,
    /// Resource limits.
    Resource,
}

impl FromStr for ReloadTarget {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cgroup" => Ok(Self::Cgroup),
            "resource" => Ok(Self::Resource),
            other => Err(RuntimeError::Config {
                message: format!("unknown reload target: {other}"),
            }),
        }
    }
}

/// Re-applies the requested targets against the running container,
/// using the new configurations where given and the spec's otherwise.
///
/// # Errors
///
/// Returns the first resource-limit failure after all targets were
/// attempted and the `after_reload` hook has fired. Cgroup failures are
/// logged only.
pub fn reload(
    spec: &mut ContainerSpec,
    new_cgroup: Option<&CgroupConfig>,
    new_cgroup2: Option<&Cgroup2Config>,
    new_limits: Option<&[RlimitEntry]>,
    targets: &[ReloadTarget],
) -> Result<()> {
    let mut failure = None;

    if targets.contains(&ReloadTarget::Cgroup) {
        tracing::info!("reloading cgroup settings");
        if let Err(err) = reapply_cgroup(spec, new_cgroup, new_cgroup2) {
            tracing::warn!(error = ?err, "cgroup reapply failed");
        }
    }

    if targets.contains(&ReloadTarget::Resource) {
        tracing::info!("reloading resource limits");
        if let Err(err) = reapply_rlimits(spec, new_limits) {
            tracing::warn!(%err, "resource-limit reapply failed");
            failure = Some(err);
        }
    }

    hooks::invoke(spec, HookPoint::AfterReload);
    failure.map_or(Ok(()), Err)
}

fn reapply_cgroup(
    spec: &ContainerSpec,
    new_cgroup: Option<&CgroupConfig>,
    new_cgroup2: Option<&Cgroup2Config>,
) -> Result<()> {
    let v1 = new_cgroup.unwrap_or(&spec.cgroup);
    if !v1.is_empty() {
        cgroup::v1::modify_all(&spec.name, v1)?;
    }
    let v2 = new_cgroup2.unwrap_or(&spec.cgroup2);
    if !v2.is_empty() {
        cgroup::v2::modify_all(&spec.name, v2)?;
    }
    Ok(())
}

fn reapply_rlimits(spec: &mut ContainerSpec, new_limits: Option<&[RlimitEntry]>) -> Result<()> {
    let pid = spec.resolve_pid()?;
    let limits: Vec<RlimitEntry> = new_limits.unwrap_or(&spec.rlimits).to_vec();
    rlimit::apply_pid(pid, &limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_targets_parse() {
        assert_eq!("cgroup".parse::<ReloadTarget>().ok(), Some(ReloadTarget::Cgroup));
        assert_eq!(
            "resource".parse::<ReloadTarget>().ok(),
            Some(ReloadTarget::Resource)
        );
        assert!("network".parse::<ReloadTarget>().is_err());
    }
}
