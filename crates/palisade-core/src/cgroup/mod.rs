//! Cgroup resource management.
//!
//! Supports both v1 per-controller hierarchies and the v2 unified
//! hierarchy. Controller settings are plain key/value pairs written to
//! the corresponding control files; unknown v1 controller names are a
//! fatal configuration error.

pub mod v1;
pub mod v2;

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use nix::unistd::Pid;

use palisade_common::error::{Result, RuntimeError};

/// The cgroup v1 controllers this runtime supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// CPU bandwidth and shares.
    Cpu,
    /// CPU and memory node placement.
    Cpuset,
    /// CPU usage accounting.
    Cpuacct,
    /// Block I/O throttling and weights.
    Blkio,
    /// Memory limits and accounting.
    Memory,
    /// Process-count limits.
    Pids,
}

impl Controller {
    /// The controller's directory name under the v1 hierarchy root.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuset => "cpuset",
            Self::Cpuacct => "cpuacct",
            Self::Blkio => "blkio",
            Self::Memory => "memory",
            Self::Pids => "pids",
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Controller {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cpuset" => Ok(Self::Cpuset),
            "cpuacct" => Ok(Self::Cpuacct),
            "blkio" => Ok(Self::Blkio),
            "memory" => Ok(Self::Memory),
            "pids" => Ok(Self::Pids),
            other => Err(RuntimeError::Unsupported {
                what: format!("cgroup controller `{other}`"),
            }),
        }
    }
}

/// One v1 controller setting: a control-file key and its value.
#[derive(Debug, Clone)]
pub struct CgroupEntry {
    /// Controller name as configured (validated on apply).
    pub controller: String,
    /// Control file name, e.g. `cpu.cfs_quota_us`.
    pub key: String,
    /// Value to write.
    pub value: String,
}

/// The container's cgroup v1 configuration.
#[derive(Debug, Clone, Default)]
pub struct CgroupConfig {
    /// Ordered controller settings.
    pub entries: Vec<CgroupEntry>,
}

impl CgroupConfig {
    /// Whether no v1 settings are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The distinct controller names, in first-appearance order.
    #[must_use]
    pub fn controllers(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&entry.controller.as_str()) {
                seen.push(entry.controller.as_str());
            }
        }
        seen
    }

    /// The `(key, value)` pairs configured for one controller.
    pub fn entries_for<'a>(
        &'a self,
        controller: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .iter()
            .filter(move |e| e.controller == controller)
            .map(|e| (e.key.as_str(), e.value.as_str()))
    }
}

/// The container's cgroup v2 unified-hierarchy configuration.
#[derive(Debug, Clone, Default)]
pub struct Cgroup2Config {
    /// Ordered `(key, value)` settings, e.g. `("memory.max", "256M")`.
    pub settings: Vec<(String, String)>,
}

impl Cgroup2Config {
    /// Whether no unified settings are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

/// Writes one cgroup control file.
pub(crate) fn write_control(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| RuntimeError::io(path, e))?;
    tracing::debug!(path = %path.display(), value, "cgroup control written");
    Ok(())
}

/// Attaches a process to a cgroup directory by writing `cgroup.procs`.
pub(crate) fn attach_pid(dir: &Path, pid: Pid) -> Result<()> {
    let procs = dir.join("cgroup.procs");
    fs::write(&procs, pid.to_string()).map_err(|e| RuntimeError::io(&procs, e))?;
    tracing::debug!(%pid, dir = %dir.display(), "process attached to cgroup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_controllers_parse() {
        assert_eq!("memory".parse::<Controller>().ok(), Some(Controller::Memory));
        assert_eq!("pids".parse::<Controller>().ok(), Some(Controller::Pids));
    }

    #[test]
    fn unknown_controller_is_unsupported() {
        let err = "netcls".parse::<Controller>().unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported { .. }));
    }

    #[test]
    fn controllers_deduplicate_in_order() {
        let config = CgroupConfig {
            entries: vec![
                CgroupEntry {
                    controller: "cpu".into(),
                    key: "cpu.shares".into(),
                    value: "512".into(),
                },
                CgroupEntry {
                    controller: "memory".into(),
                    key: "memory.limit_in_bytes".into(),
                    value: "268435456".into(),
                },
                CgroupEntry {
                    controller: "cpu".into(),
                    key: "cpu.cfs_quota_us".into(),
                    value: "50000".into(),
                },
            ],
        };
        assert_eq!(config.controllers(), vec!["cpu", "memory"]);
        assert_eq!(config.entries_for("cpu").count(), 2);
    }
}
