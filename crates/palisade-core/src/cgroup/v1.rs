//! Cgroup v1 per-controller hierarchies.
//!
//! Each controller lives under its own subtree of the hierarchy root;
//! a container gets one group directory per configured controller,
//! named after the container.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::unistd::Pid;

use palisade_common::constants::CGROUP_V1_ROOT;
use palisade_common::error::{Result, RuntimeError};

use super::{CgroupConfig, Controller};

/// Handle to one container's group under a single v1 controller.
#[derive(Debug)]
pub struct CgroupV1 {
    controller: Controller,
    dir: PathBuf,
}

impl CgroupV1 {
    /// Handle under the system hierarchy root.
    #[must_use]
    pub fn new(controller: Controller, name: &str) -> Self {
        Self::at(Path::new(CGROUP_V1_ROOT), controller, name)
    }

    /// Handle under an explicit hierarchy root.
    #[must_use]
    pub fn at(root: &Path, controller: Controller, name: &str) -> Self {
        Self {
            controller,
            dir: root.join(controller.as_str()).join(name),
        }
    }

    /// The group's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the group directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| RuntimeError::io(&self.dir, e))?;
        tracing::debug!(controller = %self.controller, dir = %self.dir.display(), "cgroup created");
        Ok(())
    }

    /// Writes the given control settings into the group.
    ///
    /// # Errors
    ///
    /// Returns an error if any control file cannot be written.
    pub fn apply<'a>(&self, settings: impl Iterator<Item = (&'a str, &'a str)>) -> Result<()> {
        for (key, value) in settings {
            super::write_control(&self.dir.join(key), value)?;
        }
        Ok(())
    }

    /// Attaches a process to the group.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be written.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        super::attach_pid(&self.dir, pid)
    }

    /// Removes the group directory.
    ///
    /// Cgroup directories only accept `rmdir`, so this fails while
    /// member processes remain attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists and cannot be removed.
    pub fn delete(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir(&self.dir).map_err(|e| RuntimeError::io(&self.dir, e))?;
            tracing::debug!(controller = %self.controller, "cgroup deleted");
        }
        Ok(())
    }
}

/// Creates, configures, and attaches a process to every configured
/// controller group.
///
/// # Errors
///
/// Returns [`RuntimeError::Unsupported`] for an unknown controller name,
/// or an I/O error if any control file write fails.
pub fn apply_all(name: &str, config: &CgroupConfig, pid: Pid) -> Result<()> {
    apply_all_at(Path::new(CGROUP_V1_ROOT), name, config, pid)
}

/// [`apply_all`] against an explicit hierarchy root.
///
/// # Errors
///
/// See [`apply_all`].
pub fn apply_all_at(root: &Path, name: &str, config: &CgroupConfig, pid: Pid) -> Result<()> {
    for controller_name in config.controllers() {
        let controller = Controller::from_str(controller_name)?;
        let group = CgroupV1::at(root, controller, name);
        group.create()?;
        group.apply(config.entries_for(controller_name))?;
        group.attach(pid)?;
    }
    Ok(())
}

/// Rewrites the control settings of existing controller groups without
/// creating them or re-attaching processes.
///
/// # Errors
///
/// Returns [`RuntimeError::Unsupported`] for an unknown controller name,
/// or an I/O error if any control file write fails.
pub fn modify_all(name: &str, config: &CgroupConfig) -> Result<()> {
    modify_all_at(Path::new(CGROUP_V1_ROOT), name, config)
}

/// [`modify_all`] against an explicit hierarchy root.
///
/// # Errors
///
/// See [`modify_all`].
pub fn modify_all_at(root: &Path, name: &str, config: &CgroupConfig) -> Result<()> {
    for controller_name in config.controllers() {
        let controller = Controller::from_str(controller_name)?;
        let group = CgroupV1::at(root, controller, name);
        group.apply(config.entries_for(controller_name))?;
    }
    Ok(())
}

/// Deletes every configured controller group.
///
/// # Errors
///
/// Returns [`RuntimeError::Unsupported`] for an unknown controller name,
/// or an I/O error if a directory cannot be removed.
pub fn delete_all(name: &str, config: &CgroupConfig) -> Result<()> {
    delete_all_at(Path::new(CGROUP_V1_ROOT), name, config)
}

/// [`delete_all`] against an explicit hierarchy root.
///
/// # Errors
///
/// See [`delete_all`].
pub fn delete_all_at(root: &Path, name: &str, config: &CgroupConfig) -> Result<()> {
    for controller_name in config.controllers() {
        let controller = Controller::from_str(controller_name)?;
        CgroupV1::at(root, controller, name).delete()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::CgroupEntry;
    use super::*;

    fn sample_config() -> CgroupConfig {
        CgroupConfig {
            entries: vec![
                CgroupEntry {
                    controller: "cpu".into(),
                    key: "cpu.shares".into(),
                    value: "512".into(),
                },
                CgroupEntry {
                    controller: "pids".into(),
                    key: "pids.max".into(),
                    value: "64".into(),
                },
            ],
        }
    }

    #[test]
    fn group_dir_is_controller_scoped() {
        let group = CgroupV1::at(Path::new("/sys/fs/cgroup"), Controller::Memory, "web-1");
        assert_eq!(group.dir(), Path::new("/sys/fs/cgroup/memory/web-1"));
    }

    #[test]
    fn create_and_apply_write_control_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let group = CgroupV1::at(root.path(), Controller::Cpu, "web-1");
        group.create().expect("create");
        group
            .apply([("cpu.shares", "512")].into_iter())
            .expect("apply");

        let written =
            fs::read_to_string(root.path().join("cpu/web-1/cpu.shares")).expect("read back");
        assert_eq!(written, "512");
    }

    #[test]
    fn unknown_controller_aborts_apply_all() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = CgroupConfig {
            entries: vec![CgroupEntry {
                controller: "netcls".into(),
                key: "netcls.x".into(),
                value: "1".into(),
            }],
        };
        let err = apply_all_at(root.path(), "web-1", &config, Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported { .. }));
    }

    #[test]
    fn modify_does_not_create_groups() {
        let root = tempfile::tempdir().expect("tempdir");
        let result = modify_all_at(root.path(), "web-1", &sample_config());
        // Groups were never created, so rewriting their controls fails.
        assert!(result.is_err());
        assert!(!root.path().join("cpu/web-1").exists());
    }

    #[test]
    fn delete_is_a_noop_for_missing_groups() {
        let root = tempfile::tempdir().expect("tempdir");
        delete_all_at(root.path(), "web-1", &sample_config()).expect("delete");
    }
}
