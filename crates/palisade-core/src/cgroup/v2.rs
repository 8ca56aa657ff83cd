//! Cgroup v2 unified hierarchy.
//!
//! A container gets a single group directory; settings are staged with
//! [`CgroupV2::set`] and written together by [`CgroupV2::commit`].

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use palisade_common::constants::CGROUP_V2_ROOT;
use palisade_common::error::{Result, RuntimeError};

use super::Cgroup2Config;

/// Handle to one container's group in the unified hierarchy.
#[derive(Debug)]
pub struct CgroupV2 {
    dir: PathBuf,
    staged: Vec<(String, String)>,
}

impl CgroupV2 {
    /// Handle under the system unified-hierarchy root.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::at(Path::new(CGROUP_V2_ROOT), name)
    }

    /// Handle under an explicit hierarchy root.
    #[must_use]
    pub fn at(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
            staged: Vec::new(),
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
        tracing::debug!(dir = %self.dir.display(), "cgroup v2 group created");
        Ok(())
    }

    /// Stages one control setting for the next [`commit`](Self::commit).
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.staged.push((key.into(), value.into()));
    }

    /// Writes every staged setting to its control file, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if any control file cannot be written.
    pub fn commit(&mut self) -> Result<()> {
        for (key, value) in self.staged.drain(..) {
            super::write_control(&self.dir.join(&key), &value)?;
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
    /// # Errors
    ///
    /// Returns an error if the directory exists and cannot be removed.
    pub fn delete(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir(&self.dir).map_err(|e| RuntimeError::io(&self.dir, e))?;
            tracing::debug!(dir = %self.dir.display(), "cgroup v2 group deleted");
        }
        Ok(())
    }
}

/// Creates the unified group, commits every configured setting, and
/// attaches a process. A no-op when the configuration is empty.
///
/// # Errors
///
/// Returns an error if the group cannot be created or written.
pub fn apply_all(name: &str, config: &Cgroup2Config, pid: Pid) -> Result<()> {
    apply_all_at(Path::new(CGROUP_V2_ROOT), name, config, pid)
}

/// [`apply_all`] against an explicit hierarchy root.
///
/// # Errors
///
/// See [`apply_all`].
pub fn apply_all_at(root: &Path, name: &str, config: &Cgroup2Config, pid: Pid) -> Result<()> {
    if config.is_empty() {
        return Ok(());
    }
    let mut group = CgroupV2::at(root, name);
    group.create()?;
    for (key, value) in &config.settings {
        group.set(key, value);
    }
    group.commit()?;
    group.attach(pid)
}

/// Rewrites the settings of an existing unified group without creating
/// it or re-attaching processes. A no-op when the configuration is empty.
///
/// # Errors
///
/// Returns an error if any control file cannot be written.
pub fn modify_all(name: &str, config: &Cgroup2Config) -> Result<()> {
    modify_all_at(Path::new(CGROUP_V2_ROOT), name, config)
}

/// [`modify_all`] against an explicit hierarchy root.
///
/// # Errors
///
/// See [`modify_all`].
pub fn modify_all_at(root: &Path, name: &str, config: &Cgroup2Config) -> Result<()> {
    if config.is_empty() {
        return Ok(());
    }
    let mut group = CgroupV2::at(root, name);
    for (key, value) in &config.settings {
        group.set(key, value);
    }
    group.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_settings_write_on_commit() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut group = CgroupV2::at(root.path(), "web-1");
        group.create().expect("create");
        group.set("memory.max", "268435456");
        group.set("pids.max", "64");
        group.commit().expect("commit");

        let max = fs::read_to_string(root.path().join("web-1/memory.max")).expect("read back");
        assert_eq!(max, "268435456");
        let pids = fs::read_to_string(root.path().join("web-1/pids.max")).expect("read back");
        assert_eq!(pids, "64");
    }

    #[test]
    fn empty_config_applies_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        apply_all_at(root.path(), "web-1", &Cgroup2Config::default(), Pid::from_raw(1))
            .expect("apply");
        assert!(!root.path().join("web-1").exists());
    }

    #[test]
    fn commit_drains_staged_settings() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut group = CgroupV2::at(root.path(), "web-1");
        group.create().expect("create");
        group.set("pids.max", "64");
        group.commit().expect("commit");
        // A second commit has nothing left to write.
        group.commit().expect("empty commit");
    }
}
