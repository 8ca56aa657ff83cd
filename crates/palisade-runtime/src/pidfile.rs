//! Container PID files.
//!
//! The supervisor writes its own PID into a locked file at creation;
//! the lock is held for the supervised lifetime. Operators resolve the
//! container's init PID from the file (supervisor PID, translated via a
//! parent-PID scan of `/proc`), and the kill operator polls the lock's
//! release as its completion signal.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use palisade_common::error::{Result, RuntimeError};

use crate::lockfile::flock;

/// A created, locked PID file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    /// Creates the PID file, takes its exclusive lock, and writes the
    /// calling process's PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or is already
    /// locked by another supervisor.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RuntimeError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RuntimeError::io(&path, e))?;
        flock(&file, libc::LOCK_EX | libc::LOCK_NB).map_err(|e| RuntimeError::io(&path, e))?;
        file.write_all(nix::unistd::getpid().to_string().as_bytes())
            .map_err(|e| RuntimeError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "pid file created and locked");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// The PID file's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the file's lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock fails.
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            flock(&file, libc::LOCK_UN).map_err(|e| RuntimeError::io(&self.path, e))?;
            tracing::debug!(path = %self.path.display(), "pid file unlocked");
        }
        Ok(())
    }

    /// Removes the PID file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove(&mut self) -> Result<()> {
        drop(self.file.take());
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| RuntimeError::io(&self.path, e))?;
            tracing::debug!(path = %self.path.display(), "pid file removed");
        }
        Ok(())
    }
}

/// Reads the supervisor PID recorded in a PID file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no PID.
pub fn pid_of(path: &Path) -> Result<Pid> {
    let content = fs::read_to_string(path).map_err(|e| RuntimeError::io(path, e))?;
    let pid = content
        .trim()
        .parse::<i32>()
        .map_err(|_| RuntimeError::Config {
            message: format!("pid file {} holds no pid: {content:?}", path.display()),
        })?;
    Ok(Pid::from_raw(pid))
}

/// Whether the PID file's lock is still held by a supervisor.
///
/// A missing file counts as released; an unreadable one as still held,
/// so a polling caller keeps waiting rather than reporting success
/// early.
#[must_use]
pub fn locked(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    match flock(&file, libc::LOCK_SH | libc::LOCK_NB) {
        // Probe lock granted: nobody holds the exclusive lock. The
        // probe releases with the descriptor.
        Ok(()) => false,
        Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => true,
        Err(_) => true,
    }
}

/// Whether a process with this PID exists.
#[must_use]
pub fn process_exists(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

/// Pre-flight check before creating a container: fails when the PID
/// file records a live process, unlinks a stale file otherwise.
///
/// # Errors
///
/// Returns an error if a live container already owns the file or a
/// stale file cannot be removed.
pub fn confirm_absent(path: &Path, name: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if let Ok(pid) = pid_of(path) {
        if process_exists(pid) {
            return Err(RuntimeError::Config {
                message: format!(
                    "PID file {} exists; a container named {name} may already be running",
                    path.display()
                ),
            });
        }
    }
    fs::remove_file(path).map_err(|e| RuntimeError::io(path, e))?;
    tracing::debug!(path = %path.display(), "stale pid file removed");
    Ok(())
}

/// Resolves the container's init PID from its PID file.
///
/// The file records the supervisor's PID; the init process is found by
/// scanning `/proc/<pid>/status` entries for a matching parent PID — an
/// expensive but infrequent lookup.
///
/// # Errors
///
/// Returns an error if the file cannot be read or no child of the
/// supervisor is found.
pub fn resolve_container_pid(path: &Path) -> Result<Pid> {
    let supervisor = pid_of(path)?;
    ppid_to_pid(supervisor)
}

fn ppid_to_pid(ppid: Pid) -> Result<Pid> {
    let needle = format!("PPid:\t{ppid}");
    let entries = fs::read_dir("/proc").map_err(|e| RuntimeError::io("/proc", e))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
            continue;
        };
        if status.lines().any(|line| line == needle) {
            return Ok(Pid::from_raw(pid));
        }
    }
    Err(RuntimeError::NotFound {
        kind: "container process",
        id: format!("child of supervisor {ppid}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_locks_and_records_own_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("web-1.pid");

        let mut pid_file = PidFile::create(&path).expect("create");
        assert_eq!(pid_of(&path).expect("pid_of"), nix::unistd::getpid());
        assert!(locked(&path));

        pid_file.unlock().expect("unlock");
        assert!(!locked(&path));
        pid_file.remove().expect("remove");
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_reads_as_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!locked(&dir.path().join("absent.pid")));
    }

    #[test]
    fn confirm_absent_unlinks_a_stale_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("web-1.pid");
        // No process can have this PID: it exceeds any pid_max.
        fs::write(&path, "999999999").expect("write");

        confirm_absent(&path, "web-1").expect("stale file is cleared");
        assert!(!path.exists());
    }

    #[test]
    fn confirm_absent_rejects_a_live_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("web-1.pid");
        fs::write(&path, nix::unistd::getpid().to_string()).expect("write");

        assert!(confirm_absent(&path, "web-1").is_err());
    }

    #[test]
    fn resolving_finds_a_child_by_parent_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("web-1.pid");
        fs::write(&path, nix::unistd::getpid().to_string()).expect("write");

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");

        // Other tests may have children of their own; any process whose
        // parent is this test process is a correct resolution.
        let resolved = resolve_container_pid(&path).expect("resolve");
        let status = fs::read_to_string(format!("/proc/{resolved}/status")).expect("status");
        assert!(status.lines().any(|l| l == format!("PPid:\t{}", nix::unistd::getpid())));

        child.kill().expect("kill");
        let _ = child.wait();
    }
}
