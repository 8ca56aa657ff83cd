//! System-wide constants and default paths.

use std::path::PathBuf;

/// Directory holding per-project exclusive lock files.
pub const LOCK_DIR: &str = "/var/lock";

/// Directory holding container PID files by default.
pub const PID_DIR: &str = "/var/run/palisade";

/// Cgroup v1 per-controller hierarchy mount point.
pub const CGROUP_V1_ROOT: &str = "/sys/fs/cgroup";

/// Cgroup v2 unified hierarchy mount point.
pub const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";

/// Exit status reserved for a child that failed isolation setup before exec.
pub const SETUP_FAILED_STATUS: i32 = 127;

/// Exit status for a kill operation whose timeout budget was exhausted.
pub const KILL_TIMEOUT_STATUS: i32 = 1;

/// Null device used when reopening daemonized stdio.
pub const DEV_NULL: &str = "/dev/null";

/// Application name used in CLI output and lock file names.
pub const APP_NAME: &str = "palisade";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "plsd";

/// Returns the exclusive lock path for a project name.
#[must_use]
pub fn lock_path(project: &str) -> PathBuf {
    PathBuf::from(LOCK_DIR).join(format!(".{project}.{APP_NAME}lock"))
}

/// Returns the default PID file path for a container name.
#[must_use]
pub fn default_pid_file(name: &str) -> PathBuf {
    PathBuf::from(PID_DIR).join(format!("{name}.pid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_project_scoped() {
        assert_eq!(
            lock_path("web"),
            PathBuf::from("/var/lock/.web.palisadelock")
        );
    }

    #[test]
    fn default_pid_file_is_name_scoped() {
        assert_eq!(
            default_pid_file("web-1"),
            PathBuf::from("/var/run/palisade/web-1.pid")
        );
    }
}
