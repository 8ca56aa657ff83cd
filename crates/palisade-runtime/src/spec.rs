//! The fully-resolved container specification.
//!
//! Built by the configuration layer and passed by reference through the
//! whole creation and supervision flow. Besides the static description,
//! the spec carries the mutable run-state written during that flow:
//! `pid`, `supervisor_pid`, `created_at`, `exit_status`, `system_error`,
//! and the `cleaned` idempotency guard.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;

use palisade_common::constants;
use palisade_common::error::{Result, RuntimeError};
use palisade_common::types::ExitStatus;
use palisade_core::capability::CapabilityPolicy;
use palisade_core::cgroup::{Cgroup2Config, CgroupConfig};
use palisade_core::mounts::{MountPoint, RootfsOwner};
use palisade_core::namespace::NamespaceSet;
use palisade_core::rlimit::RlimitEntry;
use palisade_core::seccomp::SeccompPolicy;

use crate::hooks::{HookTable, SignalTable};
use crate::network::NetworkHandler;
use crate::pidfile;

/// The init command and its execution environment.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program and arguments; `argv[0]` is the program path.
    pub argv: Vec<String>,
    /// Environment passed to exec.
    pub env: Vec<(String, String)>,
    /// Daemon-mode stdin redirection; null device when unset.
    pub stdin: Option<PathBuf>,
    /// Daemon-mode stdout redirection; null device when unset.
    pub stdout: Option<PathBuf>,
    /// Daemon-mode stderr redirection; null device when unset.
    pub stderr: Option<PathBuf>,
}

/// Target identity assumed immediately before exec.
#[derive(Debug, Clone, Default)]
pub struct Guid {
    /// Target uid; the current uid when unset.
    pub uid: Option<u32>,
    /// Target gid; the current gid when unset.
    pub gid: Option<u32>,
    /// Supplementary groups; the target gid is always appended.
    pub groups: Vec<u32>,
}

/// The container's filesystem description.
#[derive(Debug, Clone)]
pub struct FilesystemSpec {
    /// New root directory; no chroot when unset.
    pub chroot: Option<PathBuf>,
    /// Working directory, resolved under the chroot when one is set.
    pub workdir: PathBuf,
    /// Ordered mounts applied inside the mount namespace.
    pub mount_points: Vec<MountPoint>,
    /// Mounts applied directly under the chroot path in the remount pass.
    pub independent_mount_points: Vec<MountPoint>,
    /// Network-specific files bind-mounted read-only.
    pub network_mount_points: Vec<MountPoint>,
    /// Ownership options merged into mount data.
    pub owner: RootfsOwner,
    /// Root of an lxcfs tree overlaid read-only over `/proc` files.
    pub lxcfs_root: Option<PathBuf>,
}

impl Default for FilesystemSpec {
    fn default() -> Self {
        Self {
            chroot: None,
            workdir: PathBuf::from("/"),
            mount_points: Vec::new(),
            independent_mount_points: Vec::new(),
            network_mount_points: Vec::new(),
            owner: RootfsOwner::default(),
            lxcfs_root: None,
        }
    }
}

/// Validator over the invoking `(real uid, real gid)` pair, guarding a
/// setuid-root install against unauthorized invokers.
pub type UidValidator = Box<dyn Fn(u32, u32) -> bool + Send + Sync>;

/// A fully-resolved container specification plus its run-state.
pub struct ContainerSpec {
    /// Container name; also the hostname when a UTS namespace is used
    /// and the cgroup group name.
    pub name: String,
    /// Project name scoping the exclusive creation lock.
    pub project: String,
    /// Namespace configuration.
    pub namespaces: NamespaceSet,
    /// Filesystem configuration.
    pub filesystem: FilesystemSpec,
    /// Cgroup v1 controller settings.
    pub cgroup: CgroupConfig,
    /// Cgroup v2 unified settings.
    pub cgroup2: Cgroup2Config,
    /// Capability policy for the container process.
    pub capabilities: CapabilityPolicy,
    /// Capability policy for attached processes.
    pub attach_capabilities: CapabilityPolicy,
    /// Seccomp policy loaded before exec.
    pub seccomp: SeccompPolicy,
    /// Ordered resource limits.
    pub rlimits: Vec<RlimitEntry>,
    /// Identity assumed before exec.
    pub guid: Guid,
    /// Init command, environment, and stdio redirections.
    pub command: CommandSpec,
    /// Detach the creation and supervision flow into the background.
    pub daemon: bool,
    /// Path of the container's PID file.
    pub pid_file: PathBuf,
    /// Poll interval of the supervision wait loop.
    pub wait_interval: Duration,
    /// Lifecycle hooks.
    pub hooks: HookTable,
    /// Custom signal handlers for the supervising process.
    pub signal_handlers: SignalTable,
    /// Network bridge collaborator, when networking is enabled.
    pub network: Option<Box<dyn NetworkHandler>>,
    /// Optional validator over the invoking real uid/gid.
    pub uid_validator: Option<UidValidator>,

    /// PID of the container's init process; set exactly once, after fork.
    pub pid: Option<Pid>,
    /// PID of the supervising process, stamped after the ready barrier.
    pub supervisor_pid: Option<Pid>,
    /// Creation timestamp, stamped after the ready barrier.
    pub created_at: Option<DateTime<Utc>>,
    /// Terminal status, stored by the supervision loop.
    pub exit_status: Option<ExitStatus>,
    /// Stringified runtime-level failure, if the flow broke outside the
    /// container itself.
    pub system_error: Option<String>,
    cleaned: bool,
}

impl ContainerSpec {
    /// A spec with the given name and project and default settings.
    #[must_use]
    pub fn new(name: impl Into<String>, project: impl Into<String>) -> Self {
        let name = name.into();
        let pid_file = constants::default_pid_file(&name);
        Self {
            name,
            project: project.into(),
            namespaces: NamespaceSet::default(),
            filesystem: FilesystemSpec::default(),
            cgroup: CgroupConfig::default(),
            cgroup2: Cgroup2Config::default(),
            capabilities: CapabilityPolicy::default(),
            attach_capabilities: CapabilityPolicy::default(),
            seccomp: SeccompPolicy::default(),
            rlimits: Vec::new(),
            guid: Guid::default(),
            command: CommandSpec::default(),
            daemon: false,
            pid_file,
            wait_interval: Duration::from_millis(100),
            hooks: HookTable::default(),
            signal_handlers: SignalTable::default(),
            network: None,
            uid_validator: None,
            pid: None,
            supervisor_pid: None,
            created_at: None,
            exit_status: None,
            system_error: None,
            cleaned: false,
        }
    }

    /// Records the container PID.
    ///
    /// The PID is set exactly once per creation; a second attempt is
    /// logged and ignored, keeping the first value.
    pub fn record_pid(&mut self, pid: Pid) {
        if let Some(existing) = self.pid {
            tracing::warn!(%existing, attempted = %pid, "container pid already recorded");
            return;
        }
        self.pid = Some(pid);
    }

    /// Whether cleanup has already run for this container.
    #[must_use]
    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Flips the cleanup guard, returning whether this call performed
    /// the false-to-true transition.
    pub fn mark_cleaned(&mut self) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;
        true
    }

    /// Runs the configured real-uid validator against the invoking ids.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PermissionDenied`] when the validator
    /// rejects the invoking user.
    pub fn validate_invoker(&self) -> Result<()> {
        if let Some(validator) = &self.uid_validator {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            if !validator(uid, gid) {
                return Err(RuntimeError::PermissionDenied {
                    message: format!("invalid user/group to invoke the runtime: {uid}:{gid}"),
                });
            }
        }
        Ok(())
    }

    /// The container's init PID, resolving through the PID file when it
    /// is not already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be read or no process
    /// with a matching parent is found.
    pub fn resolve_pid(&mut self) -> Result<Pid> {
        if let Some(pid) = self.pid {
            return Ok(pid);
        }
        let pid = pidfile::resolve_container_pid(&self.pid_file).inspect_err(|err| {
            tracing::error!(
                %err,
                pid_file = %self.pid_file.display(),
                "PID detection failed; specify the container PID explicitly"
            );
        })?;
        self.record_pid(pid);
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_is_recorded_at_most_once() {
        let mut spec = ContainerSpec::new("web-1", "web");
        spec.record_pid(Pid::from_raw(100));
        spec.record_pid(Pid::from_raw(200));
        assert_eq!(spec.pid, Some(Pid::from_raw(100)));
    }

    #[test]
    fn cleaned_transitions_false_to_true_exactly_once() {
        let mut spec = ContainerSpec::new("web-1", "web");
        assert!(!spec.is_cleaned());
        assert!(spec.mark_cleaned());
        assert!(spec.is_cleaned());
        assert!(!spec.mark_cleaned());
        assert!(spec.is_cleaned());
    }

    #[test]
    fn default_pid_file_derives_from_name() {
        let spec = ContainerSpec::new("web-1", "web");
        assert_eq!(spec.pid_file, constants::default_pid_file("web-1"));
    }

    #[test]
    fn invoker_validation_consults_the_callback() {
        let mut spec = ContainerSpec::new("web-1", "web");
        spec.validate_invoker().expect("no validator configured");

        spec.uid_validator = Some(Box::new(|_, _| false));
        assert!(spec.validate_invoker().is_err());

        spec.uid_validator = Some(Box::new(|_, _| true));
        spec.validate_invoker().expect("validator accepts");
    }
}
