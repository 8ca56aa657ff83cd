//! Linux namespace management for container isolation.
//!
//! Safe wrappers around `unshare(2)` and `setns(2)`, plus uid/gid map
//! writing and bind-mount persistence of `/proc/<pid>/ns/*` files.
//!
//! PID and user namespaces are deliberately excluded from the bulk
//! unshare/enter operations: the PID namespace must be handled before
//! fork, and the user namespace after the mount and cgroup phases, so
//! both are driven individually by the orchestrator.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sched::CloneFlags;
use nix::unistd::Pid;

use palisade_common::error::{Result, RuntimeError};

use crate::mounts;

/// A kernel namespace type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Mount namespace.
    Mount,
    /// UTS (hostname) namespace.
    Uts,
    /// System V IPC / POSIX message queue namespace.
    Ipc,
    /// Network namespace.
    Network,
    /// PID namespace.
    Pid,
    /// User namespace.
    User,
}

impl Namespace {
    /// Every namespace type this runtime knows about.
    pub const ALL: [Self; 6] = [
        Self::Mount,
        Self::Uts,
        Self::Ipc,
        Self::Network,
        Self::Pid,
        Self::User,
    ];

    /// The `CLONE_*` flag selecting this namespace.
    #[must_use]
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::User => CloneFlags::CLONE_NEWUSER,
        }
    }

    /// The entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Network => "net",
            Self::Pid => "pid",
            Self::User => "user",
        }
    }

    /// Path of this namespace's file for a given process.
    #[must_use]
    pub fn proc_path(self, pid: Pid) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for Namespace {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mount" | "mnt" => Ok(Self::Mount),
            "uts" => Ok(Self::Uts),
            "ipc" => Ok(Self::Ipc),
            "net" | "network" => Ok(Self::Network),
            "pid" => Ok(Self::Pid),
            "user" => Ok(Self::User),
            other => Err(RuntimeError::Config {
                message: format!("unknown namespace type: {other}"),
            }),
        }
    }
}

/// How one namespace participates in a container.
#[derive(Debug, Clone, Default)]
struct NamespaceEntry {
    /// Create a fresh namespace of this type.
    create: bool,
    /// Join an existing namespace via this file instead of creating one.
    enter: Option<PathBuf>,
    /// Bind-mount the child's namespace file here after creation.
    persist: Option<PathBuf>,
}

/// A uid or gid translation range for user-namespace mode.
///
/// Written to `/proc/<pid>/{uid,gid}_map` as `"<min> <offset> <max>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// First id inside the namespace.
    pub min: u32,
    /// First id on the host the range maps onto.
    pub offset: u32,
    /// Number of ids in the range.
    pub max: u32,
}

impl IdMapping {
    /// The single-line map file content for this range.
    #[must_use]
    pub fn map_line(&self) -> String {
        format!("{} {} {}", self.min, self.offset, self.max)
    }
}

/// The full namespace configuration of one container.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSet {
    entries: HashMap<Namespace, NamespaceEntry>,
    /// Uid translation range, when user-namespace id-mapping is requested.
    pub uid_mapping: Option<IdMapping>,
    /// Gid translation range, when user-namespace id-mapping is requested.
    pub gid_mapping: Option<IdMapping>,
}

impl NamespaceSet {
    /// Requests creation of a fresh namespace of the given type.
    pub fn create(&mut self, ns: Namespace) {
        self.entries.entry(ns).or_default().create = true;
    }

    /// Requests joining an existing namespace via its file.
    pub fn enter_via(&mut self, ns: Namespace, path: impl Into<PathBuf>) {
        self.entries.entry(ns).or_default().enter = Some(path.into());
    }

    /// Requests bind-mount persistence of the namespace after creation.
    pub fn persist_at(&mut self, ns: Namespace, path: impl Into<PathBuf>) {
        self.entries.entry(ns).or_default().persist = Some(path.into());
    }

    /// Whether the container uses this namespace at all (fresh or joined).
    #[must_use]
    pub fn requested(&self, ns: Namespace) -> bool {
        self.entries
            .get(&ns)
            .is_some_and(|e| e.create || e.enter.is_some())
    }

    /// Whether a fresh namespace of this type is to be created.
    #[must_use]
    pub fn creates(&self, ns: Namespace) -> bool {
        self.entries.get(&ns).is_some_and(|e| e.create)
    }

    /// The existing-namespace file to join for this type, if configured.
    #[must_use]
    pub fn enter_path(&self, ns: Namespace) -> Option<&Path> {
        self.entries.get(&ns).and_then(|e| e.enter.as_deref())
    }

    /// All `(namespace, destination)` pairs configured for persistence.
    pub fn persist_paths(&self) -> impl Iterator<Item = (Namespace, &Path)> {
        Namespace::ALL.into_iter().filter_map(|ns| {
            self.entries
                .get(&ns)
                .and_then(|e| e.persist.as_deref())
                .map(|p| (ns, p))
        })
    }

    /// Flags for the bulk unshare inside the child.
    ///
    /// Excludes PID (unshared before fork), user (unshared after the
    /// filesystem and cgroup phases), and any namespace joined via an
    /// existing file.
    #[must_use]
    pub fn unshare_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        for (ns, entry) in &self.entries {
            if matches!(ns, Namespace::Pid | Namespace::User) {
                continue;
            }
            if entry.create && entry.enter.is_none() {
                flags |= ns.clone_flag();
            }
        }
        flags
    }

    /// Namespaces to join via `setns` inside the child, excluding PID
    /// and user which are sequenced separately.
    pub fn enter_paths(&self) -> impl Iterator<Item = (Namespace, &Path)> {
        Namespace::ALL
            .into_iter()
            .filter(|ns| !matches!(ns, Namespace::Pid | Namespace::User))
            .filter_map(|ns| self.enter_path(ns).map(|p| (ns, p)))
    }

    /// Whether uid/gid mapping into a fresh user namespace is requested.
    #[must_use]
    pub fn use_id_mapping(&self) -> bool {
        self.uid_mapping.is_some() || self.gid_mapping.is_some()
    }
}

/// Unshares the given set of namespaces for the calling process.
///
/// An empty flag set is a no-op.
///
/// # Errors
///
/// Returns [`RuntimeError::Unsupported`] if the kernel rejects the
/// `unshare(2)` call; this is fatal for the calling child.
pub fn unshare_namespaces(flags: CloneFlags) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    nix::sched::unshare(flags).map_err(|e| RuntimeError::Unsupported {
        what: format!("namespace unshare ({flags:?}): {e}"),
    })?;
    tracing::debug!(?flags, "namespaces unshared");
    Ok(())
}

/// Joins an existing namespace through its filesystem path.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or `setns(2)` fails.
pub fn enter_path(ns: Namespace, path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| RuntimeError::io(path, e))?;
    nix::sched::setns(file.as_fd(), ns.clone_flag()).map_err(|e| RuntimeError::Unsupported {
        what: format!("{ns} namespace entry via {}: {e}", path.display()),
    })?;
    tracing::debug!(namespace = %ns, path = %path.display(), "joined namespace");
    Ok(())
}

/// Joins the namespace of a running process.
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/ns/<type>` cannot be opened or
/// `setns(2)` fails.
pub fn enter_pid(ns: Namespace, pid: Pid) -> Result<()> {
    enter_path(ns, &ns.proc_path(pid))
}

/// Opens a handle to the root PID namespace (`/proc/1/ns/pid`).
///
/// The orchestrator saves this before unsharing a fresh PID namespace so
/// the supervisor can re-enter it after fork.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn open_root_pidns() -> Result<File> {
    let path = Path::new("/proc/1/ns/pid");
    File::open(path).map_err(|e| RuntimeError::io(path, e))
}

/// Re-enters a previously saved namespace handle.
///
/// # Errors
///
/// Returns an error if `setns(2)` fails.
pub fn reenter(ns: Namespace, file: &File) -> Result<()> {
    nix::sched::setns(file.as_fd(), ns.clone_flag())
        .map_err(|e| RuntimeError::kernel("setns", e))?;
    tracing::debug!(namespace = %ns, "re-entered saved namespace");
    Ok(())
}

/// Bind-mounts a child's namespace file to a persistent location.
///
/// The destination file is created when absent; the mount keeps the
/// namespace alive after every member process has exited.
///
/// # Errors
///
/// Returns an error if the destination cannot be created or the bind
/// mount fails.
pub fn persist(pid: Pid, ns: Namespace, dest: &Path) -> Result<()> {
    if !dest.exists() {
        drop(
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(dest)
                .map_err(|e| RuntimeError::io(dest, e))?,
        );
    }
    mounts::bind_mount(&ns.proc_path(pid), dest, false)?;
    tracing::info!(namespace = %ns, path = %dest.display(), "namespace persisted");
    Ok(())
}

/// Writes the configured uid/gid map files for a child process.
///
/// Must be called only after the child has signalled that its user
/// namespace is unshared, and before it assumes an identity inside it.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/uid_map` or
/// `/proc/<pid>/gid_map` fails.
pub fn write_id_maps(pid: Pid, set: &NamespaceSet) -> Result<()> {
    if let Some(m) = &set.uid_mapping {
        let path = PathBuf::from(format!("/proc/{pid}/uid_map"));
        fs::write(&path, m.map_line()).map_err(|e| RuntimeError::io(&path, e))?;
    }
    if let Some(m) = &set.gid_mapping {
        let path = PathBuf::from(format!("/proc/{pid}/gid_map"));
        fs::write(&path, m.map_line()).map_err(|e| RuntimeError::io(&path, e))?;
    }
    tracing::debug!(%pid, "wrote uid/gid maps");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_line_is_space_separated() {
        let m = IdMapping {
            min: 0,
            offset: 100_000,
            max: 65_536,
        };
        assert_eq!(m.map_line(), "0 100000 65536");
    }

    #[test]
    fn unshare_flags_exclude_pid_and_user() {
        let mut set = NamespaceSet::default();
        set.create(Namespace::Mount);
        set.create(Namespace::Uts);
        set.create(Namespace::Pid);
        set.create(Namespace::User);

        let flags = set.unshare_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn entering_overrides_creation_in_unshare_flags() {
        let mut set = NamespaceSet::default();
        set.create(Namespace::Network);
        set.enter_via(Namespace::Network, "/run/netns/bridge0");

        assert!(set.unshare_flags().is_empty());
        assert!(set.requested(Namespace::Network));
        let joined: Vec<_> = set.enter_paths().collect();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].0, Namespace::Network);
    }

    #[test]
    fn id_mapping_flag_reflects_either_range() {
        let mut set = NamespaceSet::default();
        assert!(!set.use_id_mapping());
        set.gid_mapping = Some(IdMapping {
            min: 0,
            offset: 100_000,
            max: 65_536,
        });
        assert!(set.use_id_mapping());
    }

    #[test]
    fn namespace_parsing_accepts_short_names() {
        assert_eq!("mnt".parse::<Namespace>().ok(), Some(Namespace::Mount));
        assert_eq!("net".parse::<Namespace>().ok(), Some(Namespace::Network));
        assert!("foo".parse::<Namespace>().is_err());
    }

    #[test]
    fn proc_path_uses_kernel_entry_name() {
        let path = Namespace::Mount.proc_path(Pid::from_raw(42));
        assert_eq!(path, PathBuf::from("/proc/42/ns/mnt"));
    }
}
