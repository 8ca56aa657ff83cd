//! Container creation: fork orchestration and the child-side isolation
//! pipeline.
//!
//! The parent and child coordinate through one-shot pipe barriers with
//! strict ordering: when id-mapping is requested the child signals
//! "unshared" after unsharing its user namespace, the parent writes the
//! uid/gid maps and signals "mapped", and only then does the child
//! assume root inside the new namespace. The "ready" barrier is the
//! terminal creation gate the parent blocks on before supervising.
//!
//! Any child-side failure is confined to the child: it is logged and
//! the child exits with the reserved status 127, which the parent
//! observes through the supervision loop.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::Utc;
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork};

use palisade_common::constants;
use palisade_common::error::{Result, RuntimeError};
use palisade_common::types::ExitStatus;
use palisade_core::namespace::{self, Namespace};
use palisade_core::{capability, cgroup, mounts, privilege, rlimit, seccomp};

use crate::hooks::{self, HookPoint};
use crate::network::NetworkHandler;
use crate::pidfile::{self, PidFile};
use crate::spec::{CommandSpec, ContainerSpec, Guid};
use crate::supervise;
use crate::sync::Barrier;

/// Virtual `/proc` files overlaid from an lxcfs tree.
const LXCFS_PROC_FILES: [&str; 6] = [
    "/proc/cpuinfo",
    "/proc/diskstats",
    "/proc/meminfo",
    "/proc/stat",
    "/proc/swaps",
    "/proc/uptime",
];

/// The per-creation synchronization channels.
struct CreationBarriers {
    /// Child signals "isolation complete, about to exec".
    ready: Barrier,
    /// Child signals "user namespace unshared"; present only with
    /// id-mapping.
    unshared: Option<Barrier>,
    /// Parent signals "id maps written"; present only with id-mapping.
    mapped: Option<Barrier>,
}

impl CreationBarriers {
    fn new(id_mapping: bool) -> Result<Self> {
        Ok(Self {
            ready: Barrier::new()?,
            unshared: if id_mapping {
                Some(Barrier::new()?)
            } else {
                None
            },
            mapped: if id_mapping {
                Some(Barrier::new()?)
            } else {
                None
            },
        })
    }
}

/// Forks a supervisor process that runs the whole creation and
/// supervision flow for one container, returning its PID to the caller.
///
/// The supervisor exits 0 when the flow completes (even for a container
/// that itself failed — that outcome is reported through hooks) and 1
/// when the flow breaks.
///
/// # Errors
///
/// Returns an error if the fork fails.
pub fn spawn_supervisor(spec: &mut ContainerSpec) -> Result<Pid> {
    // SAFETY: the runtime is single-threaded around fork; the child
    // replaces its control flow entirely and exits below.
    match unsafe { fork() }.map_err(|e| RuntimeError::kernel("fork", e))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = match run_container(spec) {
                Ok(_) => 0,
                Err(err) => {
                    tracing::error!(%err, "supervisor flow failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

/// Creates and supervises one container: fork, drive the barrier
/// protocol, then block until the container exits and tear down.
///
/// # Errors
///
/// Returns an error for parent-side failures (lock, fork, barrier, or
/// persistence problems). Child-side failures never surface here; they
/// arrive as the container's exit status instead.
pub fn run_container(spec: &mut ContainerSpec) -> Result<ExitStatus> {
    spec.validate_invoker()?;
    pidfile::confirm_absent(&spec.pid_file, &spec.name)?;
    let pid_file = match PidFile::create(&spec.pid_file) {
        Ok(file) => Some(file),
        Err(err) => {
            tracing::error!(%err, "pid file creation failed");
            None
        }
    };

    hooks::invoke(spec, HookPoint::BeforeFork);

    let init_pidns = if spec.namespaces.creates(Namespace::Pid) {
        match namespace::open_root_pidns() {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!(
                    %err,
                    "failed to open the original PID namespace file; later re-entry is disabled"
                );
                None
            }
        }
    } else {
        None
    };

    jail_pid(spec)?;

    let mut barriers = CreationBarriers::new(spec.namespaces.use_id_mapping())?;

    // SAFETY: the runtime is single-threaded around fork; the child
    // runs the isolation pipeline and either execs or exits.
    match unsafe { fork() }.map_err(|e| RuntimeError::kernel("fork", e))? {
        ForkResult::Child => {
            let err = match child_main(spec, &mut barriers) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            tracing::error!(%err, "container setup failed before exec");
            std::process::exit(constants::SETUP_FAILED_STATUS);
        }
        ForkResult::Parent { child } => {
            parent_main(spec, child, &mut barriers, init_pidns.as_ref())?;
            tracing::info!(pid = %child, "container fork success, going to wait");
            supervise::supervise(spec, child, pid_file)
        }
    }
}

/// Parent side of the creation protocol, up to the ready barrier.
fn parent_main(
    spec: &mut ContainerSpec,
    child: Pid,
    barriers: &mut CreationBarriers,
    init_pidns: Option<&File>,
) -> Result<()> {
    if let Some(handle) = init_pidns {
        if let Err(err) = namespace::reenter(Namespace::Pid, handle) {
            tracing::warn!(%err, "could not re-enter the original PID namespace");
        }
    }
    spec.record_pid(child);

    if spec.namespaces.use_id_mapping() {
        tracing::info!("using uid/gid mapping in this container");
        if let Some(unshared) = barriers.unshared.as_mut() {
            unshared.wait()?;
        }
        namespace::write_id_maps(child, &spec.namespaces)?;
        tracing::info!("id-map setup complete");
        if let Some(mapped) = barriers.mapped.as_mut() {
            mapped.signal()?;
        }
    }

    barriers.ready.wait()?;

    for (ns, path) in spec.namespaces.persist_paths() {
        namespace::persist(child, ns, path)?;
    }

    spec.created_at = Some(Utc::now());
    spec.supervisor_pid = Some(nix::unistd::getpid());
    privilege::drop_effective()?;
    Ok(())
}

/// Child side: isolation pipeline, ready signal, exec. Never returns on
/// success.
fn child_main(spec: &ContainerSpec, barriers: &mut CreationBarriers) -> Result<Infallible> {
    hooks::invoke(spec, HookPoint::AfterFork);

    if spec.daemon {
        let _ = nix::unistd::setsid().map_err(|e| RuntimeError::kernel("setsid", e))?;
    }

    if let Some(network) = &spec.network {
        if let Err(err) = bring_up_network(network.as_ref()) {
            tracing::error!(%err, "network bring-up failed");
        }
    }

    isolate(spec, barriers)?;

    barriers.ready.signal()?;
    tracing::debug!("parent kicked to resume");

    tracing::info!(command = ?spec.command.argv, "container is going to exec");
    exec_command(&spec.command.argv, &spec.command.env)
}

/// The ordered isolation pipeline applied inside the child before exec.
fn isolate(spec: &ContainerSpec, barriers: &mut CreationBarriers) -> Result<()> {
    namespace::unshare_namespaces(spec.namespaces.unshare_flags())?;
    for (ns, path) in spec.namespaces.enter_paths() {
        namespace::enter_path(ns, path)?;
    }
    tracing::debug!("namespaces applied");

    apply_filesystem(spec)?;
    tracing::debug!("filesystem applied");

    rlimit::apply(&spec.rlimits)?;
    tracing::debug!("resource limits applied");

    let self_pid = nix::unistd::getpid();
    cgroup::v1::apply_all(&spec.name, &spec.cgroup, self_pid)?;
    cgroup::v2::apply_all(&spec.name, &spec.cgroup2, self_pid)?;
    tracing::debug!("cgroups applied");

    apply_remount(spec)?;
    tracing::debug!("remount pass applied");

    if spec.namespaces.requested(Namespace::Uts) {
        nix::unistd::sethostname(&spec.name).map_err(|e| RuntimeError::kernel("sethostname", e))?;
    }

    apply_user_namespace(spec, barriers)?;
    tracing::debug!("user namespace applied");

    hooks::invoke(spec, HookPoint::BeforeChroot);
    do_chroot(spec)?;
    tracing::debug!("chroot applied");
    hooks::invoke(spec, HookPoint::AfterChroot);

    if spec.daemon {
        reopen_stdio(&spec.command)?;
    }

    capability::apply(&spec.capabilities);
    tracing::debug!("capabilities applied");

    seccomp::apply(&spec.seccomp)?;
    tracing::debug!("seccomp applied");

    switch_guid(&spec.guid)?;
    tracing::debug!("identity switched");
    Ok(())
}

/// Handles the PID namespace before fork: unshare a fresh one, or join
/// an existing one, so the forked child lands inside it.
fn jail_pid(spec: &ContainerSpec) -> Result<()> {
    if spec.namespaces.creates(Namespace::Pid) {
        namespace::unshare_namespaces(Namespace::Pid.clone_flag())?;
    } else if let Some(path) = spec.namespaces.enter_path(Namespace::Pid) {
        namespace::enter_path(Namespace::Pid, path)?;
    }
    Ok(())
}

fn bring_up_network(handler: &dyn NetworkHandler) -> Result<()> {
    handler.generate()?;
    let ns_file = handler.to_ns_file()?;
    namespace::enter_path(Namespace::Network, &ns_file)
}

fn apply_filesystem(spec: &ContainerSpec) -> Result<()> {
    let fs_spec = &spec.filesystem;
    let cwd = std::env::current_dir().map_err(|e| RuntimeError::io(".", e))?;

    if spec.namespaces.requested(Namespace::Mount) {
        mounts::make_private(Path::new("/"))?;
    }

    for mp in &fs_spec.mount_points {
        tracing::debug!(dest = %mp.dest.display(), "mounting");
        mounts::apply_mount_point(mp, &fs_spec.owner, &cwd)?;
    }

    for mp in &fs_spec.network_mount_points {
        if !mp.dest.exists() {
            drop(File::create(&mp.dest).map_err(|e| RuntimeError::io(&mp.dest, e))?);
        }
        mounts::bind_mount(&mp.normalized_src(&cwd), &mp.dest, true)?;
    }
    Ok(())
}

/// Mounts the independent mount points directly under the chroot path,
/// then overlays lxcfs `/proc` files read-only when configured.
fn apply_remount(spec: &ContainerSpec) -> Result<()> {
    let fs_spec = &spec.filesystem;
    let root = fs_spec.chroot.as_deref().unwrap_or_else(|| Path::new("/"));

    for mp in &fs_spec.independent_mount_points {
        let dest = join_under(root, &mp.dest);
        match mp.fstype.as_deref() {
            // tmpfs and devpts accept ownership at mount time.
            Some(fstype @ ("tmpfs" | "devpts")) => {
                let data =
                    mounts::merge_data(fs_spec.owner.to_data().as_deref(), mp.data.as_deref());
                mounts::mount_fs(&mp.src, &dest, fstype, data.as_deref())?;
            }
            Some(fstype) => mounts::mount_fs(&mp.src, &dest, fstype, mp.data.as_deref())?,
            None => mounts::bind_mount(&mp.src, &dest, mp.readonly)?,
        }
    }

    if let Some(lxcfs_root) = &fs_spec.lxcfs_root {
        for procfile in LXCFS_PROC_FILES {
            let src = join_under(lxcfs_root, Path::new(procfile));
            let dest = join_under(root, Path::new(procfile));
            mounts::bind_mount(&src, &dest, true)?;
        }
    }
    Ok(())
}

fn apply_user_namespace(spec: &ContainerSpec, barriers: &mut CreationBarriers) -> Result<()> {
    let set = &spec.namespaces;

    if set.creates(Namespace::User) {
        namespace::unshare_namespaces(Namespace::User.clone_flag())?;
    }
    if let Some(path) = set.enter_path(Namespace::User) {
        namespace::enter_path(Namespace::User, path)?;
    }

    if set.use_id_mapping() {
        if let Some(unshared) = barriers.unshared.as_mut() {
            unshared.signal()?;
        }
        if let Some(mapped) = barriers.mapped.as_mut() {
            mapped.wait()?;
        }
        become_namespace_root()?;
    }
    Ok(())
}

/// Changes into the working directory and chroots when a root path is
/// configured.
pub(crate) fn do_chroot(spec: &ContainerSpec) -> Result<()> {
    let fs_spec = &spec.filesystem;
    match &fs_spec.chroot {
        Some(root) => {
            let workdir = join_under(root, &fs_spec.workdir);
            nix::unistd::chdir(&workdir).map_err(|e| RuntimeError::kernel("chdir", e))?;
            nix::unistd::chroot(root).map_err(|e| RuntimeError::kernel("chroot", e))?;
        }
        None => {
            nix::unistd::chdir(&fs_spec.workdir).map_err(|e| RuntimeError::kernel("chdir", e))?;
        }
    }
    Ok(())
}

/// Assumes root identity inside a freshly mapped user namespace. This
/// is distinct from the final guid switch, which runs later.
pub(crate) fn become_namespace_root() -> Result<()> {
    nix::unistd::setgid(Gid::from_raw(0)).map_err(|e| RuntimeError::kernel("setgid", e))?;
    nix::unistd::setuid(Uid::from_raw(0)).map_err(|e| RuntimeError::kernel("setuid", e))?;
    Ok(())
}

/// Final identity switch before exec: group first while still
/// privileged, supplementary groups including the target gid, then the
/// irreversible uid switch last.
pub(crate) fn switch_guid(guid: &Guid) -> Result<()> {
    if guid.uid.is_none() && guid.gid.is_none() && guid.groups.is_empty() {
        return Ok(());
    }
    let gid = Gid::from_raw(guid.gid.unwrap_or_else(|| nix::unistd::getgid().as_raw()));
    let uid = Uid::from_raw(guid.uid.unwrap_or_else(|| nix::unistd::getuid().as_raw()));

    nix::unistd::setgid(gid).map_err(|e| RuntimeError::kernel("setgid", e))?;
    let mut groups: Vec<Gid> = guid.groups.iter().map(|g| Gid::from_raw(*g)).collect();
    groups.push(gid);
    nix::unistd::setgroups(&groups).map_err(|e| RuntimeError::kernel("setgroups", e))?;
    nix::unistd::setuid(uid).map_err(|e| RuntimeError::kernel("setuid", e))?;
    Ok(())
}

/// Reopens the child's stdio onto the command's configured redirections
/// (the null device by default) in daemon mode.
fn reopen_stdio(command: &CommandSpec) -> Result<()> {
    let stdin = open_redirect(command.stdin.as_deref(), false)?;
    let stdout = open_redirect(command.stdout.as_deref(), true)?;
    let stderr = open_redirect(command.stderr.as_deref(), true)?;
    reopen_fd(&stdin, libc::STDIN_FILENO)?;
    reopen_fd(&stdout, libc::STDOUT_FILENO)?;
    reopen_fd(&stderr, libc::STDERR_FILENO)?;
    Ok(())
}

fn open_redirect(path: Option<&Path>, append: bool) -> Result<File> {
    let path = path.unwrap_or_else(|| Path::new(constants::DEV_NULL));
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::open(path)
    };
    file.map_err(|e| RuntimeError::io(path, e))
}

/// Duplicates a file onto one of the stdio descriptors.
pub(crate) fn reopen_fd(file: &File, target: libc::c_int) -> Result<()> {
    // SAFETY: both descriptors are open; dup2 atomically replaces the
    // target.
    let ret = unsafe { libc::dup2(file.as_raw_fd(), target) };
    if ret < 0 {
        return Err(RuntimeError::kernel(
            "dup2",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Replaces the process image with the init command.
pub(crate) fn exec_command(argv: &[String], env: &[(String, String)]) -> Result<Infallible> {
    let program = argv.first().ok_or_else(|| RuntimeError::Config {
        message: "empty init command".into(),
    })?;
    let program = CString::new(program.as_str()).map_err(|_| RuntimeError::Config {
        message: format!("init command contains a NUL byte: {program:?}"),
    })?;
    let args = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| RuntimeError::Config {
            message: "init argument contains a NUL byte".into(),
        })?;
    let env = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| RuntimeError::Config {
            message: "environment entry contains a NUL byte".into(),
        })?;

    nix::unistd::execve(&program, &args, &env).map_err(|e| RuntimeError::kernel("execve", e))
}

fn join_under(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_under_keeps_absolute_paths_inside_the_root() {
        assert_eq!(
            join_under(Path::new("/srv/root"), Path::new("/proc/stat")),
            PathBuf::from("/srv/root/proc/stat")
        );
        assert_eq!(
            join_under(Path::new("/srv/root"), Path::new("app")),
            PathBuf::from("/srv/root/app")
        );
    }

    #[test]
    fn default_guid_switch_is_a_noop() {
        // No identity change requested: must succeed unprivileged.
        switch_guid(&Guid::default()).expect("no-op switch");
    }

    #[test]
    fn exec_rejects_an_empty_command() {
        let err = exec_command(&[], &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }
}
