//! Attach: run a command inside an already-running container.
//!
//! Resolves the container's init PID, forks a process that joins the
//! container's namespaces and cgroups, chroots, drops to the
//! attach-specific capability set and target identity, and execs. The
//! caller blocks on the attached process and reports its outcome.

use std::convert::Infallible;

use nix::unistd::{ForkResult, fork};

use palisade_common::constants;
use palisade_common::error::{Result, RuntimeError};
use palisade_common::types::ExitStatus;
use palisade_core::namespace::{self, Namespace};
use palisade_core::{capability, cgroup};

use crate::create;
use crate::spec::ContainerSpec;
use crate::supervise;

/// Shell used when no attach command is given.
const DEFAULT_COMMAND: &str = "/bin/bash";

/// Attaches a command (a shell by default) to the running container.
///
/// # Errors
///
/// Returns an error if the container PID cannot be resolved or the
/// fork fails. A failing attached command is reported through the
/// returned status, not as an error.
pub fn attach(spec: &mut ContainerSpec, command: &[String]) -> Result<ExitStatus> {
    let target = spec.resolve_pid()?;
    let argv: Vec<String> = if command.is_empty() {
        vec![DEFAULT_COMMAND.to_owned()]
    } else {
        command.to_vec()
    };

    // Enter the PID namespace before fork so the attached process lands
    // in the container's process tree.
    if spec.namespaces.creates(Namespace::Pid) {
        namespace::enter_pid(Namespace::Pid, target)?;
    }

    // SAFETY: single-threaded around fork; the child execs or exits.
    match unsafe { fork() }.map_err(|e| RuntimeError::kernel("fork", e))? {
        ForkResult::Child => {
            let err = match attach_child(spec, target, &argv) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            tracing::error!(%err, "attach setup failed before exec");
            std::process::exit(constants::SETUP_FAILED_STATUS);
        }
        ForkResult::Parent { child } => {
            tracing::info!(pid = %child, "attach process fork success");
            let status = supervise::wait_exit(child)?;
            if status.success() {
                tracing::info!(%status, "attached process successfully exited");
            } else {
                tracing::warn!(%status, "attached process failed");
            }
            Ok(status)
        }
    }
}

fn attach_child(
    spec: &ContainerSpec,
    target: nix::unistd::Pid,
    argv: &[String],
) -> Result<Infallible> {
    if let Some(network) = &spec.network {
        let ns_file = network.to_ns_file()?;
        namespace::enter_path(Namespace::Network, &ns_file)?;
    }

    for ns in [
        Namespace::Mount,
        Namespace::Uts,
        Namespace::Ipc,
        Namespace::Network,
    ] {
        if spec.namespaces.requested(ns) {
            namespace::enter_pid(ns, target)?;
        }
    }
    if spec.namespaces.requested(Namespace::User) {
        namespace::enter_pid(Namespace::User, target)?;
    }

    let self_pid = nix::unistd::getpid();
    cgroup::v1::apply_all(&spec.name, &spec.cgroup, self_pid)?;
    cgroup::v2::apply_all(&spec.name, &spec.cgroup2, self_pid)?;

    create::do_chroot(spec)?;

    if spec.namespaces.use_id_mapping() {
        create::become_namespace_root()?;
    }
    capability::apply(&spec.attach_capabilities);
    create::switch_guid(&spec.guid)?;

    tracing::info!(command = ?argv, "attach process is going to exec");
    create::exec_command(argv, &spec.command.env)
}
