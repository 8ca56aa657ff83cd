//! Daemonization and the project lock manager.
//!
//! Container creation is serialized per project through an exclusive
//! lock file. In foreground mode the whole creation and supervision
//! flow runs synchronously while holding the lock; in daemon mode a
//! detached process acquires it, runs the flow, and reports the
//! spawned supervisor PIDs back to the foreground process through a
//! dedicated pipe before it returns to its caller.

use std::fs::File;
use std::io::{Read, Write};

use nix::unistd::{ForkResult, Pid, fork};

use palisade_common::constants;
use palisade_common::error::{Result, RuntimeError};
use palisade_core::privilege;

use crate::create::reopen_fd;
use crate::hooks::{self, HookPoint};
use crate::lockfile::LockFile;
use crate::spec::ContainerSpec;
use crate::supervise;
use crate::sync;

/// Boots a project's containers under the project lock.
///
/// `spawn` forks one supervisor per container and returns their PIDs;
/// this function then supervises the set until it drains. With
/// `spec.daemon` set the whole flow detaches into the background and
/// the caller only learns the resulting PIDs.
///
/// # Errors
///
/// Returns an error if the lock cannot be acquired, the detach fork
/// fails, or the supervision flow breaks.
pub fn boot<F>(spec: &mut ContainerSpec, spawn: F) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    if spec.daemon {
        boot_daemonized(spec, spawn)
    } else {
        boot_foreground(spec, spawn)
    }
}

fn boot_foreground<F>(spec: &mut ContainerSpec, spawn: F) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    let lock = LockFile::acquire(constants::lock_path(&spec.project))?;
    tracing::info!(path = %lock.path().display(), "project lock created");

    let result = run_supervisors(spec, spawn, None);

    if let Err(err) = lock.release() {
        tracing::warn!(%err, "project lock release failed");
    }
    result
}

fn boot_daemonized<F>(spec: &mut ContainerSpec, spawn: F) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    let (mut reader, writer) = sync::pipe_pair()?;

    // SAFETY: single-threaded around fork; the child becomes the
    // detached lock holder and exits when the flow completes.
    match unsafe { fork() }.map_err(|e| RuntimeError::kernel("fork", e))? {
        ForkResult::Child => {
            drop(reader);
            let code = match daemon_supervisor(spec, spawn, writer) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(%err, "daemonized flow failed");
                    1
                }
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(writer);
            let mut reported = String::new();
            let _ = reader
                .read_to_string(&mut reported)
                .map_err(|e| RuntimeError::Sync {
                    message: format!("supervisor pid report failed: {e}"),
                })?;

            if reported.is_empty() {
                tracing::warn!("container cluster cannot be booted, check the daemon logs");
            } else {
                tracing::info!(
                    supervisors = %reported,
                    root = %child,
                    "container cluster successfully up"
                );
            }
            Ok(())
        }
    }
}

/// Body of the detached lock holder: acquire the lock, detach stdio,
/// run the flow, release on every exit path.
fn daemon_supervisor<F>(spec: &mut ContainerSpec, spawn: F, report: File) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    let lock = LockFile::acquire(constants::lock_path(&spec.project))?;
    detach_stdio()?;
    tracing::info!(path = %lock.path().display(), "daemonized, lock created");

    let result = run_supervisors(spec, spawn, Some(report));

    if let Err(err) = lock.release() {
        tracing::warn!(%err, "project lock release failed");
    }
    result
}

/// Spawns the supervisors, reports their PIDs when requested, and
/// supervises the set until it drains. A failure anywhere is stored on
/// the spec and reported through the `system_failure` hook before it
/// propagates.
fn run_supervisors<F>(spec: &mut ContainerSpec, spawn: F, report: Option<File>) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    let outcome = supervise_flow(spec, spawn, report);
    if let Err(err) = &outcome {
        spec.system_error = Some(err.to_string());
        hooks::invoke(spec, HookPoint::SystemFailure);
    }
    outcome
}

fn supervise_flow<F>(spec: &mut ContainerSpec, spawn: F, report: Option<File>) -> Result<()>
where
    F: FnOnce(&mut ContainerSpec) -> Result<Vec<Pid>>,
{
    hooks::invoke(spec, HookPoint::Setup);
    let pids = spawn(spec)?;

    if let Some(mut writer) = report {
        let list = pids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        writer.write_all(list.as_bytes()).map_err(|e| RuntimeError::Sync {
            message: format!("supervisor pid report failed: {e}"),
        })?;
        drop(writer);
    }

    privilege::drop_effective()?;
    supervise::supervise_all(spec, pids)
}

/// Reopens the detached process's stdio onto the null device.
fn detach_stdio() -> Result<()> {
    let null_in = File::open(constants::DEV_NULL)
        .map_err(|e| RuntimeError::io(constants::DEV_NULL, e))?;
    let null_out = File::options()
        .append(true)
        .open(constants::DEV_NULL)
        .map_err(|e| RuntimeError::io(constants::DEV_NULL, e))?;
    reopen_fd(&null_in, libc::STDIN_FILENO)?;
    reopen_fd(&null_out, libc::STDOUT_FILENO)?;
    reopen_fd(&null_out, libc::STDERR_FILENO)?;
    Ok(())
}
