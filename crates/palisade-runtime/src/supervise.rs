//! Supervision of running containers.
//!
//! The supervisor blocks on the container's exit at a configured poll
//! interval, dispatching custom signal handlers and forwarding
//! termination signals to the child in between. After the exit it
//! drives the teardown state machine: store the status, fire
//! `teardown_container` (always) and `after_failure` (on non-success),
//! run the idempotency-guarded cleanup, and best-effort network
//! teardown.

use std::thread;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use signal_hook::iterator::Signals;

use palisade_common::error::{Result, RuntimeError};
use palisade_common::types::ExitStatus;
use palisade_core::{cgroup, privilege};

use crate::hooks::{self, HookPoint};
use crate::pidfile::PidFile;
use crate::spec::ContainerSpec;

/// Signals the wait loop always watches and forwards to the container.
const FORWARDED_SIGNALS: [i32; 2] = [libc::SIGTERM, libc::SIGINT];

/// The supervision wait loop.
///
/// Polls for the child's exit, draining pending signals between polls:
/// a signal with a registered custom handler runs it, any other watched
/// signal is forwarded to the container.
#[derive(Debug)]
pub struct WaitLoop {
    interval: Duration,
}

impl WaitLoop {
    /// A wait loop with the given poll interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Blocks until the given child exits, returning its PID and
    /// terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if signal registration or `waitpid(2)` fails.
    pub fn run_and_wait(&self, spec: &ContainerSpec, pid: Pid) -> Result<(Pid, ExitStatus)> {
        let mut watched: Vec<i32> = FORWARDED_SIGNALS.to_vec();
        for signal in spec.signal_handlers.signals() {
            if !watched.contains(&signal) {
                watched.push(signal);
            }
        }
        let mut signals =
            Signals::new(&watched).map_err(|e| RuntimeError::kernel("signal registration", e))?;

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG))
                .map_err(|e| RuntimeError::kernel("waitpid", e))?
            {
                WaitStatus::StillAlive => {
                    for signal in signals.pending() {
                        self.dispatch_signal(spec, pid, signal);
                    }
                    thread::sleep(self.interval);
                }
                WaitStatus::Exited(pid, code) => return Ok((pid, ExitStatus::Exited(code))),
                WaitStatus::Signaled(pid, signal, _) => {
                    return Ok((pid, ExitStatus::Signaled(signal as i32)));
                }
                // Stopped/continued children are not terminal.
                _ => thread::sleep(self.interval),
            }
        }
    }

    fn dispatch_signal(&self, spec: &ContainerSpec, pid: Pid, signal: i32) {
        if let Some(handler) = spec.signal_handlers.get(signal) {
            if let Err(err) = handler(spec, pid) {
                tracing::warn!(signal, %err, "custom signal handler failed, skipped");
            }
            return;
        }
        match Signal::try_from(signal) {
            Ok(sig) => {
                tracing::info!(signal, %pid, "forwarding signal to container");
                if let Err(err) = kill(pid, sig) {
                    tracing::warn!(signal, %err, "signal forwarding failed");
                }
            }
            Err(err) => tracing::warn!(signal, %err, "unknown signal ignored"),
        }
    }
}

/// Supervises one container from "running" to terminal state.
///
/// # Errors
///
/// Returns an error if the wait loop itself breaks; a failing container
/// is not an error, it is reported through `exit_status` and hooks.
pub fn supervise(
    spec: &mut ContainerSpec,
    pid: Pid,
    mut pid_file: Option<PidFile>,
) -> Result<ExitStatus> {
    let waitloop = WaitLoop::new(spec.wait_interval);

    hooks::invoke(spec, HookPoint::BeforeStartWait);
    let (_pid, status) = waitloop.run_and_wait(spec, pid)?;

    spec.exit_status = Some(status);
    hooks::invoke(spec, HookPoint::TeardownContainer);
    if !status.success() {
        hooks::invoke(spec, HookPoint::AfterFailure);
    }

    cleanup(spec, pid_file.as_mut());

    if let Some(network) = &spec.network {
        if let Err(err) = network.cleanup() {
            tracing::warn!(%err, "network cleanup failed, skip on quit");
        }
    }

    if status.success() {
        tracing::info!(%status, "container successfully exited");
    } else {
        tracing::warn!(%status, "container failed");
    }

    if let Some(file) = pid_file.as_mut() {
        tracing::info!(path = %file.path().display(), "removing pid file");
        if let Err(err) = file.remove() {
            tracing::warn!(%err, "pid file removal failed");
        }
    }
    Ok(status)
}

/// Deletes the container's cgroups and releases the PID-file lock,
/// under a scoped effective-privilege elevation.
///
/// Guarded by the spec's `cleaned` flag: a second call is a no-op, so
/// cgroup resources are never double-deleted.
pub fn cleanup(spec: &mut ContainerSpec, pid_file: Option<&mut PidFile>) {
    if spec.is_cleaned() {
        return;
    }

    {
        let _elevated = privilege::Elevated::acquire();
        if let Err(err) = cgroup::v1::delete_all(&spec.name, &spec.cgroup) {
            tracing::warn!(%err, "cgroup v1 cleanup failed");
        }
        if !spec.cgroup2.is_empty() {
            if let Err(err) = cgroup::v2::CgroupV2::new(&spec.name).delete() {
                tracing::warn!(%err, "cgroup v2 cleanup failed");
            }
        }
        if let Some(file) = pid_file {
            if let Err(err) = file.unlock() {
                tracing::warn!(%err, "pid file unlock failed");
            }
        }
    }

    let _ = spec.mark_cleaned();
}

/// Supervises a set of supervisor PIDs, the multi-container daemon
/// form: wait for any child, drop it from the pending set, fire
/// `system_failure` for failed supervisors, and fire `teardown` once
/// when the set drains.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails unexpectedly.
pub fn supervise_all(spec: &mut ContainerSpec, mut pending: Vec<Pid>) -> Result<()> {
    while !pending.is_empty() {
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) => Some((pid, ExitStatus::Exited(code))),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                Some((pid, ExitStatus::Signaled(signal as i32)))
            }
            Ok(_) => None,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(err) => return Err(RuntimeError::kernel("waitpid", err)),
        };
        let Some((pid, status)) = status else {
            continue;
        };

        pending.retain(|p| *p != pid);
        if status.success() {
            tracing::info!(%pid, %status, "one of the supervisors finished");
        } else {
            tracing::warn!(%pid, %status, "one of the supervisors failed");
            spec.exit_status = Some(status);
            hooks::invoke(spec, HookPoint::SystemFailure);
        }
    }

    hooks::invoke(spec, HookPoint::Teardown);
    Ok(())
}

/// Blocks until the given child terminates, without signal dispatch.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails.
pub(crate) fn wait_exit(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, None).map_err(|e| RuntimeError::kernel("waitpid", e))? {
            WaitStatus::Exited(_, code) => return Ok(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => return Ok(ExitStatus::Signaled(signal as i32)),
            _ => {}
        }
    }
}
