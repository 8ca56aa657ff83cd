//! Kill: signal a running container and await its teardown.
//!
//! Delivers the requested signal to the resolved container PID. A
//! negative timeout means fire-and-forget. Otherwise the operator polls
//! the container's PID-file lock every 100 ms for up to the timeout in
//! seconds; exhausting the budget is a hard stop — the invoking process
//! exits non-zero, since no further corrective action exists at this
//! layer.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use palisade_common::constants;
use palisade_common::error::{Result, RuntimeError};

use crate::pidfile;
use crate::spec::ContainerSpec;

/// Interval between lock-release probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals the container and, unless `timeout_secs` is negative, waits
/// for its PID-file lock to be released.
///
/// # Errors
///
/// Returns an error if the container PID cannot be resolved or the
/// signal cannot be delivered. Timeout exhaustion does not return: the
/// process exits with status 1.
pub fn kill(spec: &mut ContainerSpec, signal: Signal, timeout_secs: i64) -> Result<()> {
    let pid = spec.resolve_pid()?;

    nix::sys::signal::kill(pid, signal).map_err(|e| RuntimeError::kernel("kill", e))?;

    if timeout_secs < 0 {
        tracing::info!(%pid, %signal, "signal sent");
        return Ok(());
    }

    let budget = Duration::from_secs(timeout_secs.unsigned_abs());
    let pid_file = spec.pid_file.clone();
    if await_release(budget, POLL_INTERVAL, || !pidfile::locked(&pid_file)) {
        tracing::info!(%pid, "kill success");
        return Ok(());
    }

    tracing::warn!(
        %pid,
        timeout_secs,
        "kill seems to have failed within the timeout; check the container process"
    );
    std::process::exit(constants::KILL_TIMEOUT_STATUS);
}

/// Polls `released` at the given interval until it reports true or the
/// budget is exhausted, with a final probe at the deadline.
pub(crate) fn await_release(
    budget: Duration,
    interval: Duration,
    released: impl Fn() -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < budget {
        if released() {
            return true;
        }
        std::thread::sleep(interval);
    }
    released()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn release_before_the_deadline_returns_early() {
        let polls = AtomicUsize::new(0);
        let start = Instant::now();
        let released = await_release(Duration::from_secs(5), Duration::from_millis(1), || {
            polls.fetch_add(1, Ordering::SeqCst) >= 2
        });
        assert!(released);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn exhausted_budget_reports_failure() {
        let released = await_release(Duration::from_millis(30), Duration::from_millis(5), || {
            false
        });
        assert!(!released);
    }

    #[test]
    fn zero_budget_still_probes_once() {
        let released = await_release(Duration::ZERO, Duration::from_millis(1), || true);
        assert!(released);
    }
}
