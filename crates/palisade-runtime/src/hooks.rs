//! Lifecycle hookpoints and custom signal handlers.
//!
//! Hooks are operator-supplied callbacks attached to fixed points of
//! the container lifecycle. A failing hook is logged and skipped; hooks
//! never abort the runtime.

use std::collections::HashMap;
use std::fmt;

use nix::unistd::Pid;

use palisade_common::error::Result;

use crate::spec::ContainerSpec;

/// The fixed lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before any supervisor is spawned, while the project lock is held.
    Setup,
    /// In the supervisor, before the container child is forked.
    BeforeFork,
    /// First thing inside the forked child.
    AfterFork,
    /// In the child, after isolation but before chroot.
    BeforeChroot,
    /// In the child, immediately after chroot.
    AfterChroot,
    /// In the supervisor, before blocking on the container's exit.
    BeforeStartWait,
    /// After the container exits, before cleanup.
    TeardownContainer,
    /// Once, after every supervisor has finished.
    Teardown,
    /// After a reload operation, regardless of per-target failures.
    AfterReload,
    /// After a container exits with a non-success status.
    AfterFailure,
    /// On a runtime-level failure of the creation or supervision flow.
    SystemFailure,
}

impl HookPoint {
    /// The hookpoint's configuration name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::BeforeFork => "before_fork",
            Self::AfterFork => "after_fork",
            Self::BeforeChroot => "before_chroot",
            Self::AfterChroot => "after_chroot",
            Self::BeforeStartWait => "before_start_wait",
            Self::TeardownContainer => "teardown_container",
            Self::Teardown => "teardown",
            Self::AfterReload => "after_reload",
            Self::AfterFailure => "after_failure",
            Self::SystemFailure => "system_failure",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A lifecycle hook callback.
pub type HookFn = Box<dyn Fn(&ContainerSpec) -> Result<()> + Send + Sync>;

/// Hookpoint-to-callback table carried by the container spec.
#[derive(Default)]
pub struct HookTable {
    table: HashMap<HookPoint, HookFn>,
}

impl HookTable {
    /// Registers a callback for a hookpoint, replacing any existing one.
    pub fn on<F>(&mut self, point: HookPoint, hook: F)
    where
        F: Fn(&ContainerSpec) -> Result<()> + Send + Sync + 'static,
    {
        let _ = self.table.insert(point, Box::new(hook));
    }

    /// The callback registered for a hookpoint, if any.
    #[must_use]
    pub fn get(&self, point: HookPoint) -> Option<&HookFn> {
        self.table.get(&point)
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTable")
            .field("registered", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A custom signal handler run by the supervision loop.
///
/// Receives the spec and the supervised container's PID, e.g. to
/// forward the signal or re-read configuration.
pub type SignalHookFn = Box<dyn Fn(&ContainerSpec, Pid) -> Result<()> + Send + Sync>;

/// Signal-number-to-handler table carried by the container spec.
#[derive(Default)]
pub struct SignalTable {
    table: HashMap<i32, SignalHookFn>,
}

impl SignalTable {
    /// Registers a handler for a signal number, replacing any existing one.
    pub fn on<F>(&mut self, signal: i32, handler: F)
    where
        F: Fn(&ContainerSpec, Pid) -> Result<()> + Send + Sync + 'static,
    {
        let _ = self.table.insert(signal, Box::new(handler));
    }

    /// The handler registered for a signal, if any.
    #[must_use]
    pub fn get(&self, signal: i32) -> Option<&SignalHookFn> {
        self.table.get(&signal)
    }

    /// All signal numbers with a registered handler.
    #[must_use]
    pub fn signals(&self) -> Vec<i32> {
        self.table.keys().copied().collect()
    }
}

impl fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTable")
            .field("registered", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runs the hook registered at a point, if any.
///
/// A callback error is logged as a warning and otherwise ignored.
pub fn invoke(spec: &ContainerSpec, point: HookPoint) {
    if let Some(hook) = spec.hooks.get(point) {
        if let Err(err) = hook(spec) {
            tracing::warn!(hookpoint = %point, %err, "container hook failed, skipped");
        } else {
            tracing::debug!(hookpoint = %point, "container hook ran");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use palisade_common::error::RuntimeError;

    #[test]
    fn invoke_runs_the_registered_hook_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let mut spec = ContainerSpec::new("t", "t");
        spec.hooks.on(HookPoint::Setup, move |_| {
            let _ = seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        invoke(&spec, HookPoint::Setup);
        invoke(&spec, HookPoint::Teardown);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_errors_are_swallowed() {
        let mut spec = ContainerSpec::new("t", "t");
        spec.hooks.on(HookPoint::TeardownContainer, |_| {
            Err(RuntimeError::Config {
                message: "hook exploded".into(),
            })
        });
        // Must not panic or propagate.
        invoke(&spec, HookPoint::TeardownContainer);
    }

    #[test]
    fn hookpoint_names_match_configuration_keys() {
        assert_eq!(HookPoint::BeforeStartWait.name(), "before_start_wait");
        assert_eq!(HookPoint::SystemFailure.to_string(), "system_failure");
    }

    #[test]
    fn signal_table_lists_registered_signals() {
        let mut table = SignalTable::default();
        table.on(libc::SIGHUP, |_, _| Ok(()));
        assert!(table.get(libc::SIGHUP).is_some());
        assert!(table.get(libc::SIGUSR1).is_none());
        assert_eq!(table.signals(), vec![libc::SIGHUP]);
    }
}
