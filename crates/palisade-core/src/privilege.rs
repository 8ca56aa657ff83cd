//! Effective-privilege management for a setuid-root runtime binary.
//!
//! The supervisor drops its effective ids back to the invoking user once
//! the privileged creation phase is over, and re-elevates only inside a
//! scoped guard around cgroup deletion and lock release. The guard
//! restores the prior effective uid on every exit path.

use nix::unistd::{Uid, getegid, geteuid, getgid, getuid, setegid, seteuid};

use palisade_common::error::{Result, RuntimeError};

/// Drops the effective uid/gid back to the real ids when they differ.
///
/// A no-op for a process that is not running with a raised effective
/// identity. The group id is restored first, while the user id still
/// permits it.
///
/// # Errors
///
/// Returns an error if `setegid(2)` or `seteuid(2)` fails.
pub fn drop_effective() -> Result<()> {
    if getgid() != getegid() {
        setegid(getgid()).map_err(|e| RuntimeError::kernel("setegid", e))?;
    }
    if getuid() != geteuid() {
        seteuid(getuid()).map_err(|e| RuntimeError::kernel("seteuid", e))?;
    }
    Ok(())
}

/// Scoped elevation of the effective uid to root.
///
/// Acquiring attempts `seteuid(0)`; when the process has no saved root
/// id to return to, the guard records that elevation was unavailable and
/// the protected operations run with the current identity. Dropping the
/// guard restores the prior effective uid unconditionally.
#[derive(Debug)]
pub struct Elevated {
    prior: Uid,
    active: bool,
}

impl Elevated {
    /// Elevates the effective uid for the guard's lifetime.
    #[must_use]
    pub fn acquire() -> Self {
        let prior = geteuid();
        if prior.is_root() {
            return Self {
                prior,
                active: false,
            };
        }
        match seteuid(Uid::from_raw(0)) {
            Ok(()) => Self {
                prior,
                active: true,
            },
            Err(err) => {
                tracing::debug!(%err, "effective-privilege elevation unavailable");
                Self {
                    prior,
                    active: false,
                }
            }
        }
    }

    /// Whether the guard actually raised the effective uid.
    #[must_use]
    pub fn elevated(&self) -> bool {
        self.active
    }
}

impl Drop for Elevated {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = seteuid(self.prior) {
                tracing::warn!(%err, "failed to restore effective uid");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_effective_is_a_noop_without_suid() {
        // In a plain test environment real and effective ids match.
        drop_effective().expect("no-op drop");
        assert_eq!(getuid(), geteuid());
    }

    #[test]
    fn guard_restores_prior_identity() {
        let before = geteuid();
        {
            let guard = Elevated::acquire();
            // Without a saved root id the guard records unavailability;
            // as root it is already elevated and stays so.
            let _ = guard.elevated();
        }
        assert_eq!(geteuid(), before);
    }
}
