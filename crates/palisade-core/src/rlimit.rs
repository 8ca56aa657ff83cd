//! Resource-limit application.
//!
//! Limits are ordered `(resource, soft, hard)` triples; either bound may
//! be the `unlimited` sentinel, which translates to the kernel's
//! `RLIM_INFINITY`. Limits apply to the calling process during container
//! setup and to a running process during reload.

use std::fmt;
use std::str::FromStr;

use nix::unistd::Pid;

use palisade_common::error::{Result, RuntimeError};

/// One bound of a resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    /// The kernel's "no limit" sentinel.
    Unlimited,
    /// An explicit numeric bound.
    Value(u64),
}

impl LimitValue {
    /// The raw `rlim_t` value for this bound.
    #[must_use]
    pub fn to_rlim(self) -> libc::rlim_t {
        match self {
            Self::Unlimited => libc::RLIM_INFINITY,
            Self::Value(v) => v,
        }
    }
}

impl FromStr for LimitValue {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unlimited" | "infinity" => Ok(Self::Unlimited),
            other => other
                .parse::<u64>()
                .map(Self::Value)
                .map_err(|_| RuntimeError::Config {
                    message: format!("invalid limit value: {other}"),
                }),
        }
    }
}

/// A resource-limit type this runtime can set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ResourceKind {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rtprio,
    Sigpending,
    Stack,
}

impl ResourceKind {
    /// The lowercase limit name as configured.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::As => "as",
            Self::Core => "core",
            Self::Cpu => "cpu",
            Self::Data => "data",
            Self::Fsize => "fsize",
            Self::Memlock => "memlock",
            Self::Msgqueue => "msgqueue",
            Self::Nice => "nice",
            Self::Nofile => "nofile",
            Self::Nproc => "nproc",
            Self::Rtprio => "rtprio",
            Self::Sigpending => "sigpending",
            Self::Stack => "stack",
        }
    }

    fn to_raw(self) -> libc::__rlimit_resource_t {
        match self {
            Self::As => libc::RLIMIT_AS,
            Self::Core => libc::RLIMIT_CORE,
            Self::Cpu => libc::RLIMIT_CPU,
            Self::Data => libc::RLIMIT_DATA,
            Self::Fsize => libc::RLIMIT_FSIZE,
            Self::Memlock => libc::RLIMIT_MEMLOCK,
            Self::Msgqueue => libc::RLIMIT_MSGQUEUE,
            Self::Nice => libc::RLIMIT_NICE,
            Self::Nofile => libc::RLIMIT_NOFILE,
            Self::Nproc => libc::RLIMIT_NPROC,
            Self::Rtprio => libc::RLIMIT_RTPRIO,
            Self::Sigpending => libc::RLIMIT_SIGPENDING,
            Self::Stack => libc::RLIMIT_STACK,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s
            .strip_prefix("RLIMIT_")
            .map_or_else(|| s.to_ascii_lowercase(), str::to_ascii_lowercase);
        match name.as_str() {
            "as" => Ok(Self::As),
            "core" => Ok(Self::Core),
            "cpu" => Ok(Self::Cpu),
            "data" => Ok(Self::Data),
            "fsize" => Ok(Self::Fsize),
            "memlock" => Ok(Self::Memlock),
            "msgqueue" => Ok(Self::Msgqueue),
            "nice" => Ok(Self::Nice),
            "nofile" => Ok(Self::Nofile),
            "nproc" => Ok(Self::Nproc),
            "rtprio" => Ok(Self::Rtprio),
            "sigpending" => Ok(Self::Sigpending),
            "stack" => Ok(Self::Stack),
            other => Err(RuntimeError::Config {
                message: format!("unknown resource limit: {other}"),
            }),
        }
    }
}

/// One configured resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitEntry {
    /// Which limit to set.
    pub resource: ResourceKind,
    /// Soft bound.
    pub soft: LimitValue,
    /// Hard bound.
    pub hard: LimitValue,
}

impl RlimitEntry {
    fn to_rlimit(self) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: self.soft.to_rlim(),
            rlim_max: self.hard.to_rlim(),
        }
    }
}

/// Applies every configured limit to the calling process, in order.
///
/// # Errors
///
/// Returns an error if any `setrlimit(2)` call fails.
pub fn apply(entries: &[RlimitEntry]) -> Result<()> {
    for entry in entries {
        let lim = entry.to_rlimit();
        // SAFETY: `lim` is a valid rlimit value for the duration of the call.
        let ret = unsafe { libc::setrlimit(entry.resource.to_raw(), &lim) };
        if ret != 0 {
            return Err(RuntimeError::kernel(
                "setrlimit",
                std::io::Error::last_os_error(),
            ));
        }
        tracing::debug!(resource = %entry.resource, "rlimit applied");
    }
    Ok(())
}

/// Applies every configured limit to a running process, in order.
///
/// # Errors
///
/// Returns an error if any `prlimit(2)` call fails.
pub fn apply_pid(pid: Pid, entries: &[RlimitEntry]) -> Result<()> {
    for entry in entries {
        let lim = entry.to_rlimit();
        // SAFETY: `lim` is a valid rlimit value; the old-limit out
        // parameter is explicitly null.
        let ret = unsafe {
            libc::prlimit(
                pid.as_raw(),
                entry.resource.to_raw(),
                &lim,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            return Err(RuntimeError::kernel(
                "prlimit",
                std::io::Error::last_os_error(),
            ));
        }
        tracing::debug!(resource = %entry.resource, %pid, "rlimit reapplied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_maps_to_infinity() {
        assert_eq!(LimitValue::Unlimited.to_rlim(), libc::RLIM_INFINITY);
        assert_eq!(
            "unlimited".parse::<LimitValue>().ok(),
            Some(LimitValue::Unlimited)
        );
        assert_eq!(
            "infinity".parse::<LimitValue>().ok(),
            Some(LimitValue::Unlimited)
        );
    }

    #[test]
    fn numeric_values_pass_through_unchanged() {
        assert_eq!(LimitValue::Value(4096).to_rlim(), 4096);
        assert_eq!(
            "4096".parse::<LimitValue>().ok(),
            Some(LimitValue::Value(4096))
        );
        assert!("40k".parse::<LimitValue>().is_err());
    }

    #[test]
    fn resource_names_parse_in_both_spellings() {
        assert_eq!(
            "nofile".parse::<ResourceKind>().ok(),
            Some(ResourceKind::Nofile)
        );
        assert_eq!(
            "RLIMIT_NOFILE".parse::<ResourceKind>().ok(),
            Some(ResourceKind::Nofile)
        );
        assert!("bogus".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn apply_accepts_a_permissive_limit() {
        // Lowering the core-dump size to zero never needs privilege.
        let entry = RlimitEntry {
            resource: ResourceKind::Core,
            soft: LimitValue::Value(0),
            hard: LimitValue::Value(0),
        };
        apply(&[entry]).expect("setrlimit(core, 0, 0)");
    }
}
