//! Domain primitive types used across the Palisade workspace.

use std::fmt;

/// Terminal status of a supervised process.
///
/// Mirrors the two ways a reaped child can have ended: a normal exit with a
/// code, or termination by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Process exited normally with the given code.
    Exited(i32),
    /// Process was terminated by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// Whether the process ended with a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the process exited normally.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_success() {
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(0).code(), Some(0));
    }

    #[test]
    fn nonzero_exit_is_failure() {
        assert!(!ExitStatus::Exited(127).success());
        assert_eq!(ExitStatus::Exited(127).code(), Some(127));
    }

    #[test]
    fn signaled_is_failure_without_code() {
        let status = ExitStatus::Signaled(9);
        assert!(!status.success());
        assert_eq!(status.code(), None);
        assert_eq!(status.to_string(), "killed by signal 9");
    }
}
