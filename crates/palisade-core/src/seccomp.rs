//! Seccomp syscall filtering.
//!
//! A policy carries a default action and a rule-building callback; the
//! filter is compiled to BPF and loaded immediately before exec. No
//! default action means no filter.

use std::collections::BTreeMap;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use palisade_common::error::{Result, RuntimeError};

/// Callback populating the per-syscall rule map of a filter.
pub type RuleBuilder = Box<dyn Fn(&mut BTreeMap<i64, Vec<SeccompRule>>) + Send + Sync>;

/// The container's seccomp configuration.
pub struct SeccompPolicy {
    /// Action for syscalls no rule matches; `None` disables filtering.
    pub default_action: Option<SeccompAction>,
    /// Action for syscalls a rule matches.
    pub match_action: SeccompAction,
    /// Callback that fills in the rule map before compilation.
    pub rules: Option<RuleBuilder>,
}

impl Default for SeccompPolicy {
    fn default() -> Self {
        Self {
            default_action: None,
            match_action: SeccompAction::Allow,
            rules: None,
        }
    }
}

impl SeccompPolicy {
    /// Whether a filter will be installed.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.default_action.is_some()
    }
}

/// Builds and loads the policy's filter for the calling process.
///
/// A policy without a default action is a no-op.
///
/// # Errors
///
/// Returns an error if the filter cannot be built, compiled for the
/// running architecture, or installed.
pub fn apply(policy: &SeccompPolicy) -> Result<()> {
    let Some(default_action) = policy.default_action.clone() else {
        return Ok(());
    };

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    if let Some(builder) = &policy.rules {
        builder(&mut rules);
    }

    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|_| RuntimeError::Unsupported {
            what: format!("seccomp on architecture {}", std::env::consts::ARCH),
        })?;

    let filter = SeccompFilter::new(
        rules,
        default_action,
        policy.match_action.clone(),
        arch,
    )
    .map_err(|e| RuntimeError::kernel("seccomp filter build", e))?;

    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| RuntimeError::kernel("seccomp compile", e))?;

    seccompiler::apply_filter(&program).map_err(|e| RuntimeError::kernel("seccomp load", e))?;
    tracing::debug!("seccomp filter loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_without_default_action_is_disabled() {
        let policy = SeccompPolicy::default();
        assert!(!policy.enabled());
        apply(&policy).expect("disabled policy is a no-op");
    }

    #[test]
    fn rule_builder_populates_the_map() {
        let policy = SeccompPolicy {
            default_action: Some(SeccompAction::Allow),
            match_action: SeccompAction::Errno(libc::EPERM as u32),
            rules: Some(Box::new(|rules| {
                let _ = rules.insert(libc::SYS_mount, Vec::new());
            })),
        };
        assert!(policy.enabled());

        let mut rules = BTreeMap::new();
        if let Some(builder) = &policy.rules {
            builder(&mut rules);
        }
        assert!(rules.contains_key(&libc::SYS_mount));
    }
}
