//! Linux capability management for least-privilege execution.
//!
//! Capabilities are dropped from the bounding set before exec, under
//! either a whitelist (drop everything else) or a blacklist (drop
//! exactly the listed ones) policy. A capability the kernel does not
//! support is logged and skipped, never fatal.

use caps::{CapSet, Capability};

/// Which capabilities a container process may keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityPolicy {
    /// Keep only the listed capabilities; drop every other supported one.
    Whitelist(Vec<Capability>),
    /// Drop exactly the listed capabilities.
    Blacklist(Vec<Capability>),
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::Blacklist(Vec::new())
    }
}

impl CapabilityPolicy {
    /// The capabilities this policy removes from the bounding set,
    /// ordered by capability index.
    #[must_use]
    pub fn bounding_drops(&self) -> Vec<Capability> {
        let mut drops: Vec<Capability> = match self {
            Self::Whitelist(keep) => caps::all()
                .into_iter()
                .filter(|cap| !keep.contains(cap))
                .collect(),
            Self::Blacklist(drop) => drop.clone(),
        };
        drops.sort_by_key(|cap| cap.index());
        drops
    }
}

/// Drops capabilities from the calling process's bounding set per the
/// policy.
///
/// Individual drop failures (a capability id the running kernel does not
/// know) are logged and skipped; the remaining drops still apply.
pub fn apply(policy: &CapabilityPolicy) {
    for cap in policy.bounding_drops() {
        match caps::drop(None, CapSet::Bounding, cap) {
            Ok(()) => tracing::debug!(capability = %cap, "bounding capability dropped"),
            Err(err) => {
                tracing::warn!(capability = %cap, %err, "capability unsupported, skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_drops_everything_else_exactly_once() {
        let policy = CapabilityPolicy::Whitelist(vec![Capability::CAP_NET_BIND_SERVICE]);
        let drops = policy.bounding_drops();

        assert!(!drops.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert_eq!(drops.len(), caps::all().len() - 1);

        let mut deduped = drops.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), drops.len());
    }

    #[test]
    fn blacklist_drops_exactly_the_listed_set() {
        let policy =
            CapabilityPolicy::Blacklist(vec![Capability::CAP_SYS_ADMIN, Capability::CAP_MKNOD]);
        let drops = policy.bounding_drops();
        // Ordered by capability index: CAP_SYS_ADMIN (21) before CAP_MKNOD (27).
        assert_eq!(
            drops,
            vec![Capability::CAP_SYS_ADMIN, Capability::CAP_MKNOD]
        );
    }

    #[test]
    fn default_policy_drops_nothing() {
        assert!(CapabilityPolicy::default().bounding_drops().is_empty());
    }
}
