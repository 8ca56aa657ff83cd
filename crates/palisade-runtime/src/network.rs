//! Network bridge collaborator interface.
//!
//! The bridge implementation itself lives outside this crate; the
//! runtime only drives its lifecycle: bring the bridge up before the
//! child enters its network namespace, obtain the namespace file to
//! enter, and tear down after the container exits. Teardown failures
//! are warnings, never fatal — by then the container is already gone.

use std::path::PathBuf;

use palisade_common::error::Result;

/// Lifecycle interface of a network bridge.
pub trait NetworkHandler: Send + Sync {
    /// Brings up the bridge and veth pair for this container.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be created.
    fn generate(&self) -> Result<()>;

    /// The network-namespace file the child should `setns` into.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace file is not available.
    fn to_ns_file(&self) -> Result<PathBuf>;

    /// Best-effort teardown after the container has exited.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; callers log and continue.
    fn cleanup(&self) -> Result<()>;
}
