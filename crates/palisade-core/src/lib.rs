//! # palisade-core
//!
//! Low-level Linux isolation primitives for the Palisade runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: unshare, setns, and on-disk persistence of namespace files.
//! - **Cgroups**: v1 per-controller hierarchies and the v2 unified hierarchy.
//! - **Mounts**: propagation control, bind mounts, and typed filesystem mounts.
//! - **Capabilities**: bounding-set drops under a whitelist or blacklist policy.
//! - **Seccomp**: BPF filter construction and loading.
//! - **Rlimits**: resource-limit application to the current or a remote process.
//! - **Privilege**: scoped effective-uid elevation and suid-bit dropping.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod mounts;
pub mod namespace;
pub mod privilege;
pub mod rlimit;
pub mod seccomp;
