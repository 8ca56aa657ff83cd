//! Mount utilities for container filesystem setup.
//!
//! Handles mount-propagation isolation, bind mounts, and typed
//! filesystem mounts inside the container's mount namespace.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use palisade_common::error::{Result, RuntimeError};

/// Ownership options inherited from the container's rootfs description.
///
/// Rendered into mount data (`uid=`/`gid=`) for filesystems that accept
/// ownership at mount time, such as `tmpfs` and `devpts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootfsOwner {
    /// Owning uid for mounted filesystems.
    pub uid: Option<u32>,
    /// Owning gid for mounted filesystems.
    pub gid: Option<u32>,
}

impl RootfsOwner {
    /// Renders the owner as mount data, or `None` when unset.
    #[must_use]
    pub fn to_data(&self) -> Option<String> {
        match (self.uid, self.gid) {
            (None, None) => None,
            (Some(uid), None) => Some(format!("uid={uid}")),
            (None, Some(gid)) => Some(format!("gid={gid}")),
            (Some(uid), Some(gid)) => Some(format!("uid={uid},gid={gid}")),
        }
    }
}

/// One configured mount inside the container.
#[derive(Debug, Clone)]
pub struct MountPoint {
    /// Mount source: a host path for bind mounts, a device or filesystem
    /// label for typed mounts.
    pub src: PathBuf,
    /// Mount destination.
    pub dest: PathBuf,
    /// Filesystem type; `None` means bind mount.
    pub fstype: Option<String>,
    /// Remount the destination read-only after mounting.
    pub readonly: bool,
    /// Extra mount data, comma-separated.
    pub data: Option<String>,
}

impl MountPoint {
    /// A bind mount from `src` to `dest`.
    #[must_use]
    pub fn bind(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            fstype: None,
            readonly: false,
            data: None,
        }
    }

    /// A typed filesystem mount from `src` to `dest`.
    #[must_use]
    pub fn typed(
        src: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            fstype: Some(fstype.into()),
            readonly: false,
            data: None,
        }
    }

    /// Resolves a relative source against the working directory the
    /// runtime was invoked from.
    #[must_use]
    pub fn normalized_src(&self, cwd: &Path) -> PathBuf {
        if self.src.is_absolute() {
            self.src.clone()
        } else {
            cwd.join(&self.src)
        }
    }
}

/// Merges two optional comma-separated mount data strings.
#[must_use]
pub fn merge_data(base: Option<&str>, extra: Option<&str>) -> Option<String> {
    match (base, extra) {
        (None, None) => None,
        (Some(a), None) => Some(a.to_owned()),
        (None, Some(b)) => Some(b.to_owned()),
        (Some(a), Some(b)) => Some(format!("{a},{b}")),
    }
}

/// Marks a mount tree private so mount events stop propagating to the
/// host namespace.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn make_private(target: &Path) -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| RuntimeError::kernel("mount(MS_PRIVATE)", e))?;
    tracing::debug!(target = %target.display(), "mount tree made private");
    Ok(())
}

/// Creates a bind mount from source to target, optionally read-only.
///
/// A read-only bind requires a second remount because the kernel ignores
/// `MS_RDONLY` on the initial bind.
///
/// # Errors
///
/// Returns an error if either `mount(2)` call fails.
pub fn bind_mount(src: &Path, dest: &Path, readonly: bool) -> Result<()> {
    nix::mount::mount(
        Some(src),
        dest,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| RuntimeError::kernel("mount(MS_BIND)", e))?;

    if readonly {
        nix::mount::mount(
            None::<&str>,
            dest,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| RuntimeError::kernel("mount(MS_RDONLY)", e))?;
    }

    tracing::debug!(
        src = %src.display(),
        dest = %dest.display(),
        readonly,
        "bind mount created"
    );
    Ok(())
}

/// Mounts a typed filesystem with optional mount data.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn mount_fs(src: &Path, dest: &Path, fstype: &str, data: Option<&str>) -> Result<()> {
    nix::mount::mount(Some(src), dest, Some(fstype), MsFlags::empty(), data)
        .map_err(|e| RuntimeError::kernel("mount", e))?;
    tracing::debug!(
        src = %src.display(),
        dest = %dest.display(),
        fstype,
        "filesystem mounted"
    );
    Ok(())
}

/// Applies one configured mount point, dispatching on its type and
/// merging the rootfs owner options into the mount data.
///
/// # Errors
///
/// Returns an error if the underlying mount fails.
pub fn apply_mount_point(mp: &MountPoint, owner: &RootfsOwner, cwd: &Path) -> Result<()> {
    let src = mp.normalized_src(cwd);
    let data = merge_data(owner.to_data().as_deref(), mp.data.as_deref());
    match &mp.fstype {
        Some(fstype) => mount_fs(&src, &mp.dest, fstype, data.as_deref()),
        None => bind_mount(&src, &mp.dest, mp.readonly),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_options_render_as_mount_data() {
        let owner = RootfsOwner {
            uid: Some(1000),
            gid: Some(1000),
        };
        assert_eq!(owner.to_data().as_deref(), Some("uid=1000,gid=1000"));
        assert_eq!(RootfsOwner::default().to_data(), None);
    }

    #[test]
    fn merge_data_joins_with_comma() {
        assert_eq!(
            merge_data(Some("uid=0"), Some("mode=755")).as_deref(),
            Some("uid=0,mode=755")
        );
        assert_eq!(merge_data(None, Some("mode=755")).as_deref(), Some("mode=755"));
        assert_eq!(merge_data(None, None), None);
    }

    #[test]
    fn relative_sources_resolve_against_cwd() {
        let mp = MountPoint::bind("data", "/srv/data");
        assert_eq!(
            mp.normalized_src(Path::new("/home/op")),
            PathBuf::from("/home/op/data")
        );
        let abs = MountPoint::bind("/var/data", "/srv/data");
        assert_eq!(abs.normalized_src(Path::new("/home/op")), PathBuf::from("/var/data"));
    }
}
