//! Root pivot and virtual filesystem mounts
//!
//! Everything here runs inside the container's own mount namespace; the
//! first step marks the inherited tree private so no mount event can
//! reach the host.

use crate::error::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use std::{fs, os::unix::fs::DirBuilderExt, path::Path};

const NONE: Option<&str> = None;
/// Receives the old root during the pivot; removed right after the detach.
const OLD_ROOT: &str = ".oldroot";

/// Swap the namespace's root mount for `rootfs`.
///
/// Order is a kernel contract: propagation must be private before the
/// bind, and `pivot_root` demands the new root be a mount point distinct
/// from the old one, hence the self-bind.
pub fn pivot(rootfs: &Path) -> Result<()> {
    mount(NONE, "/", NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE).map_err(|e| {
        Error::Mount {
            target: "/".into(),
            source: e,
        }
    })?;

    mount(
        Some(rootfs),
        rootfs,
        NONE,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        NONE,
    )
    .map_err(|e| Error::Mount {
        target: rootfs.to_owned(),
        source: e,
    })?;

    let old_root = rootfs.join(OLD_ROOT);
    fs::DirBuilder::new()
        .mode(0o700)
        .recursive(true)
        .create(&old_root)?;

    pivot_root(rootfs, &old_root).map_err(|e| Error::Pivot {
        new_root: rootfs.to_owned(),
        source: e,
    })?;

    chdir("/").map_err(|e| Error::Chdir {
        path: "/".into(),
        source: e,
    })?;

    let old_root_inside = Path::new("/").join(OLD_ROOT);
    umount2(&old_root_inside, MntFlags::MNT_DETACH).map_err(|e| Error::Mount {
        target: old_root_inside.clone(),
        source: e,
    })?;
    if let Err(e) = fs::remove_dir(&old_root_inside) {
        log::warn!("could not remove {}: {}", old_root_inside.display(), e);
    }

    Ok(())
}

/// Mount the virtual filesystems the container cannot live without. All
/// three are required; a failure aborts the launch.
pub fn mount_virtual_filesystems() -> Result<()> {
    mount_required(
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        NONE,
    )?;
    // no device nodes are populated; images that need /dev/null carry it
    mount_required(
        "tmpfs",
        "/dev",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME,
        Some("mode=0755,size=65536k"),
    )?;
    mount_required(
        "sysfs",
        "/sys",
        "sysfs",
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        NONE,
    )?;
    Ok(())
}

fn mount_required(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    // images are not required to carry the mount points
    fs::create_dir_all(target)?;
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| Error::Mount {
        target: target.into(),
        source: e,
    })
}
