//! Identity maps for the freshly created user namespace

use crate::error::{Error, Result};
use nix::unistd::{Gid, Uid};
use std::{fs, path::PathBuf};

/// Map the calling identity to uid/gid 0 inside the namespace.
///
/// `setgroups` must receive `deny` before the gid map is written; kernels
/// that refuse the write still permit group mapping on some
/// distributions, so that step degrades to a warning.
pub fn write_identity_maps(uid: Uid, gid: Gid) -> Result<()> {
    if let Err(e) = fs::write("/proc/self/setgroups", "deny") {
        log::warn!("could not write deny to /proc/self/setgroups: {}", e);
    }
    write_map("/proc/self/uid_map", uid.as_raw())?;
    write_map("/proc/self/gid_map", gid.as_raw())?;
    Ok(())
}

fn write_map(path: &str, host_id: u32) -> Result<()> {
    fs::write(path, format!("0 {} 1\n", host_id)).map_err(|e| Error::IdentityMap {
        path: PathBuf::from(path),
        source: e,
    })
}
