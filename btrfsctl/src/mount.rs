// SPDX-License-Identifier: GPL-3.0-only

//! Thin wrappers over mount(2) and umount2(2).

use std::fmt::Display;
use std::io;
use std::path::Path;

pub use nix::mount::{MntFlags, MsFlags};

use crate::error::{BtrfsError, Result};

/// Mount `source` on `target`. An empty `data` passes no options.
pub fn mount(
    source: impl AsRef<Path>,
    target: impl AsRef<Path>,
    fstype: &str,
    flags: MsFlags,
    data: &str,
) -> Result<()> {
    let (source, target) = (source.as_ref(), target.as_ref());
    let data = (!data.is_empty()).then_some(data);
    nix::mount::mount(Some(source), target, Some(fstype), flags, data).map_err(|errno| {
        BtrfsError::os(
            format!("failed to mount {} on {}", source.display(), target.display()),
            io::Error::from(errno),
        )
    })?;
    tracing::info!(source = %source.display(), target = %target.display(), fstype, ?flags, "mounted");
    Ok(())
}

/// Mount a btrfs filesystem, e.g. with `data = "subvol=@home"`.
pub fn mount_btrfs(
    source: impl AsRef<Path>,
    target: impl AsRef<Path>,
    flags: MsFlags,
    data: &str,
) -> Result<()> {
    mount(source, target, "btrfs", flags, data)
}

pub fn umount(target: impl AsRef<Path>, flags: MntFlags) -> Result<()> {
    let target = target.as_ref();
    nix::mount::umount2(target, flags).map_err(|errno| {
        BtrfsError::os(
            format!("failed to unmount {}", target.display()),
            io::Error::from(errno),
        )
    })?;
    tracing::info!(target = %target.display(), ?flags, "unmounted");
    Ok(())
}

/// Join `key=value` pairs into a mount data string.
pub fn mount_data<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Display,
    V: Display,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
