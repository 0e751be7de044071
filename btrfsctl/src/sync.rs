// SPDX-License-Identifier: GPL-3.0-only

//! Transaction commit control.

use std::os::fd::AsFd;
use std::path::Path;

use crate::error::{BtrfsError, ErrorCode, Result};
use crate::ioctl::{self, BTRFS_IOC_START_SYNC, BTRFS_IOC_SYNC, BTRFS_IOC_WAIT_SYNC};
use crate::tree::open_btrfs;

/// Commit the current transaction of the filesystem containing `path` and wait.
pub fn sync(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    ioctl::ioctl_none(file.as_fd(), BTRFS_IOC_SYNC)
        .map_err(|e| BtrfsError::io(ErrorCode::SyncFailed, &e, path))?;
    tracing::debug!(path = %path.display(), "synced filesystem");
    Ok(())
}

/// Start committing the current transaction without waiting; returns its id.
pub fn start_sync(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    let mut transid = 0u64;
    ioctl::ioctl_ptr(file.as_fd(), BTRFS_IOC_START_SYNC, &mut transid)
        .map_err(|e| BtrfsError::io(ErrorCode::StartSyncFailed, &e, path))?;
    tracing::debug!(path = %path.display(), transid, "started transaction commit");
    Ok(transid)
}

/// Wait for transaction `transid` to commit; 0 waits for the current one.
pub fn wait_sync(path: impl AsRef<Path>, transid: u64) -> Result<()> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    let mut transid = transid;
    ioctl::ioctl_ptr(file.as_fd(), BTRFS_IOC_WAIT_SYNC, &mut transid)
        .map_err(|e| BtrfsError::io(ErrorCode::WaitSyncFailed, &e, path))?;
    Ok(())
}
