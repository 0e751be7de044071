// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use btrfsctl::{create_subvolume, delete_subvolume};

/// Mounted btrfs directory to run against, from `BTRFS`. Needs root.
pub fn btrfs_root(context: &str) -> Option<PathBuf> {
    let Some(root) = std::env::var("BTRFS")
        .ok()
        .filter(|value| !value.trim().is_empty())
    else {
        eprintln!("SKIP {}: BTRFS is not set", context);
        return None;
    };
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("SKIP {}: tree search needs root", context);
        return None;
    }
    Some(PathBuf::from(root))
}

pub fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "_{}_{}_{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// A subvolume deleted, with everything below it, when dropped.
pub struct TempSubvolume {
    path: PathBuf,
}

impl TempSubvolume {
    pub fn create(parent: &Path, prefix: &str) -> Self {
        let path = parent.join(unique_name(prefix));
        create_subvolume(&path, None).expect("create temporary subvolume");
        Self { path }
    }

    /// Take ownership of a subvolume created some other way.
    pub fn adopt(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempSubvolume {
    fn drop(&mut self) {
        if self.path.exists() {
            // Read-only snapshots must be made writable before their children go.
            let _ = btrfsctl::set_subvolume_read_only(&self.path, false);
            if let Err(error) = delete_subvolume(&self.path, true) {
                eprintln!("cleanup of {} failed: {}", self.path.display(), error);
            }
        }
    }
}
