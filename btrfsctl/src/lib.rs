// SPDX-License-Identifier: GPL-3.0-only

//! Btrfs subvolume and filesystem control
//!
//! Walks subvolume trees, reads and changes subvolume metadata, creates
//! snapshots and subvolumes, and prepares filesystem creation and mounts.
//! Everything talks to the kernel directly through btrfs ioctls on an open
//! directory; every failure is reported as a [`BtrfsError`].

pub mod config;
pub mod error;
pub mod ioctl;
pub mod iterator;
pub mod mkfs;
pub mod mount;
pub mod qgroup;
pub mod root_item;
pub mod subvolume;
pub mod sync;
pub mod tree;

// Re-export commonly used types
pub use config::{Config, LoggingLevel, MkfsDefaults};
pub use error::{BtrfsError, ErrorCode, Result, UtilError, translate};
pub use iterator::{IteratorOptions, SubvolumeEntry, SubvolumeIterator};
pub use mkfs::{
    FormatEngine, FormatRequest, MkfsBtrfsEngine, ResolvedFormatRequest, mkfs, read_superblock,
};
pub use mount::{MntFlags, MsFlags, mount, mount_btrfs, mount_data, umount};
pub use qgroup::{QgroupInherit, format_qgroupid, qgroupid};
pub use subvolume::{
    SnapshotOptions, SubvolumeManager, create_snapshot, create_subvolume, delete_subvolume,
    deleted_subvolumes, get_default_subvolume, get_subvolume_read_only, is_subvolume,
    set_default_subvolume, set_subvolume_read_only, subvolume_id, subvolume_info, subvolume_path,
};
pub use sync::{start_sync, sync, wait_sync};
pub use tree::{BtrfsTree, ChildRef, SubvolumeTree};

// Shared data models
pub use btrfsctl_types::{
    ChecksumType, FS_TREE_OBJECTID, Feature, FormatOutcome, RaidProfile, SubvolumeEntryRecord,
    SubvolumeId, SubvolumeInfo, SubvolumeList, Timespec,
};
