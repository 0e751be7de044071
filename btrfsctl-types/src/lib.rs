// SPDX-License-Identifier: GPL-3.0-only

//! Canonical data models for btrfs subvolume management
//!
//! These types are shared by the `btrfsctl` library, its command line front
//! end and anything that consumes their JSON output:
//!
//! - `SubvolumeInfo` → the metadata record of one subvolume
//! - `SubvolumeEntryRecord` / `SubvolumeList` → traversal results
//! - `RaidProfile`, `ChecksumType`, `Feature` → filesystem creation knobs
//! - `FormatOutcome` → what the formatting engine reports back

pub mod format;
pub mod subvolume;

pub use format::{ChecksumType, Feature, FormatOutcome, RaidProfile};
pub use subvolume::{
    FS_TREE_OBJECTID, ROOT_SUBVOL_RDONLY, SubvolumeEntryRecord, SubvolumeId, SubvolumeInfo,
    SubvolumeList, Timespec,
};
