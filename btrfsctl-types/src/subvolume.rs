// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a node in the subvolume tree.
pub type SubvolumeId = u64;

/// Id of the top-level subvolume (`FS_TREE`).
pub const FS_TREE_OBJECTID: SubvolumeId = 5;

/// Root item flag marking a subvolume read-only.
pub const ROOT_SUBVOL_RDONLY: u64 = 1 << 0;

/// On-disk timestamp: seconds plus nanoseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Fractional seconds, the single-value form callers usually want.
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + f64::from(self.nsec) / 1e9
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let sec = i64::try_from(self.sec).ok()?;
        DateTime::from_timestamp(sec, self.nsec)
    }
}

/// Metadata record of one subvolume, as read from its root item and back reference.
///
/// UUID fields that are all zero mean "not set"; use [`SubvolumeInfo::parent`] and
/// [`SubvolumeInfo::received`] for the optional view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeInfo {
    pub id: SubvolumeId,
    /// Id of the subvolume containing this one, 0 for the top-level subvolume.
    pub parent_id: SubvolumeId,
    /// Inode number of the directory containing this subvolume inside its parent.
    pub dir_id: u64,
    pub flags: u64,

    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,

    pub generation: u64,
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,

    pub ctime: Timespec,
    pub otime: Timespec,
    pub stime: Timespec,
    pub rtime: Timespec,
}

impl SubvolumeInfo {
    pub fn is_read_only(&self) -> bool {
        self.flags & ROOT_SUBVOL_RDONLY != 0
    }

    /// UUID of the snapshot source, `None` for a subvolume that is not a snapshot.
    pub fn parent(&self) -> Option<Uuid> {
        (!self.parent_uuid.is_nil()).then_some(self.parent_uuid)
    }

    pub fn received(&self) -> Option<Uuid> {
        (!self.received_uuid.is_nil()).then_some(self.received_uuid)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.otime.to_datetime()
    }

    pub fn changed(&self) -> Option<DateTime<Utc>> {
        self.ctime.to_datetime()
    }
}

/// One traversal result in serializable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubvolumeEntryRecord {
    pub path: String,
    pub id: SubvolumeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<SubvolumeInfo>,
}

/// Response containing subvolumes and default ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubvolumeList {
    pub subvolumes: Vec<SubvolumeEntryRecord>,
    pub default_id: SubvolumeId,
}
