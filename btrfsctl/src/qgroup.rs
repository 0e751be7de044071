// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use crate::error::{BtrfsError, Result};

const QGROUP_LEVEL_SHIFT: u32 = 48;

/// `struct btrfs_qgroup_inherit` header words: flags, num_qgroups,
/// num_ref_copies, num_excl_copies and the five-word limit block.
const HEADER_WORDS: usize = 9;

/// Quota groups a new subvolume or snapshot is added to.
///
/// Ids keep their insertion order and may repeat. Creating a subvolume reads
/// the set without changing it, so one set can be reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QgroupInherit {
    groups: Vec<u64>,
}

impl QgroupInherit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a qgroup id. Negative or out-of-range values are rejected.
    pub fn add_group<I>(&mut self, qgroupid: I) -> Result<()>
    where
        I: TryInto<u64> + Copy + fmt::Display,
    {
        let id = qgroupid
            .try_into()
            .map_err(|_| BtrfsError::InvalidArgument(format!("invalid qgroup id: {qgroupid}")))?;
        self.groups.push(id);
        Ok(())
    }

    pub fn groups(&self) -> Vec<u64> {
        self.groups.clone()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The kernel's variable-length inherit structure, as 64-bit words.
    pub(crate) fn to_ioctl_buffer(&self) -> Vec<u64> {
        let mut buf = vec![0u64; HEADER_WORDS + self.groups.len()];
        buf[1] = self.groups.len() as u64;
        buf[HEADER_WORDS..].copy_from_slice(&self.groups);
        buf
    }
}

impl FromIterator<u64> for QgroupInherit {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self {
            groups: iter.into_iter().collect(),
        }
    }
}

/// Compose a qgroup id from its level and subvolume (or group) id.
pub fn qgroupid(level: u16, id: u64) -> u64 {
    (u64::from(level) << QGROUP_LEVEL_SHIFT) | (id & ((1 << QGROUP_LEVEL_SHIFT) - 1))
}

/// Render a qgroup id the way btrfs-progs does, as `level/id`.
pub fn format_qgroupid(qgroupid: u64) -> String {
    format!(
        "{}/{}",
        qgroupid >> QGROUP_LEVEL_SHIFT,
        qgroupid & ((1 << QGROUP_LEVEL_SHIFT) - 1)
    )
}
