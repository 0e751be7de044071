// SPDX-License-Identifier: GPL-3.0-only

//! Decoding of the root tree records the traversal engine reads.
//!
//! All item payloads are little-endian and packed.

use btrfsctl_types::{SubvolumeId, SubvolumeInfo, Timespec};
use uuid::Uuid;

use crate::ioctl::{le_u16, le_u32, le_u64};

const INODE_ITEM_SIZE: usize = 160;
const GENERATION: usize = INODE_ITEM_SIZE;
const FLAGS: usize = GENERATION + 6 * 8;
/// Legacy root items end after `level`.
const LEGACY_ROOT_ITEM_SIZE: usize = FLAGS + 8 + 4 + 17 + 1 + 1;
const UUID: usize = LEGACY_ROOT_ITEM_SIZE + 8;
const PARENT_UUID: usize = UUID + 16;
const RECEIVED_UUID: usize = PARENT_UUID + 16;
const CTRANSID: usize = RECEIVED_UUID + 16;
const CTIME: usize = CTRANSID + 4 * 8;
const TIMESPEC_SIZE: usize = 12;
pub const ROOT_ITEM_SIZE: usize = CTIME + 4 * TIMESPEC_SIZE + 8 * 8;

const ROOT_REF_SIZE: usize = 18;
const DIR_ITEM_SIZE: usize = 30;

/// The parts of `struct btrfs_root_item` that make up a metadata record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootItem {
    pub generation: u64,
    pub flags: u64,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: Timespec,
    pub otime: Timespec,
    pub stime: Timespec,
    pub rtime: Timespec,
}

impl RootItem {
    /// Parse a root item. Items written by old kernels stop before the UUID
    /// block; those fields are left zeroed.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LEGACY_ROOT_ITEM_SIZE {
            return None;
        }
        let mut item = RootItem {
            generation: le_u64(bytes, GENERATION)?,
            flags: le_u64(bytes, FLAGS)?,
            ..RootItem::default()
        };
        if bytes.len() < ROOT_ITEM_SIZE {
            tracing::trace!(len = bytes.len(), "legacy root item without uuid block");
            return Some(item);
        }
        item.uuid = uuid_at(bytes, UUID)?;
        item.parent_uuid = uuid_at(bytes, PARENT_UUID)?;
        item.received_uuid = uuid_at(bytes, RECEIVED_UUID)?;
        item.ctransid = le_u64(bytes, CTRANSID)?;
        item.otransid = le_u64(bytes, CTRANSID + 8)?;
        item.stransid = le_u64(bytes, CTRANSID + 16)?;
        item.rtransid = le_u64(bytes, CTRANSID + 24)?;
        item.ctime = timespec_at(bytes, CTIME)?;
        item.otime = timespec_at(bytes, CTIME + TIMESPEC_SIZE)?;
        item.stime = timespec_at(bytes, CTIME + 2 * TIMESPEC_SIZE)?;
        item.rtime = timespec_at(bytes, CTIME + 3 * TIMESPEC_SIZE)?;
        Some(item)
    }

    pub fn into_info(self, id: SubvolumeId, parent_id: SubvolumeId, dir_id: u64) -> SubvolumeInfo {
        SubvolumeInfo {
            id,
            parent_id,
            dir_id,
            flags: self.flags,
            uuid: self.uuid,
            parent_uuid: self.parent_uuid,
            received_uuid: self.received_uuid,
            generation: self.generation,
            ctransid: self.ctransid,
            otransid: self.otransid,
            stransid: self.stransid,
            rtransid: self.rtransid,
            ctime: self.ctime,
            otime: self.otime,
            stime: self.stime,
            rtime: self.rtime,
        }
    }
}

/// `struct btrfs_root_ref` plus its trailing name; used for both ROOT_REF
/// and ROOT_BACKREF items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

impl RootRef {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let name_len = usize::from(le_u16(bytes, 16)?);
        let name = bytes.get(ROOT_REF_SIZE..ROOT_REF_SIZE + name_len)?;
        Some(Self {
            dirid: le_u64(bytes, 0)?,
            sequence: le_u64(bytes, 8)?,
            name: name.to_vec(),
        })
    }
}

/// One `struct btrfs_dir_item` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    pub location_objectid: u64,
    pub name: Vec<u8>,
}

impl DirItem {
    /// A single item may hold several entries whose names hash alike.
    pub fn parse_all(mut bytes: &[u8]) -> Vec<Self> {
        let mut items = Vec::new();
        while bytes.len() >= DIR_ITEM_SIZE {
            let (Some(objectid), Some(data_len), Some(name_len)) =
                (le_u64(bytes, 0), le_u16(bytes, 25), le_u16(bytes, 27))
            else {
                break;
            };
            let name_len = usize::from(name_len);
            let total = DIR_ITEM_SIZE + name_len + usize::from(data_len);
            let Some(name) = bytes.get(DIR_ITEM_SIZE..DIR_ITEM_SIZE + name_len) else {
                break;
            };
            items.push(DirItem {
                location_objectid: objectid,
                name: name.to_vec(),
            });
            bytes = bytes.get(total..).unwrap_or_default();
        }
        items
    }
}

fn uuid_at(bytes: &[u8], at: usize) -> Option<Uuid> {
    let raw: [u8; 16] = bytes.get(at..at + 16)?.try_into().ok()?;
    Some(Uuid::from_bytes(raw))
}

fn timespec_at(bytes: &[u8], at: usize) -> Option<Timespec> {
    Some(Timespec::new(le_u64(bytes, at)?, le_u32(bytes, at + 8)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a full-size root item with recognisable field values.
    pub(crate) fn encode_root_item(item: &RootItem) -> Vec<u8> {
        let mut bytes = vec![0u8; ROOT_ITEM_SIZE];
        let put_u64 = |bytes: &mut Vec<u8>, at: usize, v: u64| {
            bytes[at..at + 8].copy_from_slice(&v.to_le_bytes())
        };
        let put_ts = |bytes: &mut Vec<u8>, at: usize, ts: Timespec| {
            bytes[at..at + 8].copy_from_slice(&ts.sec.to_le_bytes());
            bytes[at + 8..at + 12].copy_from_slice(&ts.nsec.to_le_bytes());
        };
        put_u64(&mut bytes, GENERATION, item.generation);
        put_u64(&mut bytes, FLAGS, item.flags);
        bytes[UUID..UUID + 16].copy_from_slice(item.uuid.as_bytes());
        bytes[PARENT_UUID..PARENT_UUID + 16].copy_from_slice(item.parent_uuid.as_bytes());
        bytes[RECEIVED_UUID..RECEIVED_UUID + 16].copy_from_slice(item.received_uuid.as_bytes());
        put_u64(&mut bytes, CTRANSID, item.ctransid);
        put_u64(&mut bytes, CTRANSID + 8, item.otransid);
        put_u64(&mut bytes, CTRANSID + 16, item.stransid);
        put_u64(&mut bytes, CTRANSID + 24, item.rtransid);
        put_ts(&mut bytes, CTIME, item.ctime);
        put_ts(&mut bytes, CTIME + TIMESPEC_SIZE, item.otime);
        put_ts(&mut bytes, CTIME + 2 * TIMESPEC_SIZE, item.stime);
        put_ts(&mut bytes, CTIME + 3 * TIMESPEC_SIZE, item.rtime);
        bytes
    }

    #[test]
    fn layout_offsets() {
        assert_eq!(LEGACY_ROOT_ITEM_SIZE, 239);
        assert_eq!(UUID, 247);
        assert_eq!(CTRANSID, 295);
        assert_eq!(CTIME, 327);
        assert_eq!(ROOT_ITEM_SIZE, 439);
    }

    #[test]
    fn parses_full_root_item() {
        let item = RootItem {
            generation: 42,
            flags: 1,
            uuid: Uuid::from_u128(0xaaaa),
            parent_uuid: Uuid::from_u128(0xbbbb),
            received_uuid: Uuid::nil(),
            ctransid: 40,
            otransid: 12,
            stransid: 0,
            rtransid: 0,
            ctime: Timespec::new(1_700_000_100, 7),
            otime: Timespec::new(1_700_000_000, 3),
            stime: Timespec::default(),
            rtime: Timespec::default(),
        };
        let parsed = RootItem::parse(&encode_root_item(&item)).unwrap();
        assert_eq!(parsed, item);

        let info = parsed.into_info(258, 5, 256);
        assert_eq!(info.id, 258);
        assert_eq!(info.parent(), Some(Uuid::from_u128(0xbbbb)));
        assert!(info.is_read_only());
    }

    #[test]
    fn legacy_root_item_leaves_uuids_zeroed() {
        let item = RootItem {
            generation: 9,
            uuid: Uuid::from_u128(1),
            ..RootItem::default()
        };
        let bytes = encode_root_item(&item);
        let parsed = RootItem::parse(&bytes[..LEGACY_ROOT_ITEM_SIZE]).unwrap();
        assert_eq!(parsed.generation, 9);
        assert!(parsed.uuid.is_nil());
        assert!(RootItem::parse(&bytes[..100]).is_none());
    }

    #[test]
    fn parses_root_ref_with_name() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&256u64.to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(b"home");

        let root_ref = RootRef::parse(&bytes).unwrap();
        assert_eq!(root_ref.dirid, 256);
        assert_eq!(root_ref.name, b"home");
        assert!(RootRef::parse(&bytes[..20]).is_none());
    }

    #[test]
    fn parses_packed_dir_items() {
        let mut bytes = Vec::new();
        for (objectid, name) in [(256u64, &b"default"[..]), (300, &b"other"[..])] {
            bytes.extend_from_slice(&objectid.to_le_bytes());
            bytes.push(132);
            bytes.extend_from_slice(&u64::MAX.to_le_bytes());
            bytes.extend_from_slice(&1u64.to_le_bytes());
            bytes.extend_from_slice(&0u16.to_le_bytes());
            bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
            bytes.push(2);
            bytes.extend_from_slice(name);
        }

        let items = DirItem::parse_all(&bytes);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].location_objectid, 256);
        assert_eq!(items[0].name, b"default");
        assert_eq!(items[1].name, b"other");
    }
}
