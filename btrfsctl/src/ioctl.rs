// SPDX-License-Identifier: GPL-3.0-only

//! Raw btrfs ioctl ABI
//!
//! Request numbers and argument layouts from `linux/btrfs.h` and
//! `linux/btrfs_tree.h`. Only the pieces this crate drives are declared.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

pub const BTRFS_IOCTL_MAGIC: u64 = 0x94;

pub const BTRFS_PATH_NAME_MAX: usize = 4087;
pub const BTRFS_SUBVOL_NAME_MAX: usize = 4039;
pub const BTRFS_INO_LOOKUP_PATH_MAX: usize = 4080;
pub const BTRFS_VOL_NAME_MAX: usize = 255;
pub const BTRFS_INO_LOOKUP_USER_PATH_MAX: usize = 4080 - BTRFS_VOL_NAME_MAX - 1;
pub const BTRFS_MAX_ROOTREF_BUFFER_NUM: usize = 255;
pub const BTRFS_SEARCH_ARGS_BUFSIZE: usize = 4096 - size_of::<SearchKey>();

// Subvolume flags for SUBVOL_CREATE_V2 / SNAP_CREATE_V2 / SUBVOL_{GET,SET}FLAGS.
pub const BTRFS_SUBVOL_RDONLY: u64 = 1 << 1;
pub const BTRFS_SUBVOL_QGROUP_INHERIT: u64 = 1 << 2;

// Object ids.
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_LAST_FREE_OBJECTID: u64 = -256i64 as u64;
pub const BTRFS_ORPHAN_OBJECTID: u64 = -5i64 as u64;

// Item key types.
pub const BTRFS_ORPHAN_ITEM_KEY: u32 = 48;
pub const BTRFS_DIR_ITEM_KEY: u32 = 84;
pub const BTRFS_ROOT_ITEM_KEY: u32 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u32 = 144;
pub const BTRFS_ROOT_REF_KEY: u32 = 156;

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (BTRFS_IOCTL_MAGIC << 8) | nr
}

pub const BTRFS_IOC_SYNC: u64 = ioc(IOC_NONE, 8, 0);
pub const BTRFS_IOC_SNAP_DESTROY: u64 = ioc(IOC_WRITE, 15, size_of::<VolArgs>());
pub const BTRFS_IOC_TREE_SEARCH: u64 = ioc(IOC_READ | IOC_WRITE, 17, size_of::<SearchArgs>());
pub const BTRFS_IOC_INO_LOOKUP: u64 = ioc(IOC_READ | IOC_WRITE, 18, size_of::<InoLookupArgs>());
pub const BTRFS_IOC_DEFAULT_SUBVOL: u64 = ioc(IOC_WRITE, 19, size_of::<u64>());
pub const BTRFS_IOC_WAIT_SYNC: u64 = ioc(IOC_WRITE, 22, size_of::<u64>());
pub const BTRFS_IOC_SNAP_CREATE_V2: u64 = ioc(IOC_WRITE, 23, size_of::<VolArgsV2>());
pub const BTRFS_IOC_START_SYNC: u64 = ioc(IOC_READ, 24, size_of::<u64>());
pub const BTRFS_IOC_SUBVOL_CREATE_V2: u64 = ioc(IOC_WRITE, 24, size_of::<VolArgsV2>());
pub const BTRFS_IOC_SUBVOL_GETFLAGS: u64 = ioc(IOC_READ, 25, size_of::<u64>());
pub const BTRFS_IOC_SUBVOL_SETFLAGS: u64 = ioc(IOC_WRITE, 26, size_of::<u64>());
pub const BTRFS_IOC_GET_SUBVOL_INFO: u64 = ioc(IOC_READ, 60, size_of::<GetSubvolInfoArgs>());
pub const BTRFS_IOC_GET_SUBVOL_ROOTREF: u64 =
    ioc(IOC_READ | IOC_WRITE, 61, size_of::<GetSubvolRootrefArgs>());
pub const BTRFS_IOC_INO_LOOKUP_USER: u64 =
    ioc(IOC_READ | IOC_WRITE, 62, size_of::<InoLookupUserArgs>());

/// `struct btrfs_ioctl_vol_args`
#[repr(C)]
pub struct VolArgs {
    pub fd: i64,
    pub name: [u8; BTRFS_PATH_NAME_MAX + 1],
}

/// `struct btrfs_ioctl_vol_args_v2`, with the size/qgroup union spelled out
#[derive(Debug)]
#[repr(C)]
pub struct VolArgsV2 {
    pub fd: i64,
    pub transid: u64,
    pub flags: u64,
    pub size: u64,
    pub qgroup_inherit: u64,
    pub unused: [u64; 2],
    pub name: [u8; BTRFS_SUBVOL_NAME_MAX + 1],
}

/// `struct btrfs_ioctl_search_key`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

/// `struct btrfs_ioctl_search_args`
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; BTRFS_SEARCH_ARGS_BUFSIZE],
}

/// `struct btrfs_ioctl_search_header`, decoded from the search buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

impl SearchHeader {
    pub const SIZE: usize = 32;

    /// Headers are written in host byte order by the kernel.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            transid: ne_u64(bytes, 0)?,
            objectid: ne_u64(bytes, 8)?,
            offset: ne_u64(bytes, 16)?,
            item_type: u32::from_ne_bytes(bytes.get(24..28)?.try_into().ok()?),
            len: u32::from_ne_bytes(bytes.get(28..32)?.try_into().ok()?),
        })
    }
}

/// `struct btrfs_ioctl_ino_lookup_args`
#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; BTRFS_INO_LOOKUP_PATH_MAX],
}

/// `struct btrfs_ioctl_timespec`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoctlTimespec {
    pub sec: u64,
    pub nsec: u32,
}

/// `struct btrfs_ioctl_get_subvol_info_args`
#[repr(C)]
pub struct GetSubvolInfoArgs {
    pub treeid: u64,
    pub name: [u8; BTRFS_VOL_NAME_MAX + 1],
    pub parent_id: u64,
    pub dirid: u64,
    pub generation: u64,
    pub flags: u64,
    pub uuid: [u8; 16],
    pub parent_uuid: [u8; 16],
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: IoctlTimespec,
    pub otime: IoctlTimespec,
    pub stime: IoctlTimespec,
    pub rtime: IoctlTimespec,
    pub reserved: [u64; 8],
}

/// One entry of `struct btrfs_ioctl_get_subvol_rootref_args`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RootrefEntry {
    pub treeid: u64,
    pub dirid: u64,
}

/// `struct btrfs_ioctl_get_subvol_rootref_args`
#[repr(C)]
pub struct GetSubvolRootrefArgs {
    /// Smallest child id to return; the kernel advances it past the last
    /// entry it filled in.
    pub min_treeid: u64,
    pub rootref: [RootrefEntry; BTRFS_MAX_ROOTREF_BUFFER_NUM],
    pub num_items: u8,
    pub align: [u8; 7],
}

/// `struct btrfs_ioctl_ino_lookup_user_args`
#[repr(C)]
pub struct InoLookupUserArgs {
    pub dirid: u64,
    pub treeid: u64,
    pub name: [u8; BTRFS_VOL_NAME_MAX + 1],
    pub path: [u8; BTRFS_INO_LOOKUP_USER_PATH_MAX],
}

macro_rules! zeroed_args {
    ($($ty:ty),*) => {$(
        impl $ty {
            pub fn zeroed() -> Box<Self> {
                // SAFETY: plain-old-data made of integers and byte arrays.
                unsafe { Box::new(std::mem::zeroed()) }
            }
        }
    )*};
}

zeroed_args!(
    VolArgs,
    VolArgsV2,
    SearchArgs,
    InoLookupArgs,
    GetSubvolInfoArgs,
    GetSubvolRootrefArgs,
    InoLookupUserArgs
);

/// Copy `name` into a fixed NUL-terminated buffer, failing if it does not fit.
pub fn copy_name(dest: &mut [u8], name: &[u8]) -> bool {
    if name.len() >= dest.len() || name.contains(&0) {
        return false;
    }
    dest[..name.len()].copy_from_slice(name);
    dest[name.len()] = 0;
    true
}

/// Bytes of a NUL-terminated buffer up to the terminator.
pub fn c_bytes(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    &buf[..end]
}

pub fn ne_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_ne_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

pub fn le_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

pub fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

pub fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

/// Issue an ioctl whose argument is a pointer to `arg`.
pub fn ioctl_ptr<T>(fd: BorrowedFd<'_>, request: u64, arg: *mut T) -> io::Result<()> {
    // SAFETY: callers pass a request number whose argument layout matches `T`.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Issue an ioctl that takes no argument.
pub fn ioctl_none(fd: BorrowedFd<'_>, request: u64) -> io::Result<()> {
    // SAFETY: the request takes no argument.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_layouts_match_the_kernel() {
        assert_eq!(size_of::<VolArgs>(), 4096);
        assert_eq!(size_of::<VolArgsV2>(), 4096);
        assert_eq!(size_of::<SearchKey>(), 104);
        assert_eq!(size_of::<SearchArgs>(), 4096);
        assert_eq!(size_of::<InoLookupArgs>(), 4096);
        assert_eq!(size_of::<IoctlTimespec>(), 16);
        assert_eq!(size_of::<GetSubvolInfoArgs>(), 504);
        assert_eq!(size_of::<GetSubvolRootrefArgs>(), 4096);
        assert_eq!(size_of::<InoLookupUserArgs>(), 4096);
    }

    #[test]
    fn request_numbers() {
        // Values from linux/btrfs.h on x86_64.
        assert_eq!(BTRFS_IOC_SYNC, 0x9408);
        assert_eq!(BTRFS_IOC_TREE_SEARCH, 0xD000_9411);
        assert_eq!(BTRFS_IOC_INO_LOOKUP, 0xD000_9412);
        assert_eq!(BTRFS_IOC_DEFAULT_SUBVOL, 0x4008_9413);
        assert_eq!(BTRFS_IOC_SUBVOL_CREATE_V2, 0x5000_9418);
        assert_eq!(BTRFS_IOC_START_SYNC, 0x8008_9418);
        assert_eq!(BTRFS_IOC_GET_SUBVOL_INFO, 0x81F8_943C);
        assert_eq!(BTRFS_IOC_GET_SUBVOL_ROOTREF, 0xD000_943D);
        assert_eq!(BTRFS_IOC_INO_LOOKUP_USER, 0xD000_943E);
    }

    #[test]
    fn copy_name_rejects_overflow_and_nul() {
        let mut buf = [0xffu8; 8];
        assert!(copy_name(&mut buf, b"abc"));
        assert_eq!(c_bytes(&buf), b"abc");
        assert!(!copy_name(&mut buf, b"12345678"));
        assert!(!copy_name(&mut buf, b"a\0b"));
    }

    #[test]
    fn parses_search_header() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&7u64.to_ne_bytes());
        raw.extend_from_slice(&5u64.to_ne_bytes());
        raw.extend_from_slice(&257u64.to_ne_bytes());
        raw.extend_from_slice(&BTRFS_ROOT_REF_KEY.to_ne_bytes());
        raw.extend_from_slice(&20u32.to_ne_bytes());

        let header = SearchHeader::parse(&raw).unwrap();
        assert_eq!(header.objectid, 5);
        assert_eq!(header.offset, 257);
        assert_eq!(header.item_type, BTRFS_ROOT_REF_KEY);
        assert_eq!(header.len, 20);
        assert!(SearchHeader::parse(&raw[..31]).is_none());
    }
}
