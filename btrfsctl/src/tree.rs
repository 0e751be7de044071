// SPDX-License-Identifier: GPL-3.0-only

//! Tree-search primitives over an open btrfs directory descriptor.
//!
//! [`SubvolumeTree`] is what the traversal engine needs: the direct children
//! of a subvolume and the metadata record of one. [`BtrfsTree`] answers both
//! by searching the root tree with `BTRFS_IOC_TREE_SEARCH`, which needs
//! `CAP_SYS_ADMIN`. Without it, [`BtrfsTree::unprivileged`] switches to the
//! per-subvolume ioctls that only see subvolumes reachable below the opened
//! path.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use btrfsctl_types::{FS_TREE_OBJECTID, SubvolumeId, SubvolumeInfo, Timespec};
use nix::sys::statfs::{BTRFS_SUPER_MAGIC, fstatfs};
use uuid::Uuid;

use crate::error::{BtrfsError, ErrorCode, Result, UtilError};
use crate::ioctl::{
    self, BTRFS_DIR_ITEM_KEY, BTRFS_FIRST_FREE_OBJECTID, BTRFS_IOC_GET_SUBVOL_INFO,
    BTRFS_IOC_GET_SUBVOL_ROOTREF, BTRFS_IOC_INO_LOOKUP, BTRFS_IOC_INO_LOOKUP_USER,
    BTRFS_IOC_TREE_SEARCH, BTRFS_ORPHAN_ITEM_KEY, BTRFS_ORPHAN_OBJECTID, BTRFS_ROOT_BACKREF_KEY,
    BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_REF_KEY, BTRFS_ROOT_TREE_DIR_OBJECTID, BTRFS_ROOT_TREE_OBJECTID,
    GetSubvolInfoArgs, GetSubvolRootrefArgs, InoLookupArgs, InoLookupUserArgs, IoctlTimespec,
    SearchArgs, SearchHeader, SearchKey,
};
use crate::root_item::{DirItem, RootItem, RootRef};

/// A direct child of a subvolume, with its path relative to the parent's root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub path: PathBuf,
    pub id: SubvolumeId,
}

/// The two queries the traversal engine makes against a subvolume tree.
pub trait SubvolumeTree {
    /// Direct children of `parent`, in ascending id order.
    fn list_children(&self, parent: SubvolumeId) -> Result<Vec<ChildRef>>;

    fn subvolume_info(&self, id: SubvolumeId) -> Result<SubvolumeInfo>;
}

/// Open a path read-only and confirm it lives on btrfs.
pub(crate) fn open_btrfs(path: &Path) -> Result<File> {
    let file = File::open(path).map_err(|e| BtrfsError::io(ErrorCode::OpenFailed, &e, path))?;
    check_btrfs(file.as_fd(), path)?;
    Ok(file)
}

pub(crate) fn check_btrfs(fd: BorrowedFd<'_>, path: &Path) -> Result<()> {
    let stat = fstatfs(fd)
        .map_err(|errno| BtrfsError::io(ErrorCode::StatfsFailed, &io::Error::from(errno), path))?;
    if stat.filesystem_type() != BTRFS_SUPER_MAGIC {
        return Err(BtrfsError::util(ErrorCode::NotBtrfs, path));
    }
    Ok(())
}

/// Fails with `NotSubvolume` unless `file` is the root directory of a subvolume.
pub(crate) fn check_subvolume(file: &File, path: &Path) -> Result<()> {
    let metadata = file
        .metadata()
        .map_err(|e| BtrfsError::io(ErrorCode::StatFailed, &e, path))?;
    if !metadata.is_dir() || metadata.ino() != BTRFS_FIRST_FREE_OBJECTID {
        return Err(BtrfsError::util(ErrorCode::NotSubvolume, path));
    }
    Ok(())
}

/// Root tree access through one open descriptor
#[derive(Debug)]
pub struct BtrfsTree {
    fd: OwnedFd,
    path: PathBuf,
    user: Option<UserLookups>,
}

/// Subvolumes found so far by an unprivileged walk, by id, with their paths
/// relative to the opened directory.
#[derive(Debug)]
struct UserLookups {
    paths: RefCell<BTreeMap<SubvolumeId, PathBuf>>,
}

impl BtrfsTree {
    /// Open `path` and check that it is on btrfs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open_btrfs(path)?;
        Ok(Self::from_fd(file.into(), path))
    }

    /// Wrap a descriptor that is already known to be on btrfs.
    pub fn from_fd(fd: OwnedFd, path: impl Into<PathBuf>) -> Self {
        Self {
            fd,
            path: path.into(),
            user: None,
        }
    }

    /// Answer [`SubvolumeTree`] queries without the root tree search.
    ///
    /// `top` must be the id of the subvolume whose root is the opened path.
    /// Each subvolume is then opened by path and asked about itself, so
    /// subvolumes that are not reachable or not readable below that path
    /// are left out of listings.
    pub fn unprivileged(mut self, top: SubvolumeId) -> Self {
        let paths = BTreeMap::from([(top, PathBuf::new())]);
        self.user = Some(UserLookups {
            paths: RefCell::new(paths),
        });
        self
    }

    pub fn is_unprivileged(&self) -> bool {
        self.user.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id of the subvolume containing the opened path.
    pub fn subvolume_id(&self) -> Result<SubvolumeId> {
        let args = self.ino_lookup_raw(0, BTRFS_FIRST_FREE_OBJECTID)?;
        Ok(args.treeid)
    }

    /// Path of inode `objectid` inside subvolume `treeid`, relative to that
    /// subvolume's root. Directories come back with a trailing separator.
    pub fn ino_lookup(&self, treeid: SubvolumeId, objectid: u64) -> Result<PathBuf> {
        let args = self.ino_lookup_raw(treeid, objectid)?;
        let name = ioctl::c_bytes(&args.name);
        Ok(PathBuf::from(OsStr::from_bytes(name)))
    }

    fn ino_lookup_raw(&self, treeid: SubvolumeId, objectid: u64) -> Result<Box<InoLookupArgs>> {
        let mut args = InoLookupArgs::zeroed();
        args.treeid = treeid;
        args.objectid = objectid;
        ioctl::ioctl_ptr(self.fd.as_fd(), BTRFS_IOC_INO_LOOKUP, &mut *args)
            .map_err(|e| BtrfsError::io(ErrorCode::InoLookupFailed, &e, &self.path))?;
        Ok(args)
    }

    /// Iterate root tree items of one type under one object id.
    pub fn search_root_tree(&self, objectid: u64, item_type: u32) -> TreeSearch<'_> {
        self.search(SearchKey {
            tree_id: BTRFS_ROOT_TREE_OBJECTID,
            min_objectid: objectid,
            max_objectid: objectid,
            min_type: item_type,
            max_type: item_type,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            ..SearchKey::default()
        })
    }

    pub fn search(&self, key: SearchKey) -> TreeSearch<'_> {
        TreeSearch {
            tree: self,
            key,
            items: VecDeque::new(),
            done: false,
        }
    }

    pub fn root_item(&self, id: SubvolumeId) -> Result<RootItem> {
        let Some((_, data)) = self.search_root_tree(id, BTRFS_ROOT_ITEM_KEY).next().transpose()?
        else {
            return Err(BtrfsError::util(ErrorCode::SubvolumeNotFound, &self.path));
        };
        RootItem::parse(&data).ok_or_else(|| {
            tracing::warn!(id, len = data.len(), "truncated root item");
            BtrfsError::util(ErrorCode::SearchFailed, &self.path)
        })
    }

    /// The parent of subvolume `id` and the reference naming it there.
    /// `None` for the top-level subvolume.
    pub fn root_backref(&self, id: SubvolumeId) -> Result<Option<(SubvolumeId, RootRef)>> {
        let Some((header, data)) = self
            .search_root_tree(id, BTRFS_ROOT_BACKREF_KEY)
            .next()
            .transpose()?
        else {
            return Ok(None);
        };
        let root_ref = RootRef::parse(&data)
            .ok_or_else(|| BtrfsError::util(ErrorCode::SearchFailed, &self.path))?;
        Ok(Some((header.offset, root_ref)))
    }

    /// Path of subvolume `id` relative to the top-level subvolume.
    pub fn subvolume_path(&self, mut id: SubvolumeId) -> Result<PathBuf> {
        let mut components: Vec<PathBuf> = Vec::new();
        while id != FS_TREE_OBJECTID {
            let Some((parent, root_ref)) = self.root_backref(id)? else {
                return Err(BtrfsError::util(ErrorCode::SubvolumeNotFound, &self.path));
            };
            let dir = self.dir_prefix(parent, root_ref.dirid)?;
            components.push(dir.join(OsStr::from_bytes(&root_ref.name)));
            id = parent;
        }
        Ok(components.iter().rev().collect())
    }

    fn dir_prefix(&self, treeid: SubvolumeId, dirid: u64) -> Result<PathBuf> {
        if dirid == BTRFS_FIRST_FREE_OBJECTID {
            return Ok(PathBuf::new());
        }
        self.ino_lookup(treeid, dirid)
    }

    /// Ids of deleted subvolumes whose cleanup has not finished.
    pub fn deleted_subvolumes(&self) -> Result<Vec<SubvolumeId>> {
        let mut ids = Vec::new();
        for item in self.search_root_tree(BTRFS_ORPHAN_OBJECTID, BTRFS_ORPHAN_ITEM_KEY) {
            let (header, _) = item?;
            // An orphan without a root item is already gone.
            if self
                .search_root_tree(header.offset, BTRFS_ROOT_ITEM_KEY)
                .next()
                .transpose()?
                .is_some()
            {
                ids.push(header.offset);
            }
        }
        Ok(ids)
    }

    /// The subvolume mounted when no `subvol=`/`subvolid=` option is given.
    pub fn default_subvolume(&self) -> Result<SubvolumeId> {
        for item in self.search_root_tree(BTRFS_ROOT_TREE_DIR_OBJECTID, BTRFS_DIR_ITEM_KEY) {
            let (_, data) = item?;
            if let Some(dir) = DirItem::parse_all(&data)
                .into_iter()
                .find(|dir| dir.name == b"default")
            {
                return Ok(dir.location_objectid);
            }
        }
        Err(BtrfsError::Util(UtilError::with_errno(
            ErrorCode::DefaultSubvolFailed,
            libc::ENOENT,
            &[&self.path],
        )))
    }
}

impl BtrfsTree {
    /// Open the root of a subvolume an unprivileged walk has already found.
    fn open_found(&self, user: &UserLookups, id: SubvolumeId) -> Result<(File, PathBuf, PathBuf)> {
        let relative = user
            .paths
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| BtrfsError::util(ErrorCode::SubvolumeNotFound, &self.path))?;
        let path = self.path.join(&relative);
        let file = File::open(&path).map_err(|e| BtrfsError::io(ErrorCode::OpenFailed, &e, &path))?;
        Ok((file, path, relative))
    }

    fn user_children(&self, user: &UserLookups, parent: SubvolumeId) -> Result<Vec<ChildRef>> {
        let (dir, path, relative) = self.open_found(user, parent)?;
        let mut children = Vec::new();
        let mut args = GetSubvolRootrefArgs::zeroed();
        loop {
            // EOVERFLOW means the buffer is full and more children remain.
            let more = match ioctl::ioctl_ptr(dir.as_fd(), BTRFS_IOC_GET_SUBVOL_ROOTREF, &mut *args) {
                Ok(()) => false,
                Err(e) if e.raw_os_error() == Some(libc::EOVERFLOW) => true,
                Err(e) => return Err(BtrfsError::io(ErrorCode::GetSubvolRootrefFailed, &e, &path)),
            };
            let count = usize::from(args.num_items).min(args.rootref.len());
            for entry in &args.rootref[..count] {
                let child = match ino_lookup_user(&dir, &path, entry.dirid, entry.treeid) {
                    Ok(child) => child,
                    Err(error)
                        if matches!(error.raw_os_error(), Some(libc::ENOENT | libc::EACCES)) =>
                    {
                        tracing::debug!(id = entry.treeid, %error, "skipping unreachable subvolume");
                        continue;
                    }
                    Err(error) => return Err(error),
                };
                user.paths.borrow_mut().insert(entry.treeid, relative.join(&child));
                children.push(ChildRef {
                    path: child,
                    id: entry.treeid,
                });
            }
            if !more {
                break;
            }
        }
        Ok(children)
    }

    fn user_info(&self, user: &UserLookups, id: SubvolumeId) -> Result<SubvolumeInfo> {
        let (file, path, _) = self.open_found(user, id)?;
        let mut args = GetSubvolInfoArgs::zeroed();
        ioctl::ioctl_ptr(file.as_fd(), BTRFS_IOC_GET_SUBVOL_INFO, &mut *args)
            .map_err(|e| BtrfsError::io(ErrorCode::GetSubvolInfoFailed, &e, &path))?;
        Ok(subvol_info_from_args(&args))
    }
}

/// Name of child subvolume `treeid`, prefixed with the path of its directory
/// `dirid` inside the subvolume `dir` is the root of.
fn ino_lookup_user(dir: &File, path: &Path, dirid: u64, treeid: SubvolumeId) -> Result<PathBuf> {
    let mut args = InoLookupUserArgs::zeroed();
    args.dirid = dirid;
    args.treeid = treeid;
    ioctl::ioctl_ptr(dir.as_fd(), BTRFS_IOC_INO_LOOKUP_USER, &mut *args)
        .map_err(|e| BtrfsError::io(ErrorCode::InoLookupUserFailed, &e, path))?;
    let dir_path = Path::new(OsStr::from_bytes(ioctl::c_bytes(&args.path)));
    Ok(dir_path.join(OsStr::from_bytes(ioctl::c_bytes(&args.name))))
}

fn subvol_info_from_args(args: &GetSubvolInfoArgs) -> SubvolumeInfo {
    let timespec = |ts: IoctlTimespec| Timespec::new(ts.sec, ts.nsec);
    SubvolumeInfo {
        id: args.treeid,
        parent_id: args.parent_id,
        dir_id: args.dirid,
        flags: args.flags,
        uuid: Uuid::from_bytes(args.uuid),
        parent_uuid: Uuid::from_bytes(args.parent_uuid),
        received_uuid: Uuid::from_bytes(args.received_uuid),
        generation: args.generation,
        ctransid: args.ctransid,
        otransid: args.otransid,
        stransid: args.stransid,
        rtransid: args.rtransid,
        ctime: timespec(args.ctime),
        otime: timespec(args.otime),
        stime: timespec(args.stime),
        rtime: timespec(args.rtime),
    }
}

impl SubvolumeTree for BtrfsTree {
    fn list_children(&self, parent: SubvolumeId) -> Result<Vec<ChildRef>> {
        if let Some(user) = &self.user {
            return self.user_children(user, parent);
        }
        let mut children = Vec::new();
        for item in self.search_root_tree(parent, BTRFS_ROOT_REF_KEY) {
            let (header, data) = item?;
            let root_ref = RootRef::parse(&data)
                .ok_or_else(|| BtrfsError::util(ErrorCode::SearchFailed, &self.path))?;
            let dir = self.dir_prefix(parent, root_ref.dirid)?;
            children.push(ChildRef {
                path: dir.join(OsStr::from_bytes(&root_ref.name)),
                id: header.offset,
            });
        }
        Ok(children)
    }

    fn subvolume_info(&self, id: SubvolumeId) -> Result<SubvolumeInfo> {
        if let Some(user) = &self.user {
            return self.user_info(user, id);
        }
        let item = self.root_item(id)?;
        let (parent_id, dir_id) = match self.root_backref(id)? {
            Some((parent, root_ref)) => (parent, root_ref.dirid),
            None => (0, 0),
        };
        Ok(item.into_info(id, parent_id, dir_id))
    }
}

impl AsFd for BtrfsTree {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for BtrfsTree {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Batched walk over the items matching a search key.
///
/// Each ioctl fills one 4 KiB buffer; the key is advanced past the last item
/// returned and the search is repeated until the kernel returns nothing.
pub struct TreeSearch<'a> {
    tree: &'a BtrfsTree,
    key: SearchKey,
    items: VecDeque<(SearchHeader, Vec<u8>)>,
    done: bool,
}

impl TreeSearch<'_> {
    fn fetch(&mut self) -> Result<()> {
        let mut args = SearchArgs::zeroed();
        args.key = self.key;
        args.key.nr_items = 4096;
        ioctl::ioctl_ptr(self.tree.fd.as_fd(), BTRFS_IOC_TREE_SEARCH, &mut *args)
            .map_err(|e| BtrfsError::io(ErrorCode::SearchFailed, &e, &self.tree.path))?;

        let count = args.key.nr_items;
        tracing::trace!(
            tree = self.key.tree_id,
            objectid = self.key.min_objectid,
            count,
            "tree search batch"
        );
        if count == 0 {
            self.done = true;
            return Ok(());
        }

        let mut offset = 0;
        let mut last = None;
        for _ in 0..count {
            let header = args
                .buf
                .get(offset..)
                .and_then(SearchHeader::parse)
                .ok_or_else(|| BtrfsError::util(ErrorCode::SearchFailed, &self.tree.path))?;
            let start = offset + SearchHeader::SIZE;
            let end = start + header.len as usize;
            let data = args
                .buf
                .get(start..end)
                .ok_or_else(|| BtrfsError::util(ErrorCode::SearchFailed, &self.tree.path))?;
            self.items.push_back((header, data.to_vec()));
            last = Some(header);
            offset = end;
        }

        if let Some(last) = last {
            self.done = !advance_key(&mut self.key, &last);
        }
        Ok(())
    }
}

/// Move the search minimum just past `last`. Returns false once the key
/// space is exhausted.
fn advance_key(key: &mut SearchKey, last: &SearchHeader) -> bool {
    key.min_objectid = last.objectid;
    key.min_type = last.item_type;
    key.min_offset = last.offset;
    if key.min_offset < u64::MAX {
        key.min_offset += 1;
    } else if key.min_type < u32::from(u8::MAX) {
        key.min_offset = 0;
        key.min_type += 1;
    } else if key.min_objectid < u64::MAX {
        key.min_offset = 0;
        key.min_type = 0;
        key.min_objectid += 1;
    } else {
        return false;
    }
    (key.min_objectid, key.min_type, key.min_offset)
        <= (key.max_objectid, key.max_type, key.max_offset)
}

impl Iterator for TreeSearch<'_> {
    type Item = Result<(SearchHeader, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.items.is_empty() && !self.done {
            if let Err(error) = self.fetch() {
                self.done = true;
                return Some(Err(error));
            }
        }
        self.items.pop_front().map(Ok)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn header(objectid: u64, item_type: u32, offset: u64) -> SearchHeader {
        SearchHeader {
            transid: 0,
            objectid,
            offset,
            item_type,
            len: 0,
        }
    }

    #[test]
    fn advance_key_steps_offset_then_type_then_objectid() {
        let mut key = SearchKey {
            min_objectid: 5,
            max_objectid: u64::MAX,
            max_type: u32::from(u8::MAX),
            max_offset: u64::MAX,
            ..SearchKey::default()
        };

        assert!(advance_key(&mut key, &header(5, BTRFS_ROOT_REF_KEY, 300)));
        assert_eq!((key.min_objectid, key.min_type, key.min_offset), (5, BTRFS_ROOT_REF_KEY, 301));

        assert!(advance_key(&mut key, &header(5, BTRFS_ROOT_REF_KEY, u64::MAX)));
        assert_eq!((key.min_objectid, key.min_type, key.min_offset), (5, BTRFS_ROOT_REF_KEY + 1, 0));

        assert!(advance_key(&mut key, &header(5, 255, u64::MAX)));
        assert_eq!((key.min_objectid, key.min_type, key.min_offset), (6, 0, 0));
    }

    #[test]
    fn advance_key_stops_past_the_maximum() {
        let mut key = SearchKey {
            min_objectid: 5,
            max_objectid: 5,
            min_type: BTRFS_ROOT_REF_KEY,
            max_type: BTRFS_ROOT_REF_KEY,
            max_offset: u64::MAX,
            ..SearchKey::default()
        };
        assert!(advance_key(&mut key, &header(5, BTRFS_ROOT_REF_KEY, 257)));
        assert!(!advance_key(&mut key, &header(5, BTRFS_ROOT_REF_KEY, u64::MAX)));

        let mut key = SearchKey {
            max_objectid: u64::MAX,
            max_type: 255,
            max_offset: u64::MAX,
            ..SearchKey::default()
        };
        assert!(!advance_key(&mut key, &header(u64::MAX, 255, u64::MAX)));
    }

    #[test]
    fn memory_tree_lists_children_in_id_order() {
        let tree = memory::MemoryTree::new();
        let a = tree.create(FS_TREE_OBJECTID, "a");
        let b = tree.create(FS_TREE_OBJECTID, "b");
        tree.create(a, "nested");

        let children = tree.list_children(FS_TREE_OBJECTID).unwrap();
        let ids: Vec<_> = children.iter().map(|child| child.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(a < b);
    }

    #[test]
    fn subvol_info_args_become_a_record() {
        let mut args = GetSubvolInfoArgs::zeroed();
        args.treeid = 260;
        args.parent_id = 257;
        args.dirid = 300;
        args.flags = 1;
        args.uuid = *Uuid::from_u128(0xaa).as_bytes();
        args.parent_uuid = *Uuid::from_u128(0xbb).as_bytes();
        args.otransid = 12;
        args.otime = IoctlTimespec {
            sec: 1_700_000_000,
            nsec: 5,
        };

        let info = subvol_info_from_args(&args);
        assert_eq!(info.id, 260);
        assert_eq!(info.parent_id, 257);
        assert_eq!(info.dir_id, 300);
        assert!(info.is_read_only());
        assert_eq!(info.uuid, Uuid::from_u128(0xaa));
        assert_eq!(info.parent(), Some(Uuid::from_u128(0xbb)));
        assert_eq!(info.received(), None);
        assert_eq!(info.otransid, 12);
        assert_eq!(info.otime, Timespec::new(1_700_000_000, 5));
    }

    #[test]
    fn unprivileged_lookups_only_know_the_opened_subvolume() {
        let file = File::open("/").unwrap();
        let tree = BtrfsTree::from_fd(file.into(), "/");
        assert!(!tree.is_unprivileged());

        let tree = tree.unprivileged(300);
        assert!(tree.is_unprivileged());
        let error = tree.subvolume_info(301).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::SubvolumeNotFound));
        let error = tree.list_children(301).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::SubvolumeNotFound));
    }

    #[test]
    fn open_missing_path_reports_open_failure() {
        let error = BtrfsTree::open("/nonexistent/btrfsctl-test").unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::OpenFailed));
        assert_eq!(error.raw_os_error(), Some(libc::ENOENT));
    }
}
