// SPDX-License-Identifier: GPL-3.0-only

//! Subvolume operations.
//!
//! Each function opens what it needs, issues the ioctl and closes again;
//! nothing is cached between calls. [`SubvolumeManager`] scopes the same
//! operations to one mounted filesystem and returns serializable records.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use btrfsctl_types::{FS_TREE_OBJECTID, SubvolumeId, SubvolumeInfo, SubvolumeList};
use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};

use crate::error::{BtrfsError, ErrorCode, Result, UtilError};
use crate::ioctl::{
    self, BTRFS_FIRST_FREE_OBJECTID, BTRFS_IOC_DEFAULT_SUBVOL, BTRFS_IOC_SNAP_CREATE_V2,
    BTRFS_IOC_SNAP_DESTROY, BTRFS_IOC_SUBVOL_CREATE_V2, BTRFS_IOC_SUBVOL_GETFLAGS,
    BTRFS_IOC_SUBVOL_SETFLAGS, BTRFS_SUBVOL_QGROUP_INHERIT, BTRFS_SUBVOL_RDONLY, VolArgs,
    VolArgsV2,
};
use crate::iterator::{IteratorOptions, SubvolumeEntry, SubvolumeIterator};
use crate::qgroup::QgroupInherit;
use crate::tree::{BtrfsTree, SubvolumeTree, check_subvolume, open_btrfs};

/// Whether `path` is the root of a btrfs subvolume.
///
/// Paths on other filesystems and ordinary directories give `false`; a path
/// that cannot be examined at all is an error.
pub fn is_subvolume(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let metadata = fs::metadata(path).map_err(|e| BtrfsError::io(ErrorCode::StatFailed, &e, path))?;
    let stat = statfs(path).map_err(|errno| {
        BtrfsError::io(ErrorCode::StatfsFailed, &io::Error::from(errno), path)
    })?;
    if stat.filesystem_type() != BTRFS_SUPER_MAGIC {
        return Ok(false);
    }
    Ok(metadata.is_dir() && metadata.ino() == BTRFS_FIRST_FREE_OBJECTID)
}

/// Id of the subvolume containing `path`.
pub fn subvolume_id(path: impl AsRef<Path>) -> Result<SubvolumeId> {
    BtrfsTree::open(path)?.subvolume_id()
}

/// Path of subvolume `id` relative to the top-level subvolume. `id == 0`
/// means the subvolume containing `path`.
pub fn subvolume_path(path: impl AsRef<Path>, id: SubvolumeId) -> Result<PathBuf> {
    let tree = BtrfsTree::open(path)?;
    let id = if id == 0 { tree.subvolume_id()? } else { id };
    tree.subvolume_path(id)
}

/// Metadata record of subvolume `id`, or of the subvolume `path` names when
/// `id == 0`; `path` must then be a subvolume root.
pub fn subvolume_info(path: impl AsRef<Path>, id: SubvolumeId) -> Result<SubvolumeInfo> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    if id == 0 {
        check_subvolume(&file, path)?;
    }
    let tree = BtrfsTree::from_fd(file.into(), path);
    let id = if id == 0 { tree.subvolume_id()? } else { id };
    tree.subvolume_info(id)
}

fn get_flags(file: &File, path: &Path) -> Result<u64> {
    let mut flags = 0u64;
    ioctl::ioctl_ptr(file.as_fd(), BTRFS_IOC_SUBVOL_GETFLAGS, &mut flags)
        .map_err(|e| BtrfsError::io(ErrorCode::SubvolGetflagsFailed, &e, path))?;
    Ok(flags)
}

pub fn get_subvolume_read_only(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    check_subvolume(&file, path)?;
    Ok(get_flags(&file, path)? & BTRFS_SUBVOL_RDONLY != 0)
}

pub fn set_subvolume_read_only(path: impl AsRef<Path>, read_only: bool) -> Result<()> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    check_subvolume(&file, path)?;
    let mut flags = get_flags(&file, path)?;
    if read_only {
        flags |= BTRFS_SUBVOL_RDONLY;
    } else {
        flags &= !BTRFS_SUBVOL_RDONLY;
    }
    ioctl::ioctl_ptr(file.as_fd(), BTRFS_IOC_SUBVOL_SETFLAGS, &mut flags)
        .map_err(|e| BtrfsError::io(ErrorCode::SubvolSetflagsFailed, &e, path))?;
    tracing::debug!(path = %path.display(), read_only, "set subvolume flags");
    Ok(())
}

/// The subvolume mounted by default on the filesystem containing `path`.
pub fn get_default_subvolume(path: impl AsRef<Path>) -> Result<SubvolumeId> {
    BtrfsTree::open(path)?.default_subvolume()
}

/// Make subvolume `id` the default. `id == 0` means the subvolume `path` names.
pub fn set_default_subvolume(path: impl AsRef<Path>, id: SubvolumeId) -> Result<()> {
    let path = path.as_ref();
    let file = open_btrfs(path)?;
    if id == 0 {
        check_subvolume(&file, path)?;
    }
    let tree = BtrfsTree::from_fd(file.into(), path);
    let mut id = if id == 0 { tree.subvolume_id()? } else { id };
    ioctl::ioctl_ptr(tree.as_fd(), BTRFS_IOC_DEFAULT_SUBVOL, &mut id)
        .map_err(|e| BtrfsError::io(ErrorCode::DefaultSubvolFailed, &e, path))?;
    tracing::debug!(path = %path.display(), id, "set default subvolume");
    Ok(())
}

/// Split `path` into its parent directory and final component.
fn split_path(path: &Path) -> Result<(&Path, &OsStr)> {
    let name = path
        .file_name()
        .ok_or_else(|| BtrfsError::util(ErrorCode::InvalidArgument, path))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((parent, name))
}

fn vol_args_v2(name: &OsStr, path: &Path) -> Result<Box<VolArgsV2>> {
    let mut args = VolArgsV2::zeroed();
    if !ioctl::copy_name(&mut args.name, name.as_bytes()) {
        return Err(BtrfsError::util(ErrorCode::InvalidArgument, path));
    }
    Ok(args)
}

fn attach_qgroups(args: &mut VolArgsV2, buffer: &[u64]) {
    args.flags |= BTRFS_SUBVOL_QGROUP_INHERIT;
    args.size = std::mem::size_of_val(buffer) as u64;
    args.qgroup_inherit = buffer.as_ptr() as u64;
}

/// Create an empty subvolume at `path`, optionally joining quota groups.
pub fn create_subvolume(path: impl AsRef<Path>, qgroup: Option<&QgroupInherit>) -> Result<()> {
    let path = path.as_ref();
    let (parent, name) = split_path(path)?;
    let mut args = vol_args_v2(name, path)?;
    let parent_dir = open_btrfs(parent)?;

    // Must outlive the ioctl: the kernel reads it through a raw pointer.
    let buffer = qgroup.map(QgroupInherit::to_ioctl_buffer);
    if let Some(buffer) = &buffer {
        attach_qgroups(&mut args, buffer);
    }

    ioctl::ioctl_ptr(parent_dir.as_fd(), BTRFS_IOC_SUBVOL_CREATE_V2, &mut *args)
        .map_err(|e| BtrfsError::io(ErrorCode::SubvolCreateFailed, &e, path))?;
    tracing::debug!(path = %path.display(), qgroups = qgroup.map_or(0, QgroupInherit::len), "created subvolume");
    Ok(())
}

/// How [`create_snapshot`] copies its source
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions<'a> {
    pub read_only: bool,
    /// Also snapshot every subvolume nested below the source.
    pub recursive: bool,
    pub qgroup: Option<&'a QgroupInherit>,
}

impl<'a> SnapshotOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn qgroup(mut self, qgroup: &'a QgroupInherit) -> Self {
        self.qgroup = Some(qgroup);
        self
    }
}

fn snapshot_one(
    source: &Path,
    dest: &Path,
    read_only: bool,
    qgroup: Option<&QgroupInherit>,
) -> Result<()> {
    let (parent, name) = split_path(dest)?;
    let mut args = vol_args_v2(name, dest)?;
    let source_dir = File::open(source).map_err(|e| BtrfsError::io(ErrorCode::OpenFailed, &e, source))?;
    let parent_dir = open_btrfs(parent)?;

    args.fd = i64::from(source_dir.as_raw_fd());
    if read_only {
        args.flags |= BTRFS_SUBVOL_RDONLY;
    }
    let buffer = qgroup.map(QgroupInherit::to_ioctl_buffer);
    if let Some(buffer) = &buffer {
        attach_qgroups(&mut args, buffer);
    }

    ioctl::ioctl_ptr(parent_dir.as_fd(), BTRFS_IOC_SNAP_CREATE_V2, &mut *args).map_err(|e| {
        BtrfsError::Util(UtilError::from_io(
            ErrorCode::SnapCreateFailed,
            &e,
            &[source, dest],
        ))
    })?;
    tracing::debug!(source = %source.display(), dest = %dest.display(), read_only, "created snapshot");
    Ok(())
}

/// Snapshot `source` to `dest`.
///
/// Without `recursive`, nested subvolumes of the source show up in the
/// snapshot as empty directories. With it, each of them is snapshotted into
/// its place as well; a read-only recursive snapshot is assembled writable
/// and flipped to read-only once complete.
pub fn create_snapshot(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    options: SnapshotOptions<'_>,
) -> Result<()> {
    let (source, dest) = (source.as_ref(), dest.as_ref());
    if !options.recursive {
        return snapshot_one(source, dest, options.read_only, options.qgroup);
    }

    snapshot_one(source, dest, false, options.qgroup)?;
    let mut nested = Vec::new();
    for entry in SubvolumeIterator::open(source, IteratorOptions::new())? {
        let relative = entry?.path().to_path_buf();
        let placeholder = dest.join(&relative);
        fs::remove_dir(&placeholder).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOTEMPTY) {
                tracing::warn!(path = %placeholder.display(), "nested subvolume placeholder is not empty");
            }
            BtrfsError::io(ErrorCode::RmdirFailed, &e, &placeholder)
        })?;
        snapshot_one(&source.join(&relative), &placeholder, false, None)?;
        nested.push(placeholder);
    }

    if options.read_only {
        for path in nested.iter().map(PathBuf::as_path).chain([dest]) {
            set_subvolume_read_only(path, true)?;
        }
    }
    Ok(())
}

fn destroy_one(path: &Path) -> Result<()> {
    let (parent, name) = split_path(path)?;
    let mut args = VolArgs::zeroed();
    if !ioctl::copy_name(&mut args.name, name.as_bytes()) {
        return Err(BtrfsError::util(ErrorCode::InvalidArgument, path));
    }
    let parent_dir = open_btrfs(parent)?;
    ioctl::ioctl_ptr(parent_dir.as_fd(), BTRFS_IOC_SNAP_DESTROY, &mut *args)
        .map_err(|e| BtrfsError::io(ErrorCode::SnapDestroyFailed, &e, path))?;
    tracing::debug!(path = %path.display(), "deleted subvolume");
    Ok(())
}

/// Delete the subvolume at `path`.
///
/// With `recursive`, nested subvolumes are deleted first, deepest first.
/// Without it, a subvolume that still contains others cannot be deleted.
pub fn delete_subvolume(path: impl AsRef<Path>, recursive: bool) -> Result<()> {
    let path = path.as_ref();
    if recursive {
        let walk = SubvolumeIterator::open(path, IteratorOptions::new().post_order(true))?;
        for entry in walk {
            destroy_one(&path.join(entry?.path()))?;
        }
    }
    destroy_one(path)
}

/// Ids of deleted subvolumes not yet cleaned up on the filesystem containing `path`.
pub fn deleted_subvolumes(path: impl AsRef<Path>) -> Result<Vec<SubvolumeId>> {
    BtrfsTree::open(path)?.deleted_subvolumes()
}

/// Subvolume management scoped to one mounted filesystem
#[derive(Debug, Clone)]
pub struct SubvolumeManager {
    mount_point: PathBuf,
}

impl SubvolumeManager {
    /// Create a manager for `mount_point`, which must be on btrfs.
    pub fn new<P: Into<PathBuf>>(mount_point: P) -> Result<Self> {
        let mount_point = mount_point.into();
        open_btrfs(&mount_point)?;
        Ok(Self { mount_point })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.mount_point.join(path)
    }

    /// Every subvolume on the filesystem with its metadata, paths relative
    /// to the top-level subvolume.
    pub fn list_all(&self) -> Result<SubvolumeList> {
        let options = IteratorOptions::new().top(FS_TREE_OBJECTID).info(true);
        let subvolumes = SubvolumeIterator::open(&self.mount_point, options)?
            .map(|entry| entry.map(SubvolumeEntry::into_record))
            .collect::<Result<Vec<_>>>()?;
        let default_id = self.get_default()?;
        tracing::debug!(count = subvolumes.len(), default_id, "listed subvolumes");
        Ok(SubvolumeList {
            subvolumes,
            default_id,
        })
    }

    pub fn info(&self, path: &Path) -> Result<SubvolumeInfo> {
        subvolume_info(self.resolve(path), 0)
    }

    /// Create a subvolume `name` below the mount point.
    pub fn create(&self, name: &str, qgroup: Option<&QgroupInherit>) -> Result<SubvolumeInfo> {
        let path = self.resolve(Path::new(name));
        create_subvolume(&path, qgroup)?;
        tracing::info!(path = %path.display(), "created subvolume");
        subvolume_info(&path, 0)
    }

    pub fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = self.resolve(path);
        delete_subvolume(&path, recursive)?;
        tracing::info!(path = %path.display(), recursive, "deleted subvolume");
        Ok(())
    }

    pub fn snapshot(&self, source: &Path, dest: &Path, options: SnapshotOptions<'_>) -> Result<SubvolumeInfo> {
        let (source, dest) = (self.resolve(source), self.resolve(dest));
        create_snapshot(&source, &dest, options)?;
        tracing::info!(
            source = %source.display(),
            dest = %dest.display(),
            read_only = options.read_only,
            recursive = options.recursive,
            "created snapshot"
        );
        subvolume_info(&dest, 0)
    }

    pub fn get_readonly(&self, path: &Path) -> Result<bool> {
        get_subvolume_read_only(self.resolve(path))
    }

    pub fn set_readonly(&self, path: &Path, read_only: bool) -> Result<()> {
        let path = self.resolve(path);
        set_subvolume_read_only(&path, read_only)?;
        tracing::info!(path = %path.display(), read_only, "changed read-only flag");
        Ok(())
    }

    /// Make the subvolume at `path` the default.
    pub fn set_default(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        set_default_subvolume(&path, 0)?;
        tracing::info!(path = %path.display(), "set default subvolume");
        Ok(())
    }

    pub fn get_default(&self) -> Result<SubvolumeId> {
        get_default_subvolume(&self.mount_point)
    }

    /// Deleted subvolumes pending cleanup.
    pub fn list_deleted(&self) -> Result<Vec<SubvolumeId>> {
        deleted_subvolumes(&self.mount_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_uses_current_directory_for_bare_names() {
        let (parent, name) = split_path(Path::new("snap")).unwrap();
        assert_eq!(parent, Path::new("."));
        assert_eq!(name, "snap");

        let (parent, name) = split_path(Path::new("/mnt/pool/snap")).unwrap();
        assert_eq!(parent, Path::new("/mnt/pool"));
        assert_eq!(name, "snap");
    }

    #[test]
    fn split_path_rejects_paths_without_a_name() {
        let error = split_path(Path::new("/")).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::InvalidArgument));
        assert_eq!(error.paths(), &[PathBuf::from("/")]);
        assert!(split_path(Path::new("/mnt/..")).is_err());
    }

    #[test]
    fn overlong_names_are_rejected_before_any_ioctl() {
        let name = "x".repeat(ioctl::BTRFS_SUBVOL_NAME_MAX + 1);
        let error = vol_args_v2(OsStr::new(&name), Path::new(&name)).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::InvalidArgument));
        assert!(vol_args_v2(OsStr::new("ok"), Path::new("ok")).is_ok());
    }

    #[test]
    fn qgroup_buffer_is_attached_by_pointer() {
        let inherit: QgroupInherit = [257u64, 258].into_iter().collect();
        let buffer = inherit.to_ioctl_buffer();
        let mut args = VolArgsV2::zeroed();
        attach_qgroups(&mut args, &buffer);
        assert_eq!(args.flags, BTRFS_SUBVOL_QGROUP_INHERIT);
        assert_eq!(args.size, 11 * 8);
        assert_eq!(args.qgroup_inherit, buffer.as_ptr() as u64);
    }

    #[test]
    fn missing_paths_report_the_failing_step() {
        let missing = Path::new("/nonexistent/btrfsctl-subvolume");
        let error = is_subvolume(missing).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::StatFailed));
        assert_eq!(error.raw_os_error(), Some(libc::ENOENT));

        let error = subvolume_id(missing).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::OpenFailed));
    }

    #[test]
    fn non_btrfs_directory_is_not_a_subvolume() {
        // /proc is never btrfs.
        assert!(!is_subvolume("/proc").unwrap());
        let error = subvolume_id("/proc").unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::NotBtrfs));
        assert_eq!(error.raw_os_error(), Some(libc::ENOTTY));
    }
}
