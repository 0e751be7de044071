// SPDX-License-Identifier: GPL-3.0-only

//! Depth-first walk over the subvolumes below a starting subvolume.
//!
//! The walk keeps an explicit stack of pending subvolumes instead of
//! recursing, so arbitrarily deep trees cost heap, not call stack. Children
//! of a subvolume are fetched only when that subvolume is reached.

use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use btrfsctl_types::{SubvolumeEntryRecord, SubvolumeId, SubvolumeInfo};
use nix::unistd::geteuid;

use crate::error::{BtrfsError, Result};
use crate::tree::{BtrfsTree, SubvolumeTree, check_subvolume, open_btrfs};

/// How a [`SubvolumeIterator`] walks and what it yields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorOptions {
    pub top: Option<SubvolumeId>,
    pub post_order: bool,
    pub info: bool,
}

impl IteratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from subvolume `id` instead of the one the opened path names.
    pub fn top(mut self, id: SubvolumeId) -> Self {
        self.top = Some(id);
        self
    }

    /// Yield each subvolume after all of its descendants.
    pub fn post_order(mut self, post_order: bool) -> Self {
        self.post_order = post_order;
        self
    }

    /// Yield full metadata records instead of bare ids.
    pub fn info(mut self, info: bool) -> Self {
        self.info = info;
        self
    }
}

/// One subvolume found by the walk, with its path relative to the start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubvolumeEntry {
    Id { path: PathBuf, id: SubvolumeId },
    Info { path: PathBuf, info: Box<SubvolumeInfo> },
}

impl SubvolumeEntry {
    pub fn path(&self) -> &Path {
        match self {
            SubvolumeEntry::Id { path, .. } | SubvolumeEntry::Info { path, .. } => path,
        }
    }

    pub fn id(&self) -> SubvolumeId {
        match self {
            SubvolumeEntry::Id { id, .. } => *id,
            SubvolumeEntry::Info { info, .. } => info.id,
        }
    }

    pub fn info(&self) -> Option<&SubvolumeInfo> {
        match self {
            SubvolumeEntry::Id { .. } => None,
            SubvolumeEntry::Info { info, .. } => Some(info),
        }
    }

    pub fn into_record(self) -> SubvolumeEntryRecord {
        match self {
            SubvolumeEntry::Id { path, id } => SubvolumeEntryRecord {
                path: path.to_string_lossy().into_owned(),
                id,
                info: None,
            },
            SubvolumeEntry::Info { path, info } => SubvolumeEntryRecord {
                path: path.to_string_lossy().into_owned(),
                id: info.id,
                info: Some(*info),
            },
        }
    }
}

#[derive(Debug)]
struct Frame {
    id: SubvolumeId,
    path: PathBuf,
    /// Post-order only: children are already on the stack above this frame.
    expanded: bool,
}

/// Lazy walk over a subvolume tree.
///
/// Holds the tree handle (for [`BtrfsTree`], an open descriptor) until
/// [`close`](Self::close) or drop. The starting subvolume itself is never
/// yielded. Siblings come out in ascending id order.
///
/// ```no_run
/// use btrfsctl::{IteratorOptions, SubvolumeIterator};
///
/// let iter = SubvolumeIterator::open("/mnt", IteratorOptions::new().post_order(true))?;
/// for entry in iter {
///     let entry = entry?;
///     println!("{} {}", entry.id(), entry.path().display());
/// }
/// # Ok::<(), btrfsctl::BtrfsError>(())
/// ```
#[derive(Debug)]
pub struct SubvolumeIterator<T: SubvolumeTree = BtrfsTree> {
    tree: Option<T>,
    top: SubvolumeId,
    options: IteratorOptions,
    stack: Vec<Frame>,
    seeded: bool,
}

impl SubvolumeIterator<BtrfsTree> {
    /// Open `path` and prepare a walk below it, or below `options.top`.
    ///
    /// Fails with `NotBtrfs` when `path` is on another filesystem and with
    /// `OpenFailed` when it cannot be opened. Without `options.top`, `path`
    /// must be a subvolume root (`NotSubvolume` otherwise) and a caller that
    /// is not root walks with [`BtrfsTree::unprivileged`].
    pub fn open(path: impl AsRef<Path>, options: IteratorOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = open_btrfs(path)?;
        if let Some(top) = options.top {
            return Ok(Self::opened(BtrfsTree::from_fd(file.into(), path), top, options));
        }
        check_subvolume(&file, path)?;
        let tree = BtrfsTree::from_fd(file.into(), path);
        let top = tree.subvolume_id()?;
        let tree = if geteuid().is_root() {
            tree
        } else {
            tree.unprivileged(top)
        };
        Ok(Self::opened(tree, top, options))
    }

    fn opened(tree: BtrfsTree, top: SubvolumeId, options: IteratorOptions) -> Self {
        tracing::debug!(
            path = %tree.path().display(),
            top,
            unprivileged = tree.is_unprivileged(),
            ?options,
            "opened subvolume iterator"
        );
        Self::with_tree(tree, top, options)
    }

    /// Descriptor held by the iterator.
    pub fn fd(&self) -> Result<RawFd> {
        self.tree
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(BtrfsError::Closed)
    }
}

impl<T: SubvolumeTree> SubvolumeIterator<T> {
    pub fn with_tree(tree: T, top: SubvolumeId, options: IteratorOptions) -> Self {
        Self {
            tree: Some(tree),
            top,
            options,
            stack: Vec::new(),
            seeded: false,
        }
    }

    pub fn top(&self) -> SubvolumeId {
        self.top
    }

    pub fn options(&self) -> IteratorOptions {
        self.options
    }

    pub fn is_closed(&self) -> bool {
        self.tree.is_none()
    }

    /// Release the tree handle. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.tree.take().is_some() {
            tracing::trace!(top = self.top, "closed subvolume iterator");
        }
        self.stack.clear();
    }

    /// Next subvolume, `Ok(None)` once the walk is complete.
    ///
    /// Fails with [`BtrfsError::Closed`] after [`close`](Self::close). A
    /// failed lookup aborts the walk; the iterator stays open but should be
    /// discarded.
    pub fn next_entry(&mut self) -> Result<Option<SubvolumeEntry>> {
        let tree = self.tree.as_ref().ok_or(BtrfsError::Closed)?;
        if !self.seeded {
            push_children(tree, &mut self.stack, self.top, Path::new(""))?;
            self.seeded = true;
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if self.options.post_order && !frame.expanded {
                frame.expanded = true;
                let (id, path) = (frame.id, frame.path.clone());
                push_children(tree, &mut self.stack, id, &path)?;
                continue;
            }

            let Some(frame) = self.stack.pop() else {
                return Ok(None);
            };
            if !self.options.post_order {
                push_children(tree, &mut self.stack, frame.id, &frame.path)?;
            }
            return make_entry(tree, self.options.info, frame).map(Some);
        }
    }
}

/// Push the children of `id` so that the lowest id is on top.
fn push_children<T: SubvolumeTree>(
    tree: &T,
    stack: &mut Vec<Frame>,
    id: SubvolumeId,
    prefix: &Path,
) -> Result<()> {
    let children = tree.list_children(id)?;
    stack.extend(children.into_iter().rev().map(|child| Frame {
        id: child.id,
        path: prefix.join(child.path),
        expanded: false,
    }));
    Ok(())
}

fn make_entry<T: SubvolumeTree>(tree: &T, info: bool, frame: Frame) -> Result<SubvolumeEntry> {
    if !info {
        return Ok(SubvolumeEntry::Id {
            path: frame.path,
            id: frame.id,
        });
    }
    let info = tree.subvolume_info(frame.id)?;
    Ok(SubvolumeEntry::Info {
        path: frame.path,
        info: Box::new(info),
    })
}

impl<T: SubvolumeTree> Iterator for SubvolumeIterator<T> {
    type Item = Result<SubvolumeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use btrfsctl_types::FS_TREE_OBJECTID;

    use super::*;
    use crate::error::ErrorCode;
    use crate::tree::memory::MemoryTree;

    fn paths<T: SubvolumeTree>(iter: SubvolumeIterator<T>) -> Vec<String> {
        iter.map(|entry| entry.unwrap().path().to_string_lossy().into_owned())
            .collect()
    }

    /// S -> A -> B, with S a direct child of the top level.
    fn chain() -> (MemoryTree, SubvolumeId, SubvolumeId, SubvolumeId) {
        let tree = MemoryTree::new();
        let s = tree.create(FS_TREE_OBJECTID, "S");
        let a = tree.create(s, "A");
        let b = tree.create(a, "B");
        (tree, s, a, b)
    }

    #[test]
    fn children_are_single_segments() {
        let tree = MemoryTree::new();
        let s = tree.create(FS_TREE_OBJECTID, "S");
        for n in 0..5 {
            tree.create(s, &format!("child{n}"));
        }

        let entries: Vec<_> = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 5);
        for entry in &entries {
            assert_eq!(entry.path().components().count(), 1);
        }
    }

    #[test]
    fn pre_order_yields_parent_first() {
        let (tree, s, _, _) = chain();
        let iter = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new());
        assert_eq!(paths(iter), vec!["A", "A/B"]);
    }

    #[test]
    fn post_order_yields_descendants_first() {
        let (tree, s, _, _) = chain();
        let iter = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new().post_order(true));
        assert_eq!(paths(iter), vec!["A/B", "A"]);
    }

    #[test]
    fn orders_hold_across_siblings() {
        let tree = MemoryTree::new();
        let s = tree.create(FS_TREE_OBJECTID, "S");
        let a = tree.create(s, "a");
        let b = tree.create(s, "b");
        tree.create(a, "a1");
        tree.create(b, "b1");
        tree.create(a, "a2");
        let tree = Arc::new(tree);

        let pre = SubvolumeIterator::with_tree(ArcTree(tree.clone()), s, IteratorOptions::new());
        assert_eq!(paths(pre), vec!["a", "a/a1", "a/a2", "b", "b/b1"]);

        let post = SubvolumeIterator::with_tree(
            ArcTree(tree),
            s,
            IteratorOptions::new().post_order(true),
        );
        assert_eq!(paths(post), vec!["a/a1", "a/a2", "a", "b/b1", "b"]);
    }

    #[test]
    fn walk_starts_below_the_given_subvolume() {
        let (tree, _, _, _) = chain();
        let iter = SubvolumeIterator::with_tree(tree, FS_TREE_OBJECTID, IteratorOptions::new());
        assert_eq!(paths(iter), vec!["S", "S/A", "S/A/B"]);

        let (tree, _, a, b) = chain();
        let entries: Vec<_> = SubvolumeIterator::with_tree(tree, a, IteratorOptions::new())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), b);
        assert_eq!(entries[0].path(), Path::new("B"));
    }

    #[test]
    fn info_entries_carry_snapshot_origin() {
        let tree = MemoryTree::new();
        let s = tree.create(FS_TREE_OBJECTID, "S");
        let base = tree.create(s, "base");
        let snap = tree.snapshot(base, s, "snap");
        let base_uuid = tree.info(base).uuid;

        let entries: Vec<_> = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new().info(true))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);

        let base_entry = entries[0].info().unwrap();
        assert_eq!(base_entry.id, base);
        assert_eq!(base_entry.parent(), None);

        let snap_entry = entries[1].info().unwrap();
        assert_eq!(snap_entry.id, snap);
        assert_eq!(snap_entry.parent_uuid, base_uuid);
        assert_eq!(entries[1].path(), Path::new("snap"));
    }

    #[test]
    fn close_is_idempotent_and_next_fails_afterwards() {
        let (tree, s, _, _) = chain();
        let mut iter = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new());
        assert!(iter.next().is_some());

        iter.close();
        iter.close();
        assert!(iter.is_closed());
        assert!(matches!(iter.next_entry(), Err(BtrfsError::Closed)));
        assert!(matches!(iter.next(), Some(Err(BtrfsError::Closed))));
    }

    #[test]
    fn exhaustion_is_not_an_error() {
        let tree = MemoryTree::new();
        let s = tree.create(FS_TREE_OBJECTID, "S");
        let mut iter = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new());
        assert!(matches!(iter.next_entry(), Ok(None)));
        assert!(iter.next().is_none());
        assert!(!iter.is_closed());
    }

    #[test]
    fn lookup_failure_aborts_the_walk() {
        let (tree, s, a, _) = chain();
        tree.fail_on(a);
        let mut iter = SubvolumeIterator::with_tree(tree, s, IteratorOptions::new());

        let error = iter.next().unwrap().unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::SearchFailed));
        assert_eq!(error.raw_os_error(), Some(libc::EIO));
        assert!(!iter.is_closed());
        iter.close();
    }

    #[test]
    fn concurrent_creations_are_all_visible() {
        let tree = Arc::new(MemoryTree::new());
        let s = tree.create(FS_TREE_OBJECTID, "S");

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let tree = tree.clone();
                thread::spawn(move || tree.create(s, &format!("sub{n}")))
            })
            .collect();
        let mut created: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        created.sort_unstable();
        created.dedup();
        assert_eq!(created.len(), 8);

        let mut seen: Vec<_> = SubvolumeIterator::with_tree(ArcTree(tree), s, IteratorOptions::new())
            .map(|entry| entry.unwrap().id())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, created);
    }

    #[test]
    fn open_rejects_other_filesystems() {
        for options in [IteratorOptions::new(), IteratorOptions::new().top(FS_TREE_OBJECTID)] {
            let error = SubvolumeIterator::open("/proc", options).unwrap_err();
            assert_eq!(error.code(), Some(ErrorCode::NotBtrfs));
            assert_eq!(error.raw_os_error(), Some(libc::ENOTTY));
        }
    }

    #[test]
    fn open_missing_path_fails_to_open() {
        let error =
            SubvolumeIterator::open("/nonexistent/btrfsctl/walk", IteratorOptions::new()).unwrap_err();
        assert_eq!(error.code(), Some(ErrorCode::OpenFailed));
        assert_eq!(error.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn entry_converts_to_record() {
        let entry = SubvolumeEntry::Id {
            path: PathBuf::from("a/b"),
            id: 300,
        };
        let record = entry.into_record();
        assert_eq!(record.path, "a/b");
        assert_eq!(record.id, 300);
        assert!(record.info.is_none());
    }

    struct ArcTree(Arc<MemoryTree>);

    impl SubvolumeTree for ArcTree {
        fn list_children(&self, parent: SubvolumeId) -> Result<Vec<crate::tree::ChildRef>> {
            self.0.list_children(parent)
        }

        fn subvolume_info(&self, id: SubvolumeId) -> Result<SubvolumeInfo> {
            self.0.subvolume_info(id)
        }
    }
}
