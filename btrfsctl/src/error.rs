// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Library status codes. The numbering is stable and matches `as_raw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    StopIteration,
    NoMemory,
    InvalidArgument,
    NotBtrfs,
    NotSubvolume,
    SubvolumeNotFound,
    OpenFailed,
    RmdirFailed,
    UnlinkFailed,
    StatFailed,
    StatfsFailed,
    SearchFailed,
    InoLookupFailed,
    SubvolGetflagsFailed,
    SubvolSetflagsFailed,
    SubvolCreateFailed,
    SnapCreateFailed,
    SnapDestroyFailed,
    DefaultSubvolFailed,
    SyncFailed,
    StartSyncFailed,
    WaitSyncFailed,
    GetSubvolInfoFailed,
    GetSubvolRootrefFailed,
    InoLookupUserFailed,
    FsInfoFailed,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 27] = [
        ErrorCode::Ok,
        ErrorCode::StopIteration,
        ErrorCode::NoMemory,
        ErrorCode::InvalidArgument,
        ErrorCode::NotBtrfs,
        ErrorCode::NotSubvolume,
        ErrorCode::SubvolumeNotFound,
        ErrorCode::OpenFailed,
        ErrorCode::RmdirFailed,
        ErrorCode::UnlinkFailed,
        ErrorCode::StatFailed,
        ErrorCode::StatfsFailed,
        ErrorCode::SearchFailed,
        ErrorCode::InoLookupFailed,
        ErrorCode::SubvolGetflagsFailed,
        ErrorCode::SubvolSetflagsFailed,
        ErrorCode::SubvolCreateFailed,
        ErrorCode::SnapCreateFailed,
        ErrorCode::SnapDestroyFailed,
        ErrorCode::DefaultSubvolFailed,
        ErrorCode::SyncFailed,
        ErrorCode::StartSyncFailed,
        ErrorCode::WaitSyncFailed,
        ErrorCode::GetSubvolInfoFailed,
        ErrorCode::GetSubvolRootrefFailed,
        ErrorCode::InoLookupUserFailed,
        ErrorCode::FsInfoFailed,
    ];

    pub fn from_raw(value: i32) -> Option<Self> {
        let index = usize::try_from(value).ok()?;
        Self::ALL.get(index).copied()
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::StopIteration => "Stopped iteration",
            ErrorCode::NoMemory => "Cannot allocate memory",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::NotBtrfs => "Not a Btrfs filesystem",
            ErrorCode::NotSubvolume => "Not a Btrfs subvolume",
            ErrorCode::SubvolumeNotFound => "Subvolume not found",
            ErrorCode::OpenFailed => "Could not open",
            ErrorCode::RmdirFailed => "Could not rmdir",
            ErrorCode::UnlinkFailed => "Could not unlink",
            ErrorCode::StatFailed => "Could not stat",
            ErrorCode::StatfsFailed => "Could not statfs",
            ErrorCode::SearchFailed => "Could not search B-tree",
            ErrorCode::InoLookupFailed => "Could not lookup inode",
            ErrorCode::SubvolGetflagsFailed => "Could not get subvolume flags",
            ErrorCode::SubvolSetflagsFailed => "Could not set subvolume flags",
            ErrorCode::SubvolCreateFailed => "Could not create subvolume",
            ErrorCode::SnapCreateFailed => "Could not create snapshot",
            ErrorCode::SnapDestroyFailed => "Could not destroy subvolume/snapshot",
            ErrorCode::DefaultSubvolFailed => "Could not set default subvolume",
            ErrorCode::SyncFailed => "Could not sync filesystem",
            ErrorCode::StartSyncFailed => "Could not start filesystem sync",
            ErrorCode::WaitSyncFailed => "Could not wait for filesystem sync",
            ErrorCode::GetSubvolInfoFailed => "Could not get subvolume information",
            ErrorCode::GetSubvolRootrefFailed => "Could not get rootref information",
            ErrorCode::InoLookupUserFailed => "Could not resolve subvolume path with user ioctl",
            ErrorCode::FsInfoFailed => "Could not get filesystem information",
        }
    }

    /// Errno reported when no system call supplied a more specific one.
    pub fn default_errno(self) -> i32 {
        match self {
            ErrorCode::Ok | ErrorCode::StopIteration => 0,
            ErrorCode::NoMemory => libc::ENOMEM,
            ErrorCode::InvalidArgument | ErrorCode::NotSubvolume => libc::EINVAL,
            ErrorCode::NotBtrfs => libc::ENOTTY,
            ErrorCode::SubvolumeNotFound => libc::ENOENT,
            _ => libc::EIO,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A library status code paired with the errno of the failing system call
/// and the paths the operation was working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtilError {
    code: ErrorCode,
    errno: i32,
    paths: Vec<PathBuf>,
}

impl UtilError {
    /// Error whose errno comes from the status table.
    pub fn new(code: ErrorCode, paths: &[&Path]) -> Self {
        Self::with_errno(code, code.default_errno(), paths)
    }

    pub fn with_errno(code: ErrorCode, errno: i32, paths: &[&Path]) -> Self {
        Self {
            code,
            errno,
            paths: paths.iter().map(|path| path.to_path_buf()).collect(),
        }
    }

    /// Error for a system call that just failed; the OS errno wins over the table.
    pub fn from_io(code: ErrorCode, error: &io::Error, paths: &[&Path]) -> Self {
        let errno = error.raw_os_error().unwrap_or_else(|| code.default_errno());
        Self::with_errno(code, errno, paths)
    }

    pub fn last_os(code: ErrorCode, paths: &[&Path]) -> Self {
        Self::from_io(code, &io::Error::last_os_error(), paths)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl fmt::Display for UtilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.description())?;
        if self.errno != 0 {
            write!(f, ": {}", io::Error::from_raw_os_error(self.errno))?;
        }
        for (index, path) in self.paths.iter().enumerate() {
            let separator = if index == 0 { ": " } else { ", " };
            write!(f, "{separator}'{}'", path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for UtilError {}

/// Error type for every operation in this crate
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error(transparent)]
    Util(#[from] UtilError),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("iterator is closed")]
    Closed,

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BtrfsError {
    pub(crate) fn util(code: ErrorCode, path: &Path) -> Self {
        BtrfsError::Util(UtilError::new(code, &[path]))
    }

    pub(crate) fn io(code: ErrorCode, error: &io::Error, path: &Path) -> Self {
        BtrfsError::Util(UtilError::from_io(code, error, &[path]))
    }

    pub(crate) fn os(context: impl Into<String>, source: io::Error) -> Self {
        BtrfsError::Os {
            context: context.into(),
            source,
        }
    }

    /// Library status code, if the failure has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            BtrfsError::Util(error) => Some(error.code()),
            BtrfsError::InvalidArgument(_) => Some(ErrorCode::InvalidArgument),
            BtrfsError::Closed | BtrfsError::Os { .. } => None,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            BtrfsError::Util(error) => (error.errno() != 0).then_some(error.errno()),
            BtrfsError::InvalidArgument(_) => Some(libc::EINVAL),
            BtrfsError::Closed => None,
            BtrfsError::Os { source, .. } => source.raw_os_error(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        match self {
            BtrfsError::Util(error) => error.paths(),
            _ => &[],
        }
    }
}

/// Generic I/O handlers see the errno's kind; the original error stays
/// reachable through `get_ref`/`into_inner` for callers that need the code.
impl From<BtrfsError> for io::Error {
    fn from(error: BtrfsError) -> Self {
        let kind = match &error {
            BtrfsError::Os { source, .. } => source.kind(),
            BtrfsError::Closed => io::ErrorKind::InvalidInput,
            other => other
                .raw_os_error()
                .map(|errno| io::Error::from_raw_os_error(errno).kind())
                .unwrap_or(io::ErrorKind::Other),
        };
        io::Error::new(kind, error)
    }
}

/// Turn a status code into an error. `Ok` yields `None`.
///
/// `os_errno` is the errno of the system call that failed, if any; it takes
/// precedence over the code's conventional errno.
pub fn translate(code: ErrorCode, os_errno: Option<i32>, paths: &[&Path]) -> Option<BtrfsError> {
    if code == ErrorCode::Ok {
        return None;
    }
    let errno = os_errno
        .filter(|errno| *errno != 0)
        .unwrap_or_else(|| code.default_errno());
    Some(BtrfsError::Util(UtilError::with_errno(code, errno, paths)))
}

/// Result type alias for btrfs operations
pub type Result<T> = std::result::Result<T, BtrfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_translates_to_nothing() {
        assert!(translate(ErrorCode::Ok, Some(libc::EPERM), &[]).is_none());
    }

    #[test]
    fn table_errno_used_without_os_errno() {
        let err = translate(ErrorCode::SubvolumeNotFound, None, &[Path::new("/mnt/x")]).unwrap();
        assert_eq!(err.code(), Some(ErrorCode::SubvolumeNotFound));
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        let err = translate(ErrorCode::NotSubvolume, None, &[]).unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn os_errno_takes_precedence() {
        let err = translate(ErrorCode::NotBtrfs, Some(libc::EACCES), &[]).unwrap();
        assert_eq!(err.code(), Some(ErrorCode::NotBtrfs));
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn message_names_code_and_paths() {
        let err = UtilError::with_errno(
            ErrorCode::SnapCreateFailed,
            libc::EEXIST,
            &[Path::new("/mnt/src"), Path::new("/mnt/dst")],
        );
        let message = err.to_string();
        assert!(message.starts_with("Could not create snapshot: "));
        assert!(message.contains("'/mnt/src', '/mnt/dst'"));
    }

    #[test]
    fn raw_codes_roundtrip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(ErrorCode::NotBtrfs.as_raw(), 4);
        assert_eq!(ErrorCode::from_raw(-1), None);
        assert_eq!(ErrorCode::from_raw(27), None);
    }

    #[test]
    fn converts_into_generic_io_error() {
        let err = BtrfsError::util(ErrorCode::SubvolumeNotFound, Path::new("/nope"));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);

        let inner = io_err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<BtrfsError>())
            .unwrap();
        assert_eq!(inner.code(), Some(ErrorCode::SubvolumeNotFound));
        assert_eq!(inner.paths(), &[PathBuf::from("/nope")]);
    }

    #[test]
    fn closed_is_not_a_status_code() {
        let err = BtrfsError::Closed;
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "iterator is closed");
    }
}
