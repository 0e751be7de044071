// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem creation.
//!
//! [`FormatRequest`] collects and validates the parameters; the resolved
//! request is handed to a [`FormatEngine`]. The shipped engine drives the
//! `mkfs.btrfs` program and reads the new superblock back.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use btrfsctl_types::{ChecksumType, Feature, FormatOutcome, RaidProfile};
use enumflags2::BitFlags;
use uuid::Uuid;

use crate::config::MkfsDefaults;
use crate::error::{BtrfsError, Result};
use crate::ioctl::le_u64;

/// Longest label the superblock holds, excluding the terminator.
pub const MAX_LABEL_LEN: usize = 255;

const MIN_SECTORSIZE: u32 = 4096;
const MAX_BLOCKSIZE: u32 = 65536;

const SUPERBLOCK_OFFSET: u64 = 65536;
const SUPERBLOCK_MAGIC: &[u8; 8] = b"_BHRfS_M";
const SB_FSID: usize = 0x20;
const SB_MAGIC: usize = 0x40;
const SB_TOTAL_BYTES: usize = 0x70;

/// Parameters for creating a filesystem on one or more devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRequest {
    pub devices: Vec<PathBuf>,
    pub label: String,
    pub nodesize: u32,
    pub sectorsize: u32,
    /// Size to use on each device, 0 for the whole device.
    pub byte_count: u64,
    /// `None` picks DUP for one device, RAID1 for several and SINGLE with
    /// mixed block groups.
    pub metadata_profile: Option<RaidProfile>,
    pub data_profile: RaidProfile,
    pub mixed: bool,
    pub features: BitFlags<Feature>,
    pub checksum: ChecksumType,
    /// Filesystem UUID in canonical form; generated when absent.
    pub uuid: Option<String>,
    /// Overwrite devices that already carry a filesystem signature.
    pub force: bool,
    pub discard: bool,
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            label: String::new(),
            nodesize: 16384,
            sectorsize: 4096,
            byte_count: 0,
            metadata_profile: None,
            data_profile: RaidProfile::Single,
            mixed: false,
            features: BitFlags::empty(),
            checksum: ChecksumType::Crc32c,
            uuid: None,
            force: false,
            discard: true,
        }
    }
}

impl FormatRequest {
    pub fn new<I, P>(devices: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A request whose sizes, checksum and discard setting come from configuration.
    pub fn with_defaults<I, P>(devices: I, defaults: &MkfsDefaults) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            nodesize: defaults.nodesize,
            sectorsize: defaults.sectorsize,
            checksum: defaults.checksum,
            discard: defaults.discard,
            ..Self::new(devices)
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn nodesize(mut self, nodesize: u32) -> Self {
        self.nodesize = nodesize;
        self
    }

    pub fn sectorsize(mut self, sectorsize: u32) -> Self {
        self.sectorsize = sectorsize;
        self
    }

    pub fn byte_count(mut self, byte_count: u64) -> Self {
        self.byte_count = byte_count;
        self
    }

    pub fn metadata_profile(mut self, profile: RaidProfile) -> Self {
        self.metadata_profile = Some(profile);
        self
    }

    pub fn data_profile(mut self, profile: RaidProfile) -> Self {
        self.data_profile = profile;
        self
    }

    pub fn mixed(mut self, mixed: bool) -> Self {
        self.mixed = mixed;
        self
    }

    pub fn features(mut self, features: impl Into<BitFlags<Feature>>) -> Self {
        self.features = features.into();
        self
    }

    pub fn checksum(mut self, checksum: ChecksumType) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    /// Check every parameter and fill in the derived ones.
    pub fn resolve(&self) -> Result<ResolvedFormatRequest> {
        if self.devices.is_empty() {
            return Err(invalid("at least one device is required"));
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(invalid(format!("label too long (max {MAX_LABEL_LEN})")));
        }
        let uuid = self.uuid.as_deref().map(parse_canonical_uuid).transpose()?;

        if !self.sectorsize.is_power_of_two()
            || !(MIN_SECTORSIZE..=MAX_BLOCKSIZE).contains(&self.sectorsize)
        {
            return Err(invalid(format!("invalid sectorsize: {}", self.sectorsize)));
        }
        let nodesize = if self.mixed { self.sectorsize } else { self.nodesize };
        if !nodesize.is_power_of_two() || !(self.sectorsize..=MAX_BLOCKSIZE).contains(&nodesize) {
            return Err(invalid(format!(
                "invalid nodesize: {nodesize} (must be a power of two between {} and {MAX_BLOCKSIZE})",
                self.sectorsize
            )));
        }

        let device_count = self.devices.len();
        let metadata_profile = self.metadata_profile.unwrap_or(match (self.mixed, device_count) {
            (true, _) => RaidProfile::Single,
            (false, 1) => RaidProfile::Dup,
            (false, _) => RaidProfile::Raid1,
        });
        for (kind, profile) in [("metadata", metadata_profile), ("data", self.data_profile)] {
            if device_count < profile.min_devices() {
                return Err(invalid(format!(
                    "{kind} profile {profile} needs at least {} devices, got {device_count}",
                    profile.min_devices()
                )));
            }
        }
        if self.mixed && metadata_profile != self.data_profile {
            return Err(invalid(
                "with mixed block groups data and metadata profiles must match",
            ));
        }

        let mut features = self.features;
        if self.mixed {
            features |= Feature::MixedGroups;
        }
        if metadata_profile.is_raid56() || self.data_profile.is_raid56() {
            features |= Feature::Raid56;
        }
        if metadata_profile.is_raid1c34() || self.data_profile.is_raid1c34() {
            features |= Feature::Raid1c34;
        }

        Ok(ResolvedFormatRequest {
            devices: self.devices.clone(),
            label: self.label.clone(),
            nodesize,
            sectorsize: self.sectorsize,
            byte_count: self.byte_count,
            metadata_profile,
            data_profile: self.data_profile,
            mixed: self.mixed,
            features,
            checksum: self.checksum,
            uuid,
            force: self.force,
            discard: self.discard,
        })
    }
}

fn invalid(message: impl Into<String>) -> BtrfsError {
    BtrfsError::InvalidArgument(message.into())
}

/// Only the 36-character hyphenated form is accepted.
fn parse_canonical_uuid(value: &str) -> Result<Uuid> {
    if value.len() != 36 {
        return Err(invalid(format!("invalid UUID: {value}")));
    }
    Uuid::try_parse(value).map_err(|_| invalid(format!("invalid UUID: {value}")))
}

/// A validated request with every default filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFormatRequest {
    pub devices: Vec<PathBuf>,
    pub label: String,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub byte_count: u64,
    pub metadata_profile: RaidProfile,
    pub data_profile: RaidProfile,
    pub mixed: bool,
    pub features: BitFlags<Feature>,
    pub checksum: ChecksumType,
    pub uuid: Option<Uuid>,
    pub force: bool,
    pub discard: bool,
}

/// Something that can lay a filesystem down on devices
pub trait FormatEngine {
    fn format(&self, request: &ResolvedFormatRequest) -> Result<FormatOutcome>;
}

/// Validate `request` and run it through `engine`.
pub fn mkfs(request: &FormatRequest, engine: &dyn FormatEngine) -> Result<FormatOutcome> {
    let resolved = request.resolve()?;
    tracing::info!(
        devices = ?resolved.devices,
        metadata = %resolved.metadata_profile,
        data = %resolved.data_profile,
        checksum = %resolved.checksum,
        "creating filesystem"
    );
    let outcome = engine.format(&resolved)?;
    tracing::info!(uuid = %outcome.uuid, num_bytes = outcome.num_bytes, "filesystem created");
    Ok(outcome)
}

/// Formatting through the `mkfs.btrfs` program
#[derive(Debug, Clone)]
pub struct MkfsBtrfsEngine {
    program: PathBuf,
}

impl MkfsBtrfsEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find `mkfs.btrfs` on `PATH`.
    pub fn locate() -> Result<Self> {
        let program = which::which("mkfs.btrfs").map_err(|e| {
            BtrfsError::os(
                "mkfs.btrfs not found",
                io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            )
        })?;
        Ok(Self::new(program))
    }

    /// Use the configured program, falling back to a `PATH` lookup.
    pub fn from_defaults(defaults: &MkfsDefaults) -> Result<Self> {
        match &defaults.program {
            Some(program) => Ok(Self::new(program)),
            None => Self::locate(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command_args(request: &ResolvedFormatRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if request.force {
            args.push("-f".into());
        }
        if !request.label.is_empty() {
            args.push("-L".into());
            args.push(request.label.clone().into());
        }
        if let Some(uuid) = request.uuid {
            args.push("-U".into());
            args.push(uuid.hyphenated().to_string().into());
        }
        args.push("-n".into());
        args.push(request.nodesize.to_string().into());
        args.push("-s".into());
        args.push(request.sectorsize.to_string().into());
        if request.byte_count > 0 {
            args.push("-b".into());
            args.push(request.byte_count.to_string().into());
        }
        args.push("-m".into());
        args.push(request.metadata_profile.as_str().into());
        args.push("-d".into());
        args.push(request.data_profile.as_str().into());
        if request.mixed {
            args.push("-M".into());
        }
        if !request.features.is_empty() {
            let names: Vec<&str> = request.features.iter().map(Feature::mkfs_name).collect();
            args.push("-O".into());
            args.push(names.join(",").into());
        }
        args.push("--csum".into());
        args.push(request.checksum.as_str().into());
        if !request.discard {
            args.push("-K".into());
        }
        args.extend(request.devices.iter().map(|device| device.clone().into_os_string()));
        args
    }
}

impl FormatEngine for MkfsBtrfsEngine {
    fn format(&self, request: &ResolvedFormatRequest) -> Result<FormatOutcome> {
        let args = Self::command_args(request);
        tracing::debug!(program = %self.program.display(), ?args, "running mkfs");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| BtrfsError::os(format!("failed to run {}", self.program.display()), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BtrfsError::os(
                format!("{} failed", self.program.display()),
                io::Error::other(stderr.trim().to_string()),
            ));
        }

        let device = request
            .devices
            .first()
            .ok_or_else(|| invalid("at least one device is required"))?;
        read_superblock(device)
    }
}

/// UUID and size recorded in the primary superblock of `device`.
pub fn read_superblock(device: &Path) -> Result<FormatOutcome> {
    let context = || format!("failed to read superblock of {}", device.display());
    let mut file = File::open(device).map_err(|e| BtrfsError::os(context(), e))?;
    file.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))
        .map_err(|e| BtrfsError::os(context(), e))?;
    let mut buf = [0u8; SB_TOTAL_BYTES + 8];
    file.read_exact(&mut buf).map_err(|e| BtrfsError::os(context(), e))?;
    parse_superblock(&buf).ok_or_else(|| {
        BtrfsError::os(
            context(),
            io::Error::new(io::ErrorKind::InvalidData, "bad superblock magic"),
        )
    })
}

fn parse_superblock(bytes: &[u8]) -> Option<FormatOutcome> {
    if bytes.get(SB_MAGIC..SB_MAGIC + 8)? != SUPERBLOCK_MAGIC {
        return None;
    }
    let fsid: [u8; 16] = bytes.get(SB_FSID..SB_FSID + 16)?.try_into().ok()?;
    Some(FormatOutcome {
        uuid: Uuid::from_bytes(fsid),
        num_bytes: le_u64(bytes, SB_TOTAL_BYTES)?,
    })
}
