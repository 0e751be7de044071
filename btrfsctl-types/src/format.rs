// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::str::FromStr;

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Data/metadata redundancy profile chosen at filesystem creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    #[default]
    Single,
    Raid0,
    Raid1,
    Raid1c3,
    Raid1c4,
    Raid5,
    Raid6,
    Raid10,
    Dup,
}

impl RaidProfile {
    pub const ALL: [RaidProfile; 9] = [
        RaidProfile::Single,
        RaidProfile::Raid0,
        RaidProfile::Raid1,
        RaidProfile::Raid1c3,
        RaidProfile::Raid1c4,
        RaidProfile::Raid5,
        RaidProfile::Raid6,
        RaidProfile::Raid10,
        RaidProfile::Dup,
    ];

    /// Block group profile bits as stored on disk (`SINGLE` has none).
    pub fn bits(self) -> u64 {
        match self {
            RaidProfile::Single => 0,
            RaidProfile::Raid0 => 1 << 3,
            RaidProfile::Raid1 => 1 << 4,
            RaidProfile::Dup => 1 << 5,
            RaidProfile::Raid10 => 1 << 6,
            RaidProfile::Raid5 => 1 << 7,
            RaidProfile::Raid6 => 1 << 8,
            RaidProfile::Raid1c3 => 1 << 9,
            RaidProfile::Raid1c4 => 1 << 10,
        }
    }

    /// Smallest number of devices the profile can be created on.
    pub fn min_devices(self) -> usize {
        match self {
            RaidProfile::Single | RaidProfile::Dup | RaidProfile::Raid0 => 1,
            RaidProfile::Raid1 | RaidProfile::Raid10 | RaidProfile::Raid5 => 2,
            RaidProfile::Raid1c3 | RaidProfile::Raid6 => 3,
            RaidProfile::Raid1c4 => 4,
        }
    }

    pub fn is_raid56(self) -> bool {
        matches!(self, RaidProfile::Raid5 | RaidProfile::Raid6)
    }

    pub fn is_raid1c34(self) -> bool {
        matches!(self, RaidProfile::Raid1c3 | RaidProfile::Raid1c4)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaidProfile::Single => "single",
            RaidProfile::Raid0 => "raid0",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Raid1c3 => "raid1c3",
            RaidProfile::Raid1c4 => "raid1c4",
            RaidProfile::Raid5 => "raid5",
            RaidProfile::Raid6 => "raid6",
            RaidProfile::Raid10 => "raid10",
            RaidProfile::Dup => "dup",
        }
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaidProfile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.to_ascii_lowercase();
        RaidProfile::ALL
            .into_iter()
            .find(|profile| profile.as_str() == lowered)
            .ok_or_else(|| format!("unknown RAID profile: {value}"))
    }
}

/// Checksum algorithm, numbered as the on-disk `csum_type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum ChecksumType {
    #[default]
    Crc32c = 0,
    Xxhash = 1,
    Sha256 = 2,
    Blake2 = 3,
}

impl ChecksumType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumType::Crc32c => "crc32c",
            ChecksumType::Xxhash => "xxhash",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Blake2 => "blake2",
        }
    }

    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0 => Some(ChecksumType::Crc32c),
            1 => Some(ChecksumType::Xxhash),
            2 => Some(ChecksumType::Sha256),
            3 => Some(ChecksumType::Blake2),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "crc32c" | "crc32" => Ok(ChecksumType::Crc32c),
            "xxhash" | "xxhash64" => Ok(ChecksumType::Xxhash),
            "sha256" => Ok(ChecksumType::Sha256),
            "blake2" | "blake2b" => Ok(ChecksumType::Blake2),
            _ => Err(format!("unknown checksum type: {value}")),
        }
    }
}

/// Incompatible feature bits selectable at filesystem creation
#[bitflags]
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    MixedGroups = 1 << 2,
    Raid56 = 1 << 7,
    NoHoles = 1 << 9,
    Raid1c34 = 1 << 11,
    Zoned = 1 << 12,
}

impl Feature {
    /// Name understood by `mkfs.btrfs -O`.
    pub fn mkfs_name(self) -> &'static str {
        match self {
            Feature::MixedGroups => "mixed-bg",
            Feature::Raid56 => "raid56",
            Feature::NoHoles => "no-holes",
            Feature::Raid1c34 => "raid1c34",
            Feature::Zoned => "zoned",
        }
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BitFlags::<Feature>::all()
            .iter()
            .find(|feature| feature.mkfs_name() == value)
            .ok_or_else(|| format!("unknown feature: {value}"))
    }
}

/// Result reported by the formatting engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOutcome {
    /// Filesystem UUID that was assigned
    pub uuid: Uuid,
    /// Usable size of the new filesystem in bytes
    pub num_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_has_no_profile_bits() {
        assert_eq!(RaidProfile::Single.bits(), 0);
    }

    #[test]
    fn profile_bits_are_distinct() {
        let mut bits: Vec<u64> = RaidProfile::ALL.iter().map(|p| p.bits()).collect();
        bits.sort_unstable();
        bits.dedup();
        assert_eq!(bits.len(), RaidProfile::ALL.len());
    }

    #[test]
    fn mirrored_profiles_need_more_devices() {
        assert_eq!(RaidProfile::Dup.min_devices(), 1);
        assert_eq!(RaidProfile::Raid1.min_devices(), 2);
        assert_eq!(RaidProfile::Raid1c4.min_devices(), 4);
    }

    #[test]
    fn parses_profiles_case_insensitively() {
        assert_eq!("RAID1C3".parse::<RaidProfile>(), Ok(RaidProfile::Raid1c3));
        assert!("raid7".parse::<RaidProfile>().is_err());
    }

    #[test]
    fn checksum_raw_values() {
        assert_eq!(ChecksumType::Xxhash as u16, 1);
        assert_eq!(ChecksumType::from_raw(3), Some(ChecksumType::Blake2));
        assert_eq!(ChecksumType::from_raw(9), None);
    }

    #[test]
    fn feature_names_roundtrip_through_from_str() {
        for feature in BitFlags::<Feature>::all().iter() {
            assert_eq!(feature.mkfs_name().parse::<Feature>(), Ok(feature));
        }
    }
}
