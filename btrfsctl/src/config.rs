// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use btrfsctl_types::ChecksumType;
use serde::{Deserialize, Serialize};

use crate::error::{BtrfsError, Result};

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "BTRFSCTL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/btrfsctl/config.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Defaults applied to new filesystems
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsDefaults {
    /// `mkfs.btrfs` to run; looked up on `PATH` when unset.
    pub program: Option<PathBuf>,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub checksum: ChecksumType,
    pub discard: bool,
}

impl Default for MkfsDefaults {
    fn default() -> Self {
        Self {
            program: None,
            nodesize: 16384,
            sectorsize: 4096,
            checksum: ChecksumType::Crc32c,
            discard: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LoggingLevel,
    pub mkfs: MkfsDefaults,
}

impl Config {
    /// Load from `$BTRFSCTL_CONFIG` or the system path. A missing file gives
    /// the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(BtrfsError::os(
                    format!("failed to read {}", path.display()),
                    e,
                ));
            }
        };
        Self::parse(&raw).map_err(|reason| {
            BtrfsError::InvalidArgument(format!("invalid configuration {}: {reason}", path.display()))
        })
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mkfs.nodesize, 16384);
        assert!(config.mkfs.discard);
        assert_eq!(config.log_level.as_directive(), "info");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            log_level = "debug"

            [mkfs]
            program = "/usr/local/sbin/mkfs.btrfs"
            checksum = "xxhash"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, LoggingLevel::Debug);
        assert_eq!(
            config.mkfs.program.as_deref(),
            Some(Path::new("/usr/local/sbin/mkfs.btrfs"))
        );
        assert_eq!(config.mkfs.checksum, ChecksumType::Xxhash);
        assert_eq!(config.mkfs.sectorsize, 4096);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/btrfsctl.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("btrfsctl-config-{}.toml", std::process::id()));
        fs::write(&path, "log_level = \"loud\"\n").unwrap();
        let error = Config::load_from(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        assert_eq!(error.code(), Some(ErrorCode::InvalidArgument));
        assert!(error.to_string().contains("invalid configuration"));
    }
}
