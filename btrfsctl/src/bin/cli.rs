// SPDX-License-Identifier: GPL-3.0-only

//! Command-line front end for the btrfsctl library

use anyhow::{Context, Result};
use btrfsctl::{
    ChecksumType, Config, Feature, FormatRequest, IteratorOptions, MkfsBtrfsEngine, MntFlags,
    MsFlags, QgroupInherit, RaidProfile, SnapshotOptions, SubvolumeEntryRecord, SubvolumeIterator,
    SubvolumeManager,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Btrfs subvolume, snapshot and filesystem control
#[derive(Parser)]
#[command(name = "btrfsctl")]
#[command(about = "Manage btrfs subvolumes, snapshots and filesystems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the subvolumes below a path
    List {
        /// Path inside a btrfs filesystem
        path: PathBuf,
        /// Print each subvolume after its descendants
        #[arg(long)]
        post_order: bool,
        /// Include full metadata for every subvolume
        #[arg(long)]
        info: bool,
        /// Start from this subvolume id instead of the one containing the path
        #[arg(long)]
        top: Option<u64>,
    },
    /// Show the metadata of a subvolume
    Info {
        path: PathBuf,
        /// Subvolume id to query instead of the path itself
        #[arg(long, default_value_t = 0)]
        id: u64,
    },
    /// Print the id of the subvolume containing a path
    Id { path: PathBuf },
    /// Print the path of a subvolume relative to the top level
    Path {
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        id: u64,
    },
    /// Create a new subvolume
    Create {
        /// Mount point of the btrfs filesystem
        mount_point: PathBuf,
        /// Name of the subvolume to create
        name: String,
        /// Qgroup to add the subvolume to (repeatable)
        #[arg(long = "inherit")]
        inherit: Vec<u64>,
    },
    /// Delete a subvolume
    Delete {
        mount_point: PathBuf,
        /// Path to the subvolume, relative to the mount point
        path: PathBuf,
        /// Delete nested subvolumes too
        #[arg(long)]
        recursive: bool,
    },
    /// Create a snapshot of a subvolume
    Snapshot {
        mount_point: PathBuf,
        source: PathBuf,
        dest: PathBuf,
        /// Make the snapshot read-only
        #[arg(long)]
        readonly: bool,
        /// Snapshot nested subvolumes too
        #[arg(long)]
        recursive: bool,
        /// Qgroup to add the snapshot to (repeatable)
        #[arg(long = "inherit")]
        inherit: Vec<u64>,
    },
    /// Show whether a subvolume is read-only
    GetReadonly { mount_point: PathBuf, path: PathBuf },
    /// Set or unset the read-only flag on a subvolume
    SetReadonly {
        mount_point: PathBuf,
        path: PathBuf,
        /// Whether to set read-only (true) or writable (false)
        #[arg(action = clap::ArgAction::Set)]
        readonly: bool,
    },
    /// Get the default subvolume
    GetDefault { mount_point: PathBuf },
    /// Set a subvolume as the default
    SetDefault { mount_point: PathBuf, path: PathBuf },
    /// List deleted subvolumes pending cleanup
    ListDeleted { mount_point: PathBuf },
    /// Commit the current transaction
    Sync {
        path: PathBuf,
        /// Start the commit and print its transaction id without waiting
        #[arg(long)]
        no_wait: bool,
    },
    /// Create a btrfs filesystem
    Mkfs {
        #[arg(required = true)]
        devices: Vec<PathBuf>,
        #[arg(short = 'L', long)]
        label: Option<String>,
        #[arg(short = 'n', long)]
        nodesize: Option<u32>,
        #[arg(short = 's', long)]
        sectorsize: Option<u32>,
        /// Bytes to use on each device
        #[arg(short = 'b', long)]
        byte_count: Option<u64>,
        #[arg(short = 'm', long)]
        metadata: Option<RaidProfile>,
        #[arg(short = 'd', long)]
        data: Option<RaidProfile>,
        #[arg(short = 'M', long)]
        mixed: bool,
        /// Incompat feature to enable (repeatable)
        #[arg(short = 'O', long = "feature")]
        features: Vec<Feature>,
        #[arg(long)]
        checksum: Option<ChecksumType>,
        #[arg(short = 'U', long)]
        uuid: Option<String>,
        #[arg(short = 'f', long)]
        force: bool,
        #[arg(short = 'K', long)]
        no_discard: bool,
    },
    /// Mount a filesystem
    Mount {
        source: PathBuf,
        target: PathBuf,
        #[arg(short = 't', long, default_value = "btrfs")]
        fstype: String,
        #[arg(short = 'o', long, default_value = "")]
        options: String,
        #[arg(long)]
        readonly: bool,
    },
    /// Unmount a filesystem
    Umount {
        target: PathBuf,
        /// Detach now, clean up once no longer busy
        #[arg(short = 'l', long)]
        lazy: bool,
        #[arg(short = 'f', long)]
        force: bool,
    },
}

fn qgroups(ids: &[u64]) -> Result<Option<QgroupInherit>> {
    if ids.is_empty() {
        return Ok(None);
    }
    let mut inherit = QgroupInherit::new();
    for id in ids {
        inherit.add_group(*id)?;
    }
    Ok(Some(inherit))
}

fn main() -> Result<()> {
    let config = Config::load();
    let directive = config
        .as_ref()
        .map(|config| config.log_level.as_directive())
        .unwrap_or("info");

    // Initialize tracing to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();

    let config = config.unwrap_or_else(|error| {
        tracing::warn!(%error, "ignoring configuration");
        Config::default()
    });

    let cli = Cli::parse();

    match cli.command {
        Commands::List {
            path,
            post_order,
            info,
            top,
        } => {
            let mut options = IteratorOptions::new().post_order(post_order).info(info);
            if let Some(top) = top {
                options = options.top(top);
            }
            let records = SubvolumeIterator::open(&path, options)?
                .map(|entry| entry.map(|entry| entry.into_record()))
                .collect::<btrfsctl::Result<Vec<SubvolumeEntryRecord>>>()?;
            println!("{}", serde_json::to_string(&records)?);
        }
        Commands::Info { path, id } => {
            let info = btrfsctl::subvolume_info(&path, id)?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Commands::Id { path } => {
            let id = btrfsctl::subvolume_id(&path)?;
            println!("{{\"id\": {}}}", id);
        }
        Commands::Path { path, id } => {
            let subvolume_path = btrfsctl::subvolume_path(&path, id)?;
            println!(
                "{}",
                serde_json::json!({ "path": subvolume_path.to_string_lossy() })
            );
        }
        Commands::Create {
            mount_point,
            name,
            inherit,
        } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            let inherit = qgroups(&inherit)?;
            let info = manager.create(&name, inherit.as_ref())?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Commands::Delete {
            mount_point,
            path,
            recursive,
        } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            manager.delete(&path, recursive)?;
            println!("{{\"success\": true}}");
        }
        Commands::Snapshot {
            mount_point,
            source,
            dest,
            readonly,
            recursive,
            inherit,
        } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            let inherit = qgroups(&inherit)?;
            let mut options = SnapshotOptions::new().read_only(readonly).recursive(recursive);
            if let Some(inherit) = &inherit {
                options = options.qgroup(inherit);
            }
            let info = manager.snapshot(&source, &dest, options)?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Commands::GetReadonly { mount_point, path } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            let readonly = manager.get_readonly(&path)?;
            println!("{{\"readonly\": {}}}", readonly);
        }
        Commands::SetReadonly {
            mount_point,
            path,
            readonly,
        } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            manager.set_readonly(&path, readonly)?;
            println!("{{\"success\": true}}");
        }
        Commands::GetDefault { mount_point } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            let id = manager.get_default()?;
            println!("{{\"id\": {}}}", id);
        }
        Commands::SetDefault { mount_point, path } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            manager.set_default(&path)?;
            println!("{{\"success\": true}}");
        }
        Commands::ListDeleted { mount_point } => {
            let manager = SubvolumeManager::new(&mount_point)?;
            let deleted = manager.list_deleted()?;
            println!("{}", serde_json::to_string(&deleted)?);
        }
        Commands::Sync { path, no_wait } => {
            if no_wait {
                let transid = btrfsctl::start_sync(&path)?;
                println!("{{\"transid\": {}}}", transid);
            } else {
                btrfsctl::sync(&path)?;
                println!("{{\"success\": true}}");
            }
        }
        Commands::Mkfs {
            devices,
            label,
            nodesize,
            sectorsize,
            byte_count,
            metadata,
            data,
            mixed,
            features,
            checksum,
            uuid,
            force,
            no_discard,
        } => {
            let mut request = FormatRequest::with_defaults(devices, &config.mkfs)
                .mixed(mixed)
                .force(force)
                .features(features.into_iter().collect::<enumflags2::BitFlags<Feature>>());
            if let Some(label) = label {
                request = request.label(label);
            }
            if let Some(nodesize) = nodesize {
                request = request.nodesize(nodesize);
            }
            if let Some(sectorsize) = sectorsize {
                request = request.sectorsize(sectorsize);
            }
            if let Some(byte_count) = byte_count {
                request = request.byte_count(byte_count);
            }
            if let Some(profile) = metadata {
                request = request.metadata_profile(profile);
            }
            if let Some(profile) = data {
                request = request.data_profile(profile);
            }
            if let Some(checksum) = checksum {
                request = request.checksum(checksum);
            }
            if let Some(uuid) = uuid {
                request = request.uuid(uuid);
            }
            if no_discard {
                request = request.discard(false);
            }

            let engine = MkfsBtrfsEngine::from_defaults(&config.mkfs)
                .context("no mkfs.btrfs available")?;
            let outcome = btrfsctl::mkfs(&request, &engine)?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Mount {
            source,
            target,
            fstype,
            options,
            readonly,
        } => {
            let flags = if readonly { MsFlags::MS_RDONLY } else { MsFlags::empty() };
            btrfsctl::mount(&source, &target, &fstype, flags, &options)?;
            println!("{{\"success\": true}}");
        }
        Commands::Umount {
            target,
            lazy,
            force,
        } => {
            let mut flags = MntFlags::empty();
            if lazy {
                flags |= MntFlags::MNT_DETACH;
            }
            if force {
                flags |= MntFlags::MNT_FORCE;
            }
            btrfsctl::umount(&target, flags)?;
            println!("{{\"success\": true}}");
        }
    }

    Ok(())
}
