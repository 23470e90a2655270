// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `malv`: the command tool over the malvin library.

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use log::error;

use malvin::cmd::{exit_code, CommandContext, LvChange, VgChange};
use malvin::config::RuntimeConfig;
use malvin::convert::LvConvert;
use malvin::lockd::lm::LmType;
use malvin::vg::LvCreate;
use malvin::Result;

#[derive(Parser)]
#[command(name = "malv", about = "LVM-style volume management", version)]
struct Cli {
    /// Only look at these devices.
    #[arg(long, global = true)]
    device: Vec<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List labeled PVs found on the system.
    Scan,
    /// Initialize a device as a PV.
    Pvcreate { device: PathBuf },
    /// Wipe an orphan PV label.
    Pvremove { device: PathBuf },
    /// Refresh a PV's size within its VG.
    Pvresize { vg: String, device: String },
    /// Move extents off a PV.
    Pvmove {
        vg: String,
        from: String,
        #[arg(long)]
        to: Option<String>,
    },
    /// Create a volume group.
    Vgcreate {
        name: String,
        devices: Vec<PathBuf>,
        /// Extent size in 512-byte sectors.
        #[arg(long, default_value_t = 8192)]
        extent_size: u64,
        /// Shared lock type: sanlock, dlm or idm.
        #[arg(long)]
        lock_type: Option<String>,
    },
    /// Remove an empty volume group.
    Vgremove { name: String },
    /// Rename a volume group.
    Vgrename { old: String, new: String },
    /// Add a PV to a VG.
    Vgextend {
        name: String,
        device: PathBuf,
        /// Restore a missing PV instead of adding a new one.
        #[arg(long)]
        restoremissing: bool,
    },
    /// Remove a PV from a VG.
    Vgreduce {
        name: String,
        device: Option<String>,
        /// Drop all missing PVs with no allocated extents.
        #[arg(long)]
        removemissing: bool,
    },
    /// Change VG parameters.
    Vgchange {
        name: String,
        #[arg(long)]
        system_id: Option<String>,
        #[arg(long)]
        metadata_copies: Option<u64>,
        /// "none", "sanlock", "dlm" or "idm".
        #[arg(long)]
        lock_type: Option<String>,
        /// Take over a legacy clustered VG.
        #[arg(long)]
        force_takeover: bool,
    },
    /// Split PVs off into a new VG.
    Vgsplit {
        name: String,
        new_name: String,
        devices: Vec<String>,
    },
    /// Merge one VG into another.
    Vgmerge { dst: String, src: String },
    /// Mark a VG exported.
    Vgexport { name: String },
    /// Import an exported VG.
    Vgimport { name: String },
    /// Create a logical volume.
    Lvcreate {
        vg: String,
        name: String,
        extents: u64,
        #[arg(long, default_value_t = 1)]
        stripes: u32,
        #[arg(long)]
        stripe_size: Option<u64>,
        /// Create a snapshot of this origin LV.
        #[arg(long)]
        snapshot_of: Option<String>,
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Remove a logical volume.
    Lvremove { vg: String, name: String },
    /// Rename a logical volume.
    Lvrename {
        vg: String,
        old: String,
        new: String,
    },
    /// Grow or shrink a logical volume by a number of extents.
    Lvresize {
        vg: String,
        name: String,
        extents: i64,
    },
    /// Convert an LV's layout.
    Lvconvert {
        vg: String,
        name: String,
        #[command(subcommand)]
        conversion: Conversion,
    },
    /// Change LV attributes.
    Lvchange {
        vg: String,
        name: String,
        #[arg(long)]
        activate: Option<bool>,
        #[arg(long)]
        add_tag: Vec<String>,
        #[arg(long)]
        del_tag: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
enum Conversion {
    /// linear → mirror with N extra copies.
    Mirror {
        #[arg(long, default_value_t = 1)]
        mirrors: u32,
        #[arg(long, default_value_t = 1024)]
        region_size: u64,
    },
    /// mirror → raid1.
    Raid1,
    /// raid1 → mirror.
    Unraid,
    /// striped → raid4/5/6.
    Raid {
        #[arg(long)]
        raid_type: String,
    },
    /// raid → striped.
    Striped,
    /// LV → thin pool.
    Thinpool {
        #[arg(long, default_value_t = 2)]
        metadata_extents: u64,
        #[arg(long, default_value_t = 128)]
        chunk_size: u64,
    },
    /// thin pool → plain LV.
    Unthinpool,
    /// LV → cache pool.
    Cachepool {
        #[arg(long, default_value_t = 1)]
        metadata_extents: u64,
    },
    /// Attach a cache pool.
    Cache {
        #[arg(long)]
        pool: String,
    },
    /// Detach the cache pool.
    Uncache,
    /// Schedule a snapshot merge.
    Merge,
    /// Split a snapshot from its origin.
    Split,
}

impl From<Conversion> for LvConvert {
    fn from(c: Conversion) -> LvConvert {
        match c {
            Conversion::Mirror {
                mirrors,
                region_size,
            } => LvConvert::Mirror {
                mirrors,
                region_size,
            },
            Conversion::Raid1 => LvConvert::MirrorToRaid1,
            Conversion::Unraid => LvConvert::Raid1ToMirror,
            Conversion::Raid { raid_type } => LvConvert::StripedToRaid { raid_type },
            Conversion::Striped => LvConvert::RaidToStriped,
            Conversion::Thinpool {
                metadata_extents,
                chunk_size,
            } => LvConvert::ThinPoolAttach {
                metadata_extents,
                chunk_size,
            },
            Conversion::Unthinpool => LvConvert::ThinPoolDetach,
            Conversion::Cachepool { metadata_extents } => {
                LvConvert::CachePoolAttach { metadata_extents }
            }
            Conversion::Cache { pool } => LvConvert::CacheAttach { pool },
            Conversion::Uncache => LvConvert::CacheDetach,
            Conversion::Merge => LvConvert::SnapshotMerge,
            Conversion::Split => LvConvert::SnapshotSplit,
        }
    }
}

fn parse_lock_type(s: &str) -> Result<LmType> {
    LmType::parse(s).ok_or_else(|| {
        malvin::Error::Metadata(malvin::MetadataError::Invalid(format!(
            "unknown lock type {}",
            s
        )))
    })
}

fn run(cli: Cli) -> Result<()> {
    let mut ctx = CommandContext::new(RuntimeConfig::load());
    ctx.filter.paths = cli.device.clone();

    match cli.command {
        Cmd::Scan => {
            let table = ctx.scan()?;
            for dev in table.values() {
                println!(
                    "{}\t{}\t{}",
                    dev.device_id,
                    dev.pv_uuid,
                    dev.vg_name.as_deref().unwrap_or("<orphan>")
                );
            }
            Ok(())
        }
        Cmd::Pvcreate { device } => ctx.pv_create(&device).map(|_| ()),
        Cmd::Pvremove { device } => ctx.pv_remove(&device),
        Cmd::Pvresize { vg, device } => ctx.pv_resize(&vg, &device).map(|_| ()),
        Cmd::Pvmove { vg, from, to } => ctx.pv_move(&vg, &from, to.as_deref()),
        Cmd::Vgcreate {
            name,
            devices,
            extent_size,
            lock_type,
        } => {
            let lock_type = match lock_type {
                Some(s) => Some(parse_lock_type(&s)?),
                None => None,
            };
            ctx.vg_create(&name, &devices, extent_size, lock_type)
        }
        Cmd::Vgremove { name } => ctx.vg_remove(&name),
        Cmd::Vgrename { old, new } => ctx.vg_rename(&old, &new),
        Cmd::Vgextend {
            name,
            device,
            restoremissing,
        } => {
            if restoremissing {
                ctx.vg_extend_restore_missing(&name, &device.to_string_lossy())
            } else {
                ctx.vg_extend(&name, &device)
            }
        }
        Cmd::Vgreduce {
            name,
            device,
            removemissing,
        } => ctx.vg_reduce(&name, device.as_deref(), removemissing),
        Cmd::Vgchange {
            name,
            system_id,
            metadata_copies,
            lock_type,
            force_takeover,
        } => {
            let lock_type = match lock_type {
                Some(s) => Some(parse_lock_type(&s)?),
                None => None,
            };
            ctx.vg_change(
                &name,
                &VgChange {
                    system_id,
                    metadata_copies,
                    lock_type,
                    force_takeover,
                },
            )
        }
        Cmd::Vgsplit {
            name,
            new_name,
            devices,
        } => ctx.vg_split(&name, &new_name, &devices),
        Cmd::Vgmerge { dst, src } => ctx.vg_merge(&dst, &src),
        Cmd::Vgexport { name } => ctx.vg_export(&name),
        Cmd::Vgimport { name } => ctx.vg_import(&name),
        Cmd::Lvcreate {
            vg,
            name,
            extents,
            stripes,
            stripe_size,
            snapshot_of,
            chunk_size,
        } => {
            let mut spec = LvCreate::new(&name, extents);
            spec.stripes = stripes;
            spec.stripe_size = stripe_size;
            spec.cow_of = snapshot_of;
            spec.chunk_size = chunk_size;
            ctx.lv_create(&vg, &spec)
        }
        Cmd::Lvremove { vg, name } => ctx.lv_remove(&vg, &name),
        Cmd::Lvrename { vg, old, new } => ctx.lv_rename(&vg, &old, &new),
        Cmd::Lvresize { vg, name, extents } => ctx.lv_resize(&vg, &name, extents),
        Cmd::Lvconvert {
            vg,
            name,
            conversion,
        } => ctx.lv_convert(&vg, &name, &conversion.into()),
        Cmd::Lvchange {
            vg,
            name,
            activate,
            add_tag,
            del_tag,
        } => ctx.lv_change(
            &vg,
            &name,
            &LvChange {
                activate,
                add_tags: add_tag,
                del_tags: del_tag,
                allocation_policy: None,
            },
        ),
    }
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version requests are not errors
            if e.use_stderr() {
                eprintln!("{}", e);
                exit(3);
            }
            print!("{}", e);
            exit(0);
        }
    };

    let result = run(cli);
    if let Err(ref e) = result {
        error!("{}", e);
        eprintln!("malv: {}", e);
    }
    exit(exit_code(&result));
}
