// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical Volumes and their segments.
//!
//! A segment maps one extent range of an LV to a concrete layout. The
//! layouts are a closed sum; dispatch is by exhaustive match. Sub-LV
//! references (mirror images, pool data/metadata, cache origins, ...)
//! are LV names resolved through the owning VG's LV map, so the segment
//! graph itself stays acyclic.

use std::collections::BTreeMap;

use crate::parser::{status_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::{Error, Result};

pub const LV_STATUS_VISIBLE: &str = "VISIBLE";
pub const LV_STATUS_LOCKED: &str = "LOCKED";
pub const LV_STATUS_MERGING: &str = "MERGING";
pub const LV_STATUS_CONVERTING: &str = "CONVERTING";
pub const LV_STATUS_NOTSYNCED: &str = "NOTSYNCED";
pub const LV_STATUS_ACTIVATION_SKIP: &str = "ACTIVATION_SKIP";

/// One stripe area: a PV (by uuid) and the starting extent within it.
pub type StripeArea = (String, u64);

/// A queued thin-pool transaction message.
#[derive(Debug, PartialEq, Clone)]
pub enum ThinMessage {
    Create(String),
    CreateSnap { name: String, origin: String },
    Delete(u64),
}

#[derive(Debug, PartialEq, Clone)]
pub enum SegmentType {
    /// Linear is striped with a single stripe.
    Striped {
        stripes: Vec<StripeArea>,
        stripe_size: Option<u64>,
    },
    Mirror {
        images: Vec<String>,
        log: Option<String>,
        region_size: u64,
        extents_copied: u64,
    },
    Raid {
        /// "raid0", "raid1", "raid4", "raid5", "raid6", "raid10"
        raid_type: String,
        images: Vec<String>,
        meta_areas: Vec<String>,
        region_size: u64,
        stripe_size: u64,
        data_copies: u64,
        writebehind: u64,
        min_recovery_rate: u64,
        max_recovery_rate: u64,
        reshape_len: u64,
        data_offset: u64,
    },
    Snapshot {
        origin: String,
        cow: String,
        chunk_size: u64,
        merging: bool,
    },
    ThinPool {
        data: String,
        metadata: String,
        transaction_id: u64,
        chunk_size: u64,
        discards: String,
        zero_new_blocks: bool,
        messages: Vec<ThinMessage>,
    },
    Thin {
        pool: String,
        device_id: u64,
        origin: Option<String>,
        external_origin: Option<String>,
        merge: Option<String>,
    },
    CachePool {
        data: String,
        metadata: String,
        chunk_size: u64,
        cache_mode: String,
        policy: String,
        policy_settings: LvmTextMap,
    },
    Cache {
        pool: String,
        origin: String,
    },
    Writecache {
        origin: String,
        fast_device: String,
        block_size: u64,
        settings: LvmTextMap,
    },
    Integrity {
        origin: String,
        meta_dev: String,
        data_sectors: u64,
        recalculate: bool,
        tag_size: u64,
        internal_hash: String,
    },
    VdoPool {
        data: String,
        header_size: u64,
        virtual_extents: u64,
        settings: LvmTextMap,
    },
    Vdo {
        pool: String,
        offset: u64,
    },
}

impl SegmentType {
    /// The type string recorded in the metadata text.
    pub fn type_name(&self) -> &str {
        match self {
            SegmentType::Striped { .. } => "striped",
            SegmentType::Mirror { .. } => "mirror",
            SegmentType::Raid { raid_type, .. } => raid_type,
            SegmentType::Snapshot { .. } => "snapshot",
            SegmentType::ThinPool { .. } => "thin-pool",
            SegmentType::Thin { .. } => "thin",
            SegmentType::CachePool { .. } => "cache-pool",
            SegmentType::Cache { .. } => "cache",
            SegmentType::Writecache { .. } => "writecache",
            SegmentType::Integrity { .. } => "integrity",
            SegmentType::VdoPool { .. } => "vdo-pool",
            SegmentType::Vdo { .. } => "vdo",
        }
    }

    /// Names of LVs this segment layers over. These must be hidden LVs
    /// owned by the same VG, each referenced by exactly one parent.
    pub fn sub_lv_names(&self) -> Vec<&str> {
        match self {
            SegmentType::Striped { .. } => Vec::new(),
            SegmentType::Mirror { images, log, .. } => {
                let mut v: Vec<&str> = images.iter().map(|s| s.as_str()).collect();
                if let Some(log) = log {
                    v.push(log);
                }
                v
            }
            SegmentType::Raid {
                images, meta_areas, ..
            } => images
                .iter()
                .chain(meta_areas.iter())
                .map(|s| s.as_str())
                .collect(),
            // Snapshot origin and cow stay user-visible; both are peer
            // references resolved through the LV map.
            SegmentType::Snapshot { .. } => Vec::new(),
            SegmentType::ThinPool { data, metadata, .. } => {
                vec![data.as_str(), metadata.as_str()]
            }
            // A thin LV's pool is a peer reference, not a layered sub-LV.
            SegmentType::Thin { .. } => Vec::new(),
            SegmentType::CachePool { data, metadata, .. } => {
                vec![data.as_str(), metadata.as_str()]
            }
            SegmentType::Cache { pool, origin } => vec![pool.as_str(), origin.as_str()],
            SegmentType::Writecache {
                origin,
                fast_device,
                ..
            } => vec![origin.as_str(), fast_device.as_str()],
            SegmentType::Integrity {
                origin, meta_dev, ..
            } => vec![origin.as_str(), meta_dev.as_str()],
            SegmentType::VdoPool { data, .. } => vec![data.as_str()],
            SegmentType::Vdo { pool, .. } => vec![pool.as_str()],
        }
    }

    /// Physical areas referenced directly by this segment.
    pub fn stripe_areas(&self) -> &[StripeArea] {
        match self {
            SegmentType::Striped { stripes, .. } => stripes,
            _ => &[],
        }
    }
}

/// A Logical Volume Segment.
#[derive(Debug, PartialEq, Clone)]
pub struct Segment {
    /// The first extent within the LV this segment comprises.
    pub start_extent: u64,
    /// How many extents this segment comprises
    pub extent_count: u64,
    /// Tags.
    pub tags: Vec<String>,
    /// The layout.
    pub ty: SegmentType,
}

/// A Logical Volume that is created from a Volume Group.
#[derive(Debug, PartialEq, Clone)]
pub struct LV {
    /// The name.
    pub name: String,
    /// The UUID.
    pub id: String,
    /// The status.
    pub status: Vec<String>,
    /// Flags.
    pub flags: Vec<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Created by this host.
    pub creation_host: String,
    /// Created at this Unix time.
    pub creation_time: i64,
    /// Allocation policy, if it differs from the VG's.
    pub allocation_policy: Option<String>,
    /// Read-ahead sectors.
    pub read_ahead: Option<u64>,
    /// Fixed device numbers, if requested.
    pub major: Option<i64>,
    pub minor: Option<i64>,
    /// Lock-manager specific blob for shared VGs.
    pub lock_args: Option<String>,
    /// Configuration profile name.
    pub profile: Option<String>,
    /// A list of the segments comprising the LV.
    pub segments: Vec<Segment>,
}

impl LV {
    /// The total number of extents used by this logical volume.
    pub fn used_extents(&self) -> u64 {
        self.segments.iter().map(|x| x.extent_count).sum()
    }

    pub fn is_visible(&self) -> bool {
        self.status.iter().any(|s| s == LV_STATUS_VISIBLE)
    }

    pub fn set_visible(&mut self, visible: bool) {
        if visible && !self.is_visible() {
            self.status.push(LV_STATUS_VISIBLE.to_string());
        } else if !visible {
            self.status.retain(|s| s != LV_STATUS_VISIBLE);
        }
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.status.iter().any(|s| s == status)
    }

    pub fn add_status(&mut self, status: &str) {
        if !self.has_status(status) {
            self.status.push(status.to_string());
        }
    }

    pub fn clear_status(&mut self, status: &str) {
        self.status.retain(|s| s != status);
    }

    /// Names of LVs referenced as layered sub-LVs by any segment.
    pub fn sub_lv_names(&self) -> Vec<&str> {
        let mut v = Vec::new();
        for seg in &self.segments {
            v.extend(seg.ty.sub_lv_names());
        }
        v
    }
}

/// Visit `lv` and every LV reachable through layered sub-LV references,
/// depth-first. The `lvs` map is the owning VG's LV table.
pub fn for_each_sub_lv<'a, F>(lvs: &'a BTreeMap<String, LV>, lv: &'a LV, f: &mut F)
where
    F: FnMut(&'a LV),
{
    for name in lv.sub_lv_names() {
        if let Some(sub) = lvs.get(name) {
            f(sub);
            for_each_sub_lv(lvs, sub, f);
        }
    }
}

fn opt_string(map: &LvmTextMap, name: &str) -> Option<String> {
    map.string_from_textmap(name).map(|s| s.to_string())
}

fn string_list(list: &[Entry]) -> Vec<String> {
    list.iter()
        .filter_map(|e| match e {
            Entry::String(ref s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

// Translate a "pv0"-style reference list into (pv uuid, offset) areas.
fn stripes_from_list(list: &[Entry], pvname_to_id: &BTreeMap<String, String>) -> Result<Vec<StripeArea>> {
    let err = || Error::Parse("stripe list parsing error".into());

    let mut stripes = Vec::new();
    for slc in list.chunks(2) {
        if slc.len() != 2 {
            return Err(err());
        }
        let name = match &slc[0] {
            Entry::String(ref x) => x.clone(),
            _ => return Err(err()),
        };
        let val = match slc[1] {
            Entry::Number(x) => x as u64,
            _ => return Err(err()),
        };
        let id = pvname_to_id.get(&name).cloned().ok_or_else(err)?;
        stripes.push((id, val));
    }
    Ok(stripes)
}

fn messages_from_textmap(map: &LvmTextMap) -> Result<Vec<ThinMessage>> {
    let mut messages = Vec::new();
    for i in 1.. {
        let msg = match map.textmap_from_textmap(&format!("message{}", i)) {
            Some(m) => m,
            None => break,
        };
        if let Some(name) = msg.string_from_textmap("create") {
            match msg.string_from_textmap("origin") {
                Some(origin) => messages.push(ThinMessage::CreateSnap {
                    name: name.to_string(),
                    origin: origin.to_string(),
                }),
                None => messages.push(ThinMessage::Create(name.to_string())),
            }
        } else if let Some(id) = msg.u64_from_textmap("delete") {
            messages.push(ThinMessage::Delete(id));
        } else {
            return Err(Error::Parse("unknown thin message".into()));
        }
    }
    Ok(messages)
}

fn segment_type_from_textmap(
    ty: &str,
    map: &LvmTextMap,
    pvname_to_id: &BTreeMap<String, String>,
) -> Result<SegmentType> {
    let err = || Error::Parse(format!("{} segment parsing error", ty));

    Ok(match ty {
        "striped" | "linear" => SegmentType::Striped {
            stripes: stripes_from_list(
                map.list_from_textmap("stripes").ok_or_else(err)?,
                pvname_to_id,
            )?,
            stripe_size: map.u64_from_textmap("stripe_size"),
        },
        "mirror" => SegmentType::Mirror {
            images: string_list(map.list_from_textmap("mirrors").ok_or_else(err)?),
            log: opt_string(map, "mirror_log"),
            region_size: map.u64_from_textmap("region_size").unwrap_or(0),
            extents_copied: map.u64_from_textmap("extents_moved").unwrap_or(0),
        },
        "raid0" | "raid1" | "raid4" | "raid5" | "raid6" | "raid10" => {
            let raids = string_list(map.list_from_textmap("raids").ok_or_else(err)?);
            let has_metas = map.i64_from_textmap("raid_meta").unwrap_or(1) != 0;
            let (images, meta_areas) = if has_metas && raids.len() % 2 == 0 && ty != "raid0" {
                let mut images = Vec::new();
                let mut metas = Vec::new();
                for pair in raids.chunks(2) {
                    metas.push(pair[0].clone());
                    images.push(pair[1].clone());
                }
                (images, metas)
            } else {
                (raids, Vec::new())
            };
            SegmentType::Raid {
                raid_type: ty.to_string(),
                images,
                meta_areas,
                region_size: map.u64_from_textmap("region_size").unwrap_or(0),
                stripe_size: map.u64_from_textmap("stripe_size").unwrap_or(0),
                data_copies: map.u64_from_textmap("data_copies").unwrap_or(0),
                writebehind: map.u64_from_textmap("writebehind").unwrap_or(0),
                min_recovery_rate: map.u64_from_textmap("min_recovery_rate").unwrap_or(0),
                max_recovery_rate: map.u64_from_textmap("max_recovery_rate").unwrap_or(0),
                reshape_len: map.u64_from_textmap("reshape_count").unwrap_or(0),
                data_offset: map.u64_from_textmap("data_offset").unwrap_or(0),
            }
        }
        "snapshot" => SegmentType::Snapshot {
            origin: opt_string(map, "origin").ok_or_else(err)?,
            cow: opt_string(map, "cow_store").ok_or_else(err)?,
            chunk_size: map.u64_from_textmap("chunk_size").ok_or_else(err)?,
            merging: map.i64_from_textmap("merging").unwrap_or(0) != 0,
        },
        "thin-pool" => SegmentType::ThinPool {
            data: opt_string(map, "pool").ok_or_else(err)?,
            metadata: opt_string(map, "metadata").ok_or_else(err)?,
            transaction_id: map.u64_from_textmap("transaction_id").unwrap_or(0),
            chunk_size: map.u64_from_textmap("chunk_size").ok_or_else(err)?,
            discards: opt_string(map, "discards").unwrap_or_else(|| "passdown".to_string()),
            zero_new_blocks: map.i64_from_textmap("zero_new_blocks").unwrap_or(0) != 0,
            messages: messages_from_textmap(map)?,
        },
        "thin" => SegmentType::Thin {
            pool: opt_string(map, "thin_pool").ok_or_else(err)?,
            device_id: map.u64_from_textmap("device_id").ok_or_else(err)?,
            origin: opt_string(map, "origin"),
            external_origin: opt_string(map, "external_origin"),
            merge: opt_string(map, "merge"),
        },
        "cache-pool" => SegmentType::CachePool {
            data: opt_string(map, "data").ok_or_else(err)?,
            metadata: opt_string(map, "metadata").ok_or_else(err)?,
            chunk_size: map.u64_from_textmap("chunk_size").unwrap_or(0),
            cache_mode: opt_string(map, "cache_mode").unwrap_or_else(|| "writethrough".to_string()),
            policy: opt_string(map, "policy").unwrap_or_else(|| "smq".to_string()),
            policy_settings: map
                .textmap_from_textmap("policy_settings")
                .cloned()
                .unwrap_or_default(),
        },
        "cache" => SegmentType::Cache {
            pool: opt_string(map, "cache_pool").ok_or_else(err)?,
            origin: opt_string(map, "origin").ok_or_else(err)?,
        },
        "writecache" => SegmentType::Writecache {
            origin: opt_string(map, "origin").ok_or_else(err)?,
            fast_device: opt_string(map, "writecache").ok_or_else(err)?,
            block_size: map.u64_from_textmap("writecache_block_size").unwrap_or(4096),
            settings: map
                .textmap_from_textmap("writecache_settings")
                .cloned()
                .unwrap_or_default(),
        },
        "integrity" => SegmentType::Integrity {
            origin: opt_string(map, "origin").ok_or_else(err)?,
            meta_dev: opt_string(map, "meta_dev").ok_or_else(err)?,
            data_sectors: map.u64_from_textmap("data_sectors").unwrap_or(0),
            recalculate: map.i64_from_textmap("recalculate").unwrap_or(0) != 0,
            tag_size: map.u64_from_textmap("tag_size").unwrap_or(0),
            internal_hash: opt_string(map, "internal_hash").unwrap_or_else(|| "crc32c".to_string()),
        },
        "vdo-pool" => SegmentType::VdoPool {
            data: opt_string(map, "data").ok_or_else(err)?,
            header_size: map.u64_from_textmap("header_size").unwrap_or(0),
            virtual_extents: map.u64_from_textmap("virtual_extents").unwrap_or(0),
            settings: map
                .textmap_from_textmap("vdo_settings")
                .cloned()
                .unwrap_or_default(),
        },
        "vdo" => SegmentType::Vdo {
            pool: opt_string(map, "vdo_pool").ok_or_else(err)?,
            offset: map.u64_from_textmap("vdo_offset").unwrap_or(0),
        },
        _ => return Err(Error::Parse(format!("unknown segment type {}", ty))),
    })
}

fn segment_type_to_textmap(ty: &SegmentType, id_to_pvname: &BTreeMap<String, String>, map: &mut LvmTextMap) {
    map.insert(
        "type".to_string(),
        Entry::String(ty.type_name().to_string()),
    );

    match ty {
        SegmentType::Striped {
            stripes,
            stripe_size,
        } => {
            map.insert(
                "stripe_count".to_string(),
                Entry::Number(stripes.len() as i64),
            );
            if let Some(ss) = stripe_size {
                map.insert("stripe_size".to_string(), Entry::Number(*ss as i64));
            }
            map.insert(
                "stripes".to_string(),
                Entry::List(Box::new(
                    stripes
                        .iter()
                        .flat_map(|(id, off)| {
                            let name = id_to_pvname
                                .get(id)
                                .cloned()
                                .unwrap_or_else(|| id.clone());
                            vec![Entry::String(name), Entry::Number(*off as i64)]
                        })
                        .collect(),
                )),
            );
        }
        SegmentType::Mirror {
            images,
            log,
            region_size,
            extents_copied,
        } => {
            map.insert(
                "mirror_count".to_string(),
                Entry::Number(images.len() as i64),
            );
            map.insert("region_size".to_string(), Entry::Number(*region_size as i64));
            if *extents_copied > 0 {
                map.insert(
                    "extents_moved".to_string(),
                    Entry::Number(*extents_copied as i64),
                );
            }
            if let Some(log) = log {
                map.insert("mirror_log".to_string(), Entry::String(log.clone()));
            }
            map.insert(
                "mirrors".to_string(),
                Entry::List(Box::new(
                    images.iter().map(|x| Entry::String(x.clone())).collect(),
                )),
            );
        }
        SegmentType::Raid {
            images,
            meta_areas,
            region_size,
            stripe_size,
            data_copies,
            writebehind,
            min_recovery_rate,
            max_recovery_rate,
            reshape_len,
            data_offset,
            ..
        } => {
            map.insert(
                "device_count".to_string(),
                Entry::Number(images.len() as i64),
            );
            for (key, val) in [
                ("region_size", region_size),
                ("stripe_size", stripe_size),
                ("data_copies", data_copies),
                ("writebehind", writebehind),
                ("min_recovery_rate", min_recovery_rate),
                ("max_recovery_rate", max_recovery_rate),
                ("reshape_count", reshape_len),
                ("data_offset", data_offset),
            ] {
                if *val > 0 {
                    map.insert(key.to_string(), Entry::Number(*val as i64));
                }
            }
            let raids: Vec<Entry> = if meta_areas.is_empty() {
                images.iter().map(|x| Entry::String(x.clone())).collect()
            } else {
                meta_areas
                    .iter()
                    .zip(images.iter())
                    .flat_map(|(m, i)| vec![Entry::String(m.clone()), Entry::String(i.clone())])
                    .collect()
            };
            if meta_areas.is_empty() {
                map.insert("raid_meta".to_string(), Entry::Number(0));
            }
            map.insert("raids".to_string(), Entry::List(Box::new(raids)));
        }
        SegmentType::Snapshot {
            origin,
            cow,
            chunk_size,
            merging,
        } => {
            map.insert("origin".to_string(), Entry::String(origin.clone()));
            map.insert("cow_store".to_string(), Entry::String(cow.clone()));
            map.insert("chunk_size".to_string(), Entry::Number(*chunk_size as i64));
            if *merging {
                map.insert("merging".to_string(), Entry::Number(1));
            }
        }
        SegmentType::ThinPool {
            data,
            metadata,
            transaction_id,
            chunk_size,
            discards,
            zero_new_blocks,
            messages,
        } => {
            map.insert("pool".to_string(), Entry::String(data.clone()));
            map.insert("metadata".to_string(), Entry::String(metadata.clone()));
            map.insert(
                "transaction_id".to_string(),
                Entry::Number(*transaction_id as i64),
            );
            map.insert("chunk_size".to_string(), Entry::Number(*chunk_size as i64));
            map.insert("discards".to_string(), Entry::String(discards.clone()));
            map.insert(
                "zero_new_blocks".to_string(),
                Entry::Number(*zero_new_blocks as i64),
            );
            for (i, msg) in messages.iter().enumerate() {
                let mut m = LvmTextMap::new();
                match msg {
                    ThinMessage::Create(name) => {
                        m.insert("create".to_string(), Entry::String(name.clone()));
                    }
                    ThinMessage::CreateSnap { name, origin } => {
                        m.insert("create".to_string(), Entry::String(name.clone()));
                        m.insert("origin".to_string(), Entry::String(origin.clone()));
                    }
                    ThinMessage::Delete(id) => {
                        m.insert("delete".to_string(), Entry::Number(*id as i64));
                    }
                }
                map.insert(format!("message{}", i + 1), Entry::TextMap(Box::new(m)));
            }
        }
        SegmentType::Thin {
            pool,
            device_id,
            origin,
            external_origin,
            merge,
        } => {
            map.insert("thin_pool".to_string(), Entry::String(pool.clone()));
            map.insert("device_id".to_string(), Entry::Number(*device_id as i64));
            if let Some(origin) = origin {
                map.insert("origin".to_string(), Entry::String(origin.clone()));
            }
            if let Some(ext) = external_origin {
                map.insert("external_origin".to_string(), Entry::String(ext.clone()));
            }
            if let Some(merge) = merge {
                map.insert("merge".to_string(), Entry::String(merge.clone()));
            }
        }
        SegmentType::CachePool {
            data,
            metadata,
            chunk_size,
            cache_mode,
            policy,
            policy_settings,
        } => {
            map.insert("data".to_string(), Entry::String(data.clone()));
            map.insert("metadata".to_string(), Entry::String(metadata.clone()));
            map.insert("chunk_size".to_string(), Entry::Number(*chunk_size as i64));
            map.insert("cache_mode".to_string(), Entry::String(cache_mode.clone()));
            map.insert("policy".to_string(), Entry::String(policy.clone()));
            if !policy_settings.is_empty() {
                map.insert(
                    "policy_settings".to_string(),
                    Entry::TextMap(Box::new(policy_settings.clone())),
                );
            }
        }
        SegmentType::Cache { pool, origin } => {
            map.insert("cache_pool".to_string(), Entry::String(pool.clone()));
            map.insert("origin".to_string(), Entry::String(origin.clone()));
        }
        SegmentType::Writecache {
            origin,
            fast_device,
            block_size,
            settings,
        } => {
            map.insert("origin".to_string(), Entry::String(origin.clone()));
            map.insert("writecache".to_string(), Entry::String(fast_device.clone()));
            map.insert(
                "writecache_block_size".to_string(),
                Entry::Number(*block_size as i64),
            );
            if !settings.is_empty() {
                map.insert(
                    "writecache_settings".to_string(),
                    Entry::TextMap(Box::new(settings.clone())),
                );
            }
        }
        SegmentType::Integrity {
            origin,
            meta_dev,
            data_sectors,
            recalculate,
            tag_size,
            internal_hash,
        } => {
            map.insert("origin".to_string(), Entry::String(origin.clone()));
            map.insert("meta_dev".to_string(), Entry::String(meta_dev.clone()));
            map.insert(
                "data_sectors".to_string(),
                Entry::Number(*data_sectors as i64),
            );
            if *recalculate {
                map.insert("recalculate".to_string(), Entry::Number(1));
            }
            if *tag_size > 0 {
                map.insert("tag_size".to_string(), Entry::Number(*tag_size as i64));
            }
            map.insert(
                "internal_hash".to_string(),
                Entry::String(internal_hash.clone()),
            );
        }
        SegmentType::VdoPool {
            data,
            header_size,
            virtual_extents,
            settings,
        } => {
            map.insert("data".to_string(), Entry::String(data.clone()));
            map.insert("header_size".to_string(), Entry::Number(*header_size as i64));
            map.insert(
                "virtual_extents".to_string(),
                Entry::Number(*virtual_extents as i64),
            );
            if !settings.is_empty() {
                map.insert(
                    "vdo_settings".to_string(),
                    Entry::TextMap(Box::new(settings.clone())),
                );
            }
        }
        SegmentType::Vdo { pool, offset } => {
            map.insert("vdo_pool".to_string(), Entry::String(pool.clone()));
            map.insert("vdo_offset".to_string(), Entry::Number(*offset as i64));
        }
    }
}

fn segments_from_textmap(
    segment_count: u64,
    map: &LvmTextMap,
    pvname_to_id: &BTreeMap<String, String>,
) -> Result<Vec<Segment>> {
    let err = || Error::Parse("segment textmap parsing error".into());

    let mut segments = Vec::new();
    for i in 0..segment_count {
        let name = format!("segment{}", i + 1);
        let seg_dict = map.textmap_from_textmap(&name).ok_or_else(err)?;

        let ty = seg_dict.string_from_textmap("type").ok_or_else(err)?;

        segments.push(Segment {
            start_extent: seg_dict.u64_from_textmap("start_extent").ok_or_else(err)?,
            extent_count: seg_dict.u64_from_textmap("extent_count").ok_or_else(err)?,
            tags: seg_dict.string_list_from_textmap("tags").unwrap_or_default(),
            ty: segment_type_from_textmap(ty, seg_dict, pvname_to_id)?,
        });
    }

    Ok(segments)
}

pub fn from_textmap(
    name: &str,
    map: &LvmTextMap,
    pvname_to_id: &BTreeMap<String, String>,
) -> Result<LV> {
    let err = || Error::Parse("lv textmap parsing error".into());

    let id = map.string_from_textmap("id").ok_or_else(err)?;
    let creation_host = map.string_from_textmap("creation_host").ok_or_else(err)?;
    let creation_time = map.i64_from_textmap("creation_time").ok_or_else(err)?;
    let segment_count = map.u64_from_textmap("segment_count").ok_or_else(err)?;

    let segments = segments_from_textmap(segment_count, map, pvname_to_id)?;

    let status = status_from_textmap(map)?;
    let flags = map.string_list_from_textmap("flags").unwrap_or_default();
    let tags = map.string_list_from_textmap("tags").unwrap_or_default();

    Ok(LV {
        name: name.to_string(),
        id: id.to_string(),
        status,
        flags,
        tags,
        creation_host: creation_host.to_string(),
        creation_time,
        allocation_policy: opt_string(map, "allocation_policy"),
        read_ahead: map.u64_from_textmap("read_ahead"),
        major: map.i64_from_textmap("major"),
        minor: map.i64_from_textmap("minor"),
        lock_args: opt_string(map, "lock_args"),
        profile: opt_string(map, "profile"),
        segments,
    })
}

pub fn to_textmap(lv: &LV, id_to_pvname: &BTreeMap<String, String>) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert("id".to_string(), Entry::String(lv.id.clone()));

    map.insert(
        "status".to_string(),
        Entry::List(Box::new(
            lv.status.iter().map(|x| Entry::String(x.clone())).collect(),
        )),
    );
    map.insert(
        "flags".to_string(),
        Entry::List(Box::new(
            lv.flags.iter().map(|x| Entry::String(x.clone())).collect(),
        )),
    );
    if !lv.tags.is_empty() {
        map.insert(
            "tags".to_string(),
            Entry::List(Box::new(
                lv.tags.iter().map(|x| Entry::String(x.clone())).collect(),
            )),
        );
    }

    map.insert(
        "creation_host".to_string(),
        Entry::String(lv.creation_host.clone()),
    );
    map.insert(
        "creation_time".to_string(),
        Entry::Number(lv.creation_time),
    );

    if let Some(ref policy) = lv.allocation_policy {
        map.insert(
            "allocation_policy".to_string(),
            Entry::String(policy.clone()),
        );
    }
    if let Some(ra) = lv.read_ahead {
        map.insert("read_ahead".to_string(), Entry::Number(ra as i64));
    }
    if let Some(major) = lv.major {
        map.insert("major".to_string(), Entry::Number(major));
    }
    if let Some(minor) = lv.minor {
        map.insert("minor".to_string(), Entry::Number(minor));
    }
    if let Some(ref lock_args) = lv.lock_args {
        map.insert("lock_args".to_string(), Entry::String(lock_args.clone()));
    }
    if let Some(ref profile) = lv.profile {
        map.insert("profile".to_string(), Entry::String(profile.clone()));
    }

    map.insert(
        "segment_count".to_string(),
        Entry::Number(lv.segments.len() as i64),
    );

    for (i, seg) in lv.segments.iter().enumerate() {
        let mut seg_map = LvmTextMap::new();
        seg_map.insert(
            "start_extent".to_string(),
            Entry::Number(seg.start_extent as i64),
        );
        seg_map.insert(
            "extent_count".to_string(),
            Entry::Number(seg.extent_count as i64),
        );
        if !seg.tags.is_empty() {
            seg_map.insert(
                "tags".to_string(),
                Entry::List(Box::new(
                    seg.tags.iter().map(|x| Entry::String(x.clone())).collect(),
                )),
            );
        }
        segment_type_to_textmap(&seg.ty, id_to_pvname, &mut seg_map);
        map.insert(format!("segment{}", i + 1), Entry::TextMap(Box::new(seg_map)));
    }

    map
}

/// (pv uuid, start extent, extent count) for every physical area the LV
/// maps directly.
pub fn used_areas(lv: &LV) -> Vec<(String, u64, u64)> {
    let mut v = Vec::new();
    for seg in &lv.segments {
        for (id, start) in seg.ty.stripe_areas() {
            v.push((id.clone(), *start, seg.extent_count));
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{hostname, now_seconds};

    fn pv_names() -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut name_to_id = BTreeMap::new();
        name_to_id.insert("pv0".to_string(), "uuid-a".to_string());
        name_to_id.insert("pv1".to_string(), "uuid-b".to_string());
        let id_to_name = name_to_id
            .iter()
            .map(|(k, v)| (v.clone(), k.clone()))
            .collect();
        (name_to_id, id_to_name)
    }

    fn linear_lv(name: &str) -> LV {
        LV {
            name: name.to_string(),
            id: format!("{}-uuid", name),
            status: vec![
                "READ".to_string(),
                "WRITE".to_string(),
                LV_STATUS_VISIBLE.to_string(),
            ],
            flags: vec![],
            tags: vec![],
            creation_host: hostname(),
            creation_time: now_seconds(),
            allocation_policy: None,
            read_ahead: None,
            major: None,
            minor: None,
            lock_args: None,
            profile: None,
            segments: vec![Segment {
                start_extent: 0,
                extent_count: 50,
                tags: vec![],
                ty: SegmentType::Striped {
                    stripes: vec![("uuid-a".to_string(), 0)],
                    stripe_size: None,
                },
            }],
        }
    }

    #[test]
    fn linear_round_trip() {
        let (name_to_id, id_to_name) = pv_names();
        let lv = linear_lv("lv0");
        let map = to_textmap(&lv, &id_to_name);
        let back = from_textmap("lv0", &map, &name_to_id).unwrap();
        assert_eq!(back, lv);
    }

    #[test]
    fn thin_pool_messages_round_trip() {
        let (name_to_id, id_to_name) = pv_names();
        let mut lv = linear_lv("pool0");
        lv.segments[0].ty = SegmentType::ThinPool {
            data: "pool0_tdata".to_string(),
            metadata: "pool0_tmeta".to_string(),
            transaction_id: 4,
            chunk_size: 128,
            discards: "passdown".to_string(),
            zero_new_blocks: true,
            messages: vec![
                ThinMessage::Create("thin1".to_string()),
                ThinMessage::CreateSnap {
                    name: "snap1".to_string(),
                    origin: "thin1".to_string(),
                },
                ThinMessage::Delete(7),
            ],
        };
        let map = to_textmap(&lv, &id_to_name);
        let back = from_textmap("pool0", &map, &name_to_id).unwrap();
        assert_eq!(back, lv);
    }

    #[test]
    fn raid_round_trip_with_metas() {
        let (name_to_id, id_to_name) = pv_names();
        let mut lv = linear_lv("r1");
        lv.segments[0].ty = SegmentType::Raid {
            raid_type: "raid1".to_string(),
            images: vec!["r1_rimage_0".to_string(), "r1_rimage_1".to_string()],
            meta_areas: vec!["r1_rmeta_0".to_string(), "r1_rmeta_1".to_string()],
            region_size: 1024,
            stripe_size: 0,
            data_copies: 2,
            writebehind: 0,
            min_recovery_rate: 0,
            max_recovery_rate: 0,
            reshape_len: 0,
            data_offset: 0,
        };
        let map = to_textmap(&lv, &id_to_name);
        let back = from_textmap("r1", &map, &name_to_id).unwrap();
        assert_eq!(back, lv);
    }

    #[test]
    fn sub_lv_traversal_visits_each_once() {
        let mut lvs = BTreeMap::new();
        let mut pool = linear_lv("pool0");
        pool.segments[0].ty = SegmentType::ThinPool {
            data: "pool0_tdata".to_string(),
            metadata: "pool0_tmeta".to_string(),
            transaction_id: 0,
            chunk_size: 128,
            discards: "passdown".to_string(),
            zero_new_blocks: false,
            messages: vec![],
        };
        let mut tdata = linear_lv("pool0_tdata");
        tdata.set_visible(false);
        let mut tmeta = linear_lv("pool0_tmeta");
        tmeta.set_visible(false);
        lvs.insert("pool0".to_string(), pool);
        lvs.insert("pool0_tdata".to_string(), tdata);
        lvs.insert("pool0_tmeta".to_string(), tmeta);

        let mut seen = Vec::new();
        for_each_sub_lv(&lvs, &lvs["pool0"], &mut |lv| seen.push(lv.name.clone()));
        seen.sort();
        assert_eq!(seen, vec!["pool0_tdata".to_string(), "pool0_tmeta".to_string()]);
    }

    #[test]
    fn unknown_segment_type_rejected() {
        let (name_to_id, id_to_name) = pv_names();
        let lv = linear_lv("lv0");
        let mut map = to_textmap(&lv, &id_to_name);
        if let Some(Entry::TextMap(seg)) = map.get_mut("segment1") {
            seg.insert(
                "type".to_string(),
                Entry::String("frobnicate".to_string()),
            );
        }
        assert!(from_textmap("lv0", &map, &name_to_id).is_err());
    }
}
