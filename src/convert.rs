// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! LV type conversions.
//!
//! Each public conversion is a composed sequence of lower-level steps:
//! insert a hidden layer LV, allocate sub-LVs, rewire references, queue
//! thin messages, or tear a layer down. Forbidden transitions fail with
//! `ERR_UNSUPPORTED_CONVERSION` before any mutation.

use log::debug;

use crate::allocation::AllocRequest;
use crate::lv::{Segment, SegmentType, ThinMessage, LV_STATUS_MERGING};
use crate::vg::{LvCreate, LV_STATUS_ORIGIN, VG};
use crate::{Error, MetadataError, Result};

/// The conversion requests `lv_convert` accepts.
#[derive(Debug, Clone)]
pub enum LvConvert {
    /// linear/striped → mirror with `mirrors` additional copies.
    Mirror { mirrors: u32, region_size: u64 },
    /// mirror → raid1.
    MirrorToRaid1,
    /// raid1 → mirror.
    Raid1ToMirror,
    /// linear/striped → raid4/5/6 (parity images are allocated).
    StripedToRaid { raid_type: String },
    /// raid → striped, dropping parity and metadata images.
    RaidToStriped,
    /// LV becomes the data device of a new thin pool.
    ThinPoolAttach {
        metadata_extents: u64,
        chunk_size: u64,
    },
    /// Empty thin pool back to a plain LV.
    ThinPoolDetach,
    /// LV becomes the data device of a new cache pool.
    CachePoolAttach { metadata_extents: u64 },
    /// Attach a cache pool to this LV.
    CacheAttach { pool: String },
    /// Split the cache pool off again.
    CacheDetach,
    /// Schedule a snapshot merge into its origin.
    SnapshotMerge,
    /// Detach a snapshot from its origin, keeping the cow as a plain LV.
    SnapshotSplit,
}

impl LvConvert {
    fn target_name(&self) -> &str {
        match self {
            LvConvert::Mirror { .. } => "mirror",
            LvConvert::MirrorToRaid1 => "raid1",
            LvConvert::Raid1ToMirror => "mirror",
            LvConvert::StripedToRaid { raid_type } => raid_type,
            LvConvert::RaidToStriped => "striped",
            LvConvert::ThinPoolAttach { .. } => "thin-pool",
            LvConvert::ThinPoolDetach => "striped",
            LvConvert::CachePoolAttach { .. } => "cache-pool",
            LvConvert::CacheAttach { .. } => "cache",
            LvConvert::CacheDetach => "striped",
            LvConvert::SnapshotMerge => "snapshot-merge",
            LvConvert::SnapshotSplit => "striped",
        }
    }
}

/// Snapshot merge progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Idle,
    /// Recorded in metadata; the kernel target consumes it at next
    /// activation while the origin is still open.
    Scheduled,
    Merging,
    Merged,
}

/// A hidden intermediate LV inserted above a visible LV so its identity
/// is preserved while its mapping changes.
#[derive(Debug)]
pub struct LayerInsertion {
    pub parent: String,
    pub hidden_child: String,
}

impl LayerInsertion {
    /// Move `parent`'s mapping into a new hidden LV named
    /// `{parent}{suffix}`. The parent is left with no segments; the
    /// caller installs the new top-level segment.
    pub fn insert(vg: &mut VG, parent: &str, suffix: &str) -> Result<LayerInsertion> {
        let child_name = format!("{}{}", parent, suffix);
        if vg.lvs.contains_key(&child_name) {
            return Err(Error::Metadata(MetadataError::NameCollision(child_name)));
        }

        let parent_lv = vg
            .lvs
            .get_mut(parent)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(parent.to_string())))?;

        let segments = std::mem::take(&mut parent_lv.segments);
        let mut child = parent_lv.clone();
        child.name = child_name.clone();
        child.id = crate::util::make_uuid();
        child.segments = segments;
        child.set_visible(false);

        vg.lvs.insert(child_name.clone(), child);
        debug!("layered {} under {}", child_name, parent);

        Ok(LayerInsertion {
            parent: parent.to_string(),
            hidden_child: child_name,
        })
    }

    /// Undo: move the child's mapping back into the parent and drop the
    /// child.
    pub fn teardown(self, vg: &mut VG) -> Result<()> {
        let child = vg
            .lvs
            .remove(&self.hidden_child)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(self.hidden_child.clone())))?;
        let parent = vg
            .lvs
            .get_mut(&self.parent)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(self.parent.clone())))?;
        parent.segments = child.segments;
        Ok(())
    }
}

fn current_type(vg: &VG, lv_name: &str) -> Result<String> {
    let lv = vg
        .lvs
        .get(lv_name)
        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(lv_name.to_string())))?;
    Ok(lv
        .segments
        .first()
        .map(|seg| seg.ty.type_name().to_string())
        .unwrap_or_else(|| "error".to_string()))
}

fn unsupported(from: &str, to: &str) -> Error {
    Error::Metadata(MetadataError::UnsupportedConversion {
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// Top-level conversion entry point with the allowed-transition matrix.
pub fn lv_convert(vg: &mut VG, lv_name: &str, conv: &LvConvert) -> Result<()> {
    let from = current_type(vg, lv_name)?;

    // The matrix is checked up front so forbidden transitions cannot
    // leave partial mutations behind.
    let allowed = match (from.as_str(), conv) {
        ("striped", LvConvert::Mirror { .. }) => true,
        ("mirror", LvConvert::MirrorToRaid1) => true,
        ("raid1", LvConvert::Raid1ToMirror) => true,
        ("striped", LvConvert::StripedToRaid { raid_type }) => {
            matches!(raid_type.as_str(), "raid1" | "raid4" | "raid5" | "raid6")
        }
        (from, LvConvert::RaidToStriped) => from.starts_with("raid"),
        ("striped", LvConvert::ThinPoolAttach { .. }) => true,
        ("thin-pool", LvConvert::ThinPoolDetach) => true,
        ("striped", LvConvert::CachePoolAttach { .. }) => true,
        ("striped", LvConvert::CacheAttach { .. }) => true,
        ("cache", LvConvert::CacheDetach) => true,
        ("striped", LvConvert::SnapshotMerge) => true,
        ("striped", LvConvert::SnapshotSplit) => true,
        _ => false,
    };
    if !allowed {
        return Err(unsupported(&from, conv.target_name()));
    }

    if vg.is_partial() {
        return Err(Error::Metadata(MetadataError::Partial(vg.name.clone())));
    }

    match conv {
        LvConvert::Mirror {
            mirrors,
            region_size,
        } => convert_to_mirror(vg, lv_name, *mirrors, *region_size),
        LvConvert::MirrorToRaid1 => mirror_to_raid1(vg, lv_name),
        LvConvert::Raid1ToMirror => raid1_to_mirror(vg, lv_name),
        LvConvert::StripedToRaid { raid_type } => striped_to_raid(vg, lv_name, raid_type),
        LvConvert::RaidToStriped => raid_to_striped(vg, lv_name),
        LvConvert::ThinPoolAttach {
            metadata_extents,
            chunk_size,
        } => thin_pool_attach(vg, lv_name, *metadata_extents, *chunk_size),
        LvConvert::ThinPoolDetach => thin_pool_detach(vg, lv_name),
        LvConvert::CachePoolAttach { metadata_extents } => {
            cache_pool_attach(vg, lv_name, *metadata_extents)
        }
        LvConvert::CacheAttach { pool } => cache_attach(vg, lv_name, pool),
        LvConvert::CacheDetach => cache_detach(vg, lv_name),
        LvConvert::SnapshotMerge => snapshot_merge(vg, lv_name),
        LvConvert::SnapshotSplit => snapshot_split(vg, lv_name),
    }
}

// Allocate a hidden linear LV of `extents`, avoiding `avoid` PVs where
// possible. Returns its name.
fn alloc_hidden_lv(
    vg: &mut VG,
    name: String,
    extents: u64,
    avoid: &[String],
) -> Result<String> {
    let req = AllocRequest {
        extents,
        avoid,
        ..Default::default()
    };
    let pieces = match vg.alloc_extents(&req, None) {
        Ok(p) => p,
        // retry without the avoid list before giving up
        Err(_) if !avoid.is_empty() => {
            let req = AllocRequest {
                extents,
                ..Default::default()
            };
            vg.alloc_extents(&req, None)?
        }
        Err(e) => return Err(e),
    };

    let mut spec = LvCreate::new(&name, extents);
    spec.pv_hints = pieces.iter().map(|p| p.0.clone()).collect();
    vg.lv_create(&spec)?;
    let lv = vg.lvs.get_mut(&name).expect("just created");
    lv.set_visible(false);
    Ok(name)
}

fn lv_extents(vg: &VG, name: &str) -> Result<u64> {
    vg.lvs
        .get(name)
        .map(|lv| lv.used_extents())
        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(name.to_string())))
}

fn lv_pvs(vg: &VG, name: &str) -> Vec<String> {
    let mut pvs: Vec<String> = vg
        .lvs
        .get(name)
        .map(|lv| {
            crate::lv::used_areas(lv)
                .into_iter()
                .map(|(pv, _, _)| pv)
                .collect()
        })
        .unwrap_or_default();
    pvs.dedup();
    pvs
}

fn convert_to_mirror(vg: &mut VG, lv_name: &str, mirrors: u32, region_size: u64) -> Result<()> {
    if mirrors == 0 {
        return Err(Error::Metadata(MetadataError::Invalid(
            "mirror conversion needs at least one extra copy".into(),
        )));
    }
    let extents = lv_extents(vg, lv_name)?;

    // existing mapping becomes the first image
    let layer = LayerInsertion::insert(vg, lv_name, "_mimage_0")?;
    let mut images = vec![layer.hidden_child.clone()];
    let mut avoid = lv_pvs(vg, &layer.hidden_child);

    for n in 1..=mirrors {
        let image = alloc_hidden_lv(
            vg,
            format!("{}_mimage_{}", lv_name, n),
            extents,
            &avoid,
        )?;
        avoid.extend(lv_pvs(vg, &image));
        images.push(image);
    }

    let log = alloc_hidden_lv(vg, format!("{}_mlog", lv_name), 1, &avoid)?;

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Mirror {
            images,
            log: Some(log),
            region_size,
            extents_copied: 0,
        },
    }];
    Ok(())
}

fn mirror_to_raid1(vg: &mut VG, lv_name: &str) -> Result<()> {
    let (images, log) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::Mirror { images, log, .. } => (images.clone(), log.clone()),
        _ => unreachable!("matrix checked"),
    };
    let (region_size, extents) = {
        let seg = &vg.lvs[lv_name].segments[0];
        let region_size = match seg.ty {
            SegmentType::Mirror { region_size, .. } => region_size,
            _ => 0,
        };
        (region_size, seg.extent_count)
    };

    // the mirror log has no raid counterpart
    if let Some(log) = log {
        vg.lvs.remove(&log);
    }

    let mut new_images = Vec::new();
    let mut metas = Vec::new();
    for (n, image) in images.iter().enumerate() {
        let new_name = format!("{}_rimage_{}", lv_name, n);
        vg.lv_rename(image, &new_name)?;
        vg.lvs.get_mut(&new_name).expect("renamed").set_visible(false);
        new_images.push(new_name.clone());

        let meta = alloc_hidden_lv(
            vg,
            format!("{}_rmeta_{}", lv_name, n),
            1,
            &lv_pvs(vg, &new_name),
        )?;
        metas.push(meta);
    }

    let data_copies = new_images.len() as u64;
    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Raid {
            raid_type: "raid1".to_string(),
            images: new_images,
            meta_areas: metas,
            region_size,
            stripe_size: 0,
            data_copies,
            writebehind: 0,
            min_recovery_rate: 0,
            max_recovery_rate: 0,
            reshape_len: 0,
            data_offset: 0,
        },
    }];
    Ok(())
}

fn raid1_to_mirror(vg: &mut VG, lv_name: &str) -> Result<()> {
    let (images, metas, region_size, extents) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::Raid {
            images,
            meta_areas,
            region_size,
            ..
        } => (
            images.clone(),
            meta_areas.clone(),
            *region_size,
            vg.lvs[lv_name].segments[0].extent_count,
        ),
        _ => unreachable!("matrix checked"),
    };

    for meta in metas {
        vg.lvs.remove(&meta);
    }

    let mut new_images = Vec::new();
    for (n, image) in images.iter().enumerate() {
        let new_name = format!("{}_mimage_{}", lv_name, n);
        vg.lv_rename(image, &new_name)?;
        new_images.push(new_name);
    }

    let avoid: Vec<String> = new_images.iter().flat_map(|i| lv_pvs(vg, i)).collect();
    let log = alloc_hidden_lv(vg, format!("{}_mlog", lv_name), 1, &avoid)?;

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Mirror {
            images: new_images,
            log: Some(log),
            region_size,
            extents_copied: 0,
        },
    }];
    Ok(())
}

fn striped_to_raid(vg: &mut VG, lv_name: &str, raid_type: &str) -> Result<()> {
    let (stripes, stripe_size, extents) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::Striped {
            stripes,
            stripe_size,
        } => (
            stripes.clone(),
            stripe_size.unwrap_or(0),
            vg.lvs[lv_name].segments[0].extent_count,
        ),
        _ => unreachable!("matrix checked"),
    };

    if raid_type == "raid1" {
        // whole-LV copies, like the mirror path but with rmeta
        let layer = LayerInsertion::insert(vg, lv_name, "_rimage_0")?;
        let avoid = lv_pvs(vg, &layer.hidden_child);
        let image1 = alloc_hidden_lv(vg, format!("{}_rimage_1", lv_name), extents, &avoid)?;
        let meta0 = alloc_hidden_lv(vg, format!("{}_rmeta_0", lv_name), 1, &avoid)?;
        let meta1 = alloc_hidden_lv(
            vg,
            format!("{}_rmeta_1", lv_name),
            1,
            &lv_pvs(vg, &image1),
        )?;

        let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
        parent.segments = vec![Segment {
            start_extent: 0,
            extent_count: extents,
            tags: Vec::new(),
            ty: SegmentType::Raid {
                raid_type: "raid1".to_string(),
                images: vec![layer.hidden_child, image1],
                meta_areas: vec![meta0, meta1],
                region_size: 1024,
                stripe_size: 0,
                data_copies: 2,
                writebehind: 0,
                min_recovery_rate: 0,
                max_recovery_rate: 0,
                reshape_len: 0,
                data_offset: 0,
            },
        }];
        return Ok(());
    }

    // raid4/5/6: each stripe leg becomes a data image; parity images
    // are allocated fresh.
    let leg_extents = extents / stripes.len() as u64;
    let parity = if raid_type == "raid6" { 2 } else { 1 };

    let mut images = Vec::new();
    let mut metas = Vec::new();
    let mut avoid: Vec<String> = stripes.iter().map(|(pv, _)| pv.clone()).collect();

    for (n, (pv, start)) in stripes.iter().enumerate() {
        let image_name = format!("{}_rimage_{}", lv_name, n);
        if vg.lvs.contains_key(&image_name) {
            return Err(Error::Metadata(MetadataError::NameCollision(image_name)));
        }
        let seg = Segment {
            start_extent: 0,
            extent_count: leg_extents,
            tags: Vec::new(),
            ty: SegmentType::Striped {
                stripes: vec![(pv.clone(), *start)],
                stripe_size: None,
            },
        };
        let mut image = vg.lvs[lv_name].clone();
        image.name = image_name.clone();
        image.id = crate::util::make_uuid();
        image.segments = vec![seg];
        image.set_visible(false);
        vg.lvs.insert(image_name.clone(), image);
        images.push(image_name);
    }

    for p in 0..parity {
        let image = alloc_hidden_lv(
            vg,
            format!("{}_rimage_{}", lv_name, stripes.len() + p),
            leg_extents,
            &avoid,
        )?;
        avoid.extend(lv_pvs(vg, &image));
        images.push(image);
    }

    for (n, image) in images.clone().iter().enumerate() {
        let meta = alloc_hidden_lv(
            vg,
            format!("{}_rmeta_{}", lv_name, n),
            1,
            &lv_pvs(vg, image),
        )?;
        metas.push(meta);
    }

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Raid {
            raid_type: raid_type.to_string(),
            images,
            meta_areas: metas,
            region_size: 1024,
            stripe_size,
            data_copies: 1,
            writebehind: 0,
            min_recovery_rate: 0,
            max_recovery_rate: 0,
            reshape_len: 0,
            data_offset: 0,
        },
    }];
    Ok(())
}

fn raid_to_striped(vg: &mut VG, lv_name: &str) -> Result<()> {
    let (raid_type, images, metas, stripe_size, extents) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::Raid {
            raid_type,
            images,
            meta_areas,
            stripe_size,
            ..
        } => (
            raid_type.clone(),
            images.clone(),
            meta_areas.clone(),
            *stripe_size,
            vg.lvs[lv_name].segments[0].extent_count,
        ),
        _ => unreachable!("matrix checked"),
    };

    let data_count = match raid_type.as_str() {
        "raid1" => 1,
        "raid6" => images.len() - 2,
        "raid0" => images.len(),
        _ => images.len() - 1,
    };

    // every surviving data image must collapse to a single linear run
    let mut legs = Vec::new();
    for image in images.iter().take(data_count) {
        let image_lv = &vg.lvs[image];
        match image_lv.segments.as_slice() {
            [Segment {
                ty: SegmentType::Striped { stripes, .. },
                ..
            }] if stripes.len() == 1 => legs.push(stripes[0].clone()),
            _ => {
                return Err(unsupported(&raid_type, "striped"));
            }
        }
    }

    for dropped in images.iter().skip(data_count).chain(metas.iter()) {
        vg.lvs.remove(dropped);
    }
    for image in images.iter().take(data_count) {
        vg.lvs.remove(image);
    }

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Striped {
            stripes: legs,
            stripe_size: if data_count > 1 { Some(stripe_size.max(128)) } else { None },
        },
    }];
    Ok(())
}

fn thin_pool_attach(
    vg: &mut VG,
    lv_name: &str,
    metadata_extents: u64,
    chunk_size: u64,
) -> Result<()> {
    let extents = lv_extents(vg, lv_name)?;

    let layer = LayerInsertion::insert(vg, lv_name, "_tdata")?;
    let metadata = alloc_hidden_lv(
        vg,
        format!("{}_tmeta", lv_name),
        metadata_extents.max(1),
        &lv_pvs(vg, &layer.hidden_child),
    )?;

    // keep a spare at least as large as the largest pool metadata LV
    let meta_extents = lv_extents(vg, &metadata)?;
    if let Some(spare) = vg.pool_metadata_spare.clone() {
        let have = lv_extents(vg, &spare)?;
        if have < meta_extents {
            vg.lv_extend(&spare, meta_extents - have, &[])?;
        }
    } else {
        let spare = alloc_hidden_lv(vg, "lvol0_pmspare".to_string(), meta_extents, &[])?;
        vg.pool_metadata_spare = Some(spare);
    }

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::ThinPool {
            data: layer.hidden_child,
            metadata,
            transaction_id: 0,
            chunk_size: if chunk_size == 0 { 128 } else { chunk_size },
            discards: "passdown".to_string(),
            zero_new_blocks: false,
            messages: Vec::new(),
        },
    }];
    Ok(())
}

fn thin_pool_detach(vg: &mut VG, lv_name: &str) -> Result<()> {
    let (data, metadata) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::ThinPool { data, metadata, .. } => (data.clone(), metadata.clone()),
        _ => unreachable!("matrix checked"),
    };

    let has_thins = vg.lvs.values().any(|lv| {
        lv.segments.iter().any(|seg| match &seg.ty {
            SegmentType::Thin { pool, .. } => pool == lv_name,
            _ => false,
        })
    });
    if has_thins {
        return Err(Error::Metadata(MetadataError::InUse(lv_name.to_string())));
    }

    vg.lvs.remove(&metadata);
    LayerInsertion {
        parent: lv_name.to_string(),
        hidden_child: data,
    }
    .teardown(vg)
}

fn cache_pool_attach(vg: &mut VG, lv_name: &str, metadata_extents: u64) -> Result<()> {
    let extents = lv_extents(vg, lv_name)?;

    let layer = LayerInsertion::insert(vg, lv_name, "_cdata")?;
    let metadata = alloc_hidden_lv(
        vg,
        format!("{}_cmeta", lv_name),
        metadata_extents.max(1),
        &lv_pvs(vg, &layer.hidden_child),
    )?;

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::CachePool {
            data: layer.hidden_child,
            metadata,
            chunk_size: 128,
            cache_mode: "writethrough".to_string(),
            policy: "smq".to_string(),
            policy_settings: Default::default(),
        },
    }];
    // the pool itself carries no user data yet
    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.set_visible(false);
    Ok(())
}

fn cache_attach(vg: &mut VG, lv_name: &str, pool: &str) -> Result<()> {
    match vg.lvs.get(pool).map(|lv| &lv.segments[0].ty) {
        Some(SegmentType::CachePool { .. }) => {}
        Some(_) => return Err(unsupported("striped", "cache")),
        None => return Err(Error::Metadata(MetadataError::NotFound(pool.to_string()))),
    }

    // pool may not already cache something else
    let pool_used = vg.lvs.values().any(|lv| {
        lv.segments.iter().any(|seg| match &seg.ty {
            SegmentType::Cache { pool: p, .. } => p == pool,
            _ => false,
        })
    });
    if pool_used {
        return Err(Error::Metadata(MetadataError::InUse(pool.to_string())));
    }

    let extents = lv_extents(vg, lv_name)?;
    let layer = LayerInsertion::insert(vg, lv_name, "_corig")?;

    let parent = vg.lvs.get_mut(lv_name).expect("parent exists");
    parent.segments = vec![Segment {
        start_extent: 0,
        extent_count: extents,
        tags: Vec::new(),
        ty: SegmentType::Cache {
            pool: pool.to_string(),
            origin: layer.hidden_child,
        },
    }];
    Ok(())
}

fn cache_detach(vg: &mut VG, lv_name: &str) -> Result<()> {
    let (pool, origin) = match &vg.lvs[lv_name].segments[0].ty {
        SegmentType::Cache { pool, origin } => (pool.clone(), origin.clone()),
        _ => unreachable!("matrix checked"),
    };

    LayerInsertion {
        parent: lv_name.to_string(),
        hidden_child: origin,
    }
    .teardown(vg)?;

    // the detached pool becomes visible again for reuse or removal
    if let Some(pool_lv) = vg.lvs.get_mut(&pool) {
        pool_lv.set_visible(true);
    }
    Ok(())
}

/// The merge state of a snapshot cow LV.
pub fn merge_state(vg: &VG, cow_name: &str) -> MergeState {
    let link = vg.lvs.values().find_map(|lv| {
        lv.segments.iter().find_map(|seg| match &seg.ty {
            SegmentType::Snapshot { cow, merging, .. } if cow == cow_name => Some(*merging),
            _ => None,
        })
    });
    match link {
        None => MergeState::Merged,
        Some(false) => MergeState::Idle,
        Some(true) => {
            if vg.lvs[cow_name].has_status(LV_STATUS_MERGING) {
                MergeState::Merging
            } else {
                MergeState::Scheduled
            }
        }
    }
}

fn snapshot_merge(vg: &mut VG, cow_name: &str) -> Result<()> {
    let mut found = false;
    for lv in vg.lvs.values_mut() {
        for seg in &mut lv.segments {
            if let SegmentType::Snapshot { cow, merging, .. } = &mut seg.ty {
                if cow == cow_name {
                    if *merging {
                        return Err(Error::Metadata(MetadataError::InUse(cow_name.to_string())));
                    }
                    *merging = true;
                    found = true;
                }
            }
        }
    }
    if !found {
        return Err(unsupported("striped", "snapshot-merge"));
    }
    Ok(())
}

fn snapshot_split(vg: &mut VG, cow_name: &str) -> Result<()> {
    let link: Option<(String, String, bool)> = vg.lvs.values().find_map(|lv| {
        lv.segments.iter().find_map(|seg| match &seg.ty {
            SegmentType::Snapshot {
                origin,
                cow,
                merging,
                ..
            } if cow == cow_name => Some((lv.name.clone(), origin.clone(), *merging)),
            _ => None,
        })
    });

    let (link_name, origin, merging) = match link {
        Some(x) => x,
        None => return Err(unsupported("striped", "snapshot-split")),
    };
    if merging {
        return Err(Error::Metadata(MetadataError::InUse(cow_name.to_string())));
    }

    vg.lvs.remove(&link_name);
    if vg.snapshots_of(&origin).is_empty() {
        if let Some(origin_lv) = vg.lvs.get_mut(&origin) {
            origin_lv.clear_status(LV_STATUS_ORIGIN);
        }
    }
    Ok(())
}

/// Activation-side completion of a scheduled merge: the origin takes
/// over the merged content and the snapshot disappears.
pub fn snapshot_merge_finish(vg: &mut VG, cow_name: &str) -> Result<()> {
    let link: Option<(String, String)> = vg.lvs.values().find_map(|lv| {
        lv.segments.iter().find_map(|seg| match &seg.ty {
            SegmentType::Snapshot {
                origin,
                cow,
                merging: true,
                ..
            } if cow == cow_name => Some((lv.name.clone(), origin.clone())),
            _ => None,
        })
    });

    let (link_name, origin) = link.ok_or_else(|| {
        Error::Metadata(MetadataError::Invalid(format!(
            "{} has no scheduled merge",
            cow_name
        )))
    })?;

    vg.lvs.remove(&link_name);
    vg.lvs.remove(cow_name);
    if vg.snapshots_of(&origin).is_empty() {
        if let Some(origin_lv) = vg.lvs.get_mut(&origin) {
            origin_lv.clear_status(LV_STATUS_ORIGIN);
        }
    }
    Ok(())
}

/// Create a thin LV inside a pool and queue the matching pool message.
pub fn thin_create(vg: &mut VG, pool_name: &str, name: &str, virtual_extents: u64) -> Result<()> {
    let next_id = {
        let seg_ty = vg
            .lvs
            .get(pool_name)
            .and_then(|lv| lv.segments.first())
            .map(|seg| &seg.ty);
        match seg_ty {
            Some(SegmentType::ThinPool { .. }) => {}
            _ => {
                return Err(Error::Metadata(MetadataError::NotFound(
                    pool_name.to_string(),
                )))
            }
        }
        vg.lvs
            .values()
            .flat_map(|lv| lv.segments.iter())
            .filter_map(|seg| match &seg.ty {
                SegmentType::Thin {
                    pool, device_id, ..
                } if pool == pool_name => Some(*device_id),
                _ => None,
            })
            .max()
            .map(|id| id + 1)
            .unwrap_or(1)
    };

    if vg.lvs.contains_key(name) {
        return Err(Error::Metadata(MetadataError::NameCollision(
            name.to_string(),
        )));
    }

    let mut thin = {
        let pool = &vg.lvs[pool_name];
        let mut lv = pool.clone();
        lv.name = name.to_string();
        lv.id = crate::util::make_uuid();
        lv.tags = Vec::new();
        lv
    };
    thin.segments = vec![Segment {
        start_extent: 0,
        extent_count: virtual_extents,
        tags: Vec::new(),
        ty: SegmentType::Thin {
            pool: pool_name.to_string(),
            device_id: next_id,
            origin: None,
            external_origin: None,
            merge: None,
        },
    }];
    thin.set_visible(true);
    vg.lvs.insert(name.to_string(), thin);

    if let Some(SegmentType::ThinPool {
        messages,
        transaction_id,
        ..
    }) = vg
        .lvs
        .get_mut(pool_name)
        .and_then(|lv| lv.segments.first_mut())
        .map(|seg| &mut seg.ty)
    {
        messages.push(ThinMessage::Create(name.to_string()));
        *transaction_id += 1;
    }
    Ok(())
}

/// Compare a pool's recorded transaction id against the one reported
/// by the kernel-side thin tools. A drift of exactly one is tolerated
/// without repair; anything larger is a consistency error.
pub fn thin_pool_check_transaction(vg: &VG, pool_name: &str, kernel_txid: u64) -> Result<bool> {
    let recorded = vg
        .lvs
        .get(pool_name)
        .and_then(|lv| lv.segments.first())
        .and_then(|seg| match &seg.ty {
            SegmentType::ThinPool { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        })
        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(pool_name.to_string())))?;

    let drift = recorded.max(kernel_txid) - recorded.min(kernel_txid);
    if drift > 1 {
        return Err(Error::Metadata(MetadataError::Inconsistent(format!(
            "pool {} transaction_id {} vs kernel {}",
            pool_name, recorded, kernel_txid
        ))));
    }
    Ok(drift == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::{PV, PV_STATUS_ALLOCATABLE};
    use crate::vg::{LvCreate, DEFAULT_EXTENT_SIZE};

    fn test_pv(id: &str, device: &str, pe_count: u64) -> PV {
        PV {
            id: id.to_string(),
            device: device.to_string(),
            status: vec![PV_STATUS_ALLOCATABLE.to_string()],
            flags: vec![],
            tags: vec![],
            dev_size: pe_count * DEFAULT_EXTENT_SIZE + 2048,
            pe_start: 2048,
            pe_count,
            dev_path: None,
            mdas: Vec::new(),
        }
    }

    fn test_vg() -> VG {
        let mut vg = VG::alloc_vg("vg0", DEFAULT_EXTENT_SIZE);
        vg.seqno = 7;
        vg.add_pv(test_pv("pva-uuid", "/dev/pva", 100)).unwrap();
        vg.add_pv(test_pv("pvb-uuid", "/dev/pvb", 100)).unwrap();
        vg
    }

    #[test]
    fn linear_to_mirror() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();

        lv_convert(
            &mut vg,
            "lv0",
            &LvConvert::Mirror {
                mirrors: 1,
                region_size: 1024,
            },
        )
        .unwrap();

        let lv = &vg.lvs["lv0"];
        match &lv.segments[0].ty {
            SegmentType::Mirror { images, log, .. } => {
                assert_eq!(
                    images,
                    &vec!["lv0_mimage_0".to_string(), "lv0_mimage_1".to_string()]
                );
                assert_eq!(log.as_deref(), Some("lv0_mlog"));
            }
            other => panic!("expected mirror segment, got {:?}", other),
        }
        // the images are hidden, linear, and on distinct PVs
        assert!(!vg.lvs["lv0_mimage_0"].is_visible());
        assert!(!vg.lvs["lv0_mimage_1"].is_visible());
        assert_eq!(vg.lvs["lv0_mimage_0"].used_extents(), 50);
        assert_eq!(vg.lvs["lv0_mimage_1"].used_extents(), 50);
        assert_ne!(
            crate::lv::used_areas(&vg.lvs["lv0_mimage_0"])[0].0,
            crate::lv::used_areas(&vg.lvs["lv0_mimage_1"])[0].0
        );
        assert_eq!(vg.lvs["lv0_mlog"].used_extents(), 1);
        vg.validate().unwrap();
    }

    #[test]
    fn forbidden_conversion_is_rejected_before_mutation() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        let before = vg.clone();

        match lv_convert(&mut vg, "lv0", &LvConvert::CacheDetach) {
            Err(Error::Metadata(MetadataError::UnsupportedConversion { .. })) => {}
            other => panic!("expected ERR_UNSUPPORTED_CONVERSION, got {:?}", other),
        }
        assert_eq!(vg, before);
    }

    #[test]
    fn mirror_raid1_round_trip() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 30)).unwrap();
        lv_convert(
            &mut vg,
            "lv0",
            &LvConvert::Mirror {
                mirrors: 1,
                region_size: 1024,
            },
        )
        .unwrap();

        lv_convert(&mut vg, "lv0", &LvConvert::MirrorToRaid1).unwrap();
        match &vg.lvs["lv0"].segments[0].ty {
            SegmentType::Raid {
                raid_type, images, meta_areas, ..
            } => {
                assert_eq!(raid_type, "raid1");
                assert_eq!(images.len(), 2);
                assert_eq!(meta_areas.len(), 2);
            }
            other => panic!("expected raid1, got {:?}", other),
        }
        assert!(!vg.lvs.contains_key("lv0_mlog"));
        vg.validate().unwrap();

        lv_convert(&mut vg, "lv0", &LvConvert::Raid1ToMirror).unwrap();
        match &vg.lvs["lv0"].segments[0].ty {
            SegmentType::Mirror { images, .. } => assert_eq!(images.len(), 2),
            other => panic!("expected mirror, got {:?}", other),
        }
        vg.validate().unwrap();
    }

    #[test]
    fn thin_pool_attach_and_create() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("pool0", 40)).unwrap();
        lv_convert(
            &mut vg,
            "pool0",
            &LvConvert::ThinPoolAttach {
                metadata_extents: 2,
                chunk_size: 128,
            },
        )
        .unwrap();

        match &vg.lvs["pool0"].segments[0].ty {
            SegmentType::ThinPool { data, metadata, .. } => {
                assert_eq!(data, "pool0_tdata");
                assert_eq!(metadata, "pool0_tmeta");
            }
            other => panic!("expected thin-pool, got {:?}", other),
        }
        assert_eq!(vg.pool_metadata_spare.as_deref(), Some("lvol0_pmspare"));
        vg.validate().unwrap();

        thin_create(&mut vg, "pool0", "thin1", 1000).unwrap();
        match &vg.lvs["thin1"].segments[0].ty {
            SegmentType::Thin {
                pool, device_id, ..
            } => {
                assert_eq!(pool, "pool0");
                assert_eq!(*device_id, 1);
            }
            other => panic!("expected thin, got {:?}", other),
        }
        vg.validate().unwrap();

        // pool with thins refuses detach
        match lv_convert(&mut vg, "pool0", &LvConvert::ThinPoolDetach) {
            Err(Error::Metadata(MetadataError::InUse(_))) => {}
            other => panic!("expected ERR_IN_USE, got {:?}", other),
        }
    }

    #[test]
    fn thin_transaction_drift_tolerance() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("pool0", 40)).unwrap();
        lv_convert(
            &mut vg,
            "pool0",
            &LvConvert::ThinPoolAttach {
                metadata_extents: 2,
                chunk_size: 128,
            },
        )
        .unwrap();
        thin_create(&mut vg, "pool0", "thin1", 100).unwrap();

        // recorded id is 1 after the create message
        assert!(thin_pool_check_transaction(&vg, "pool0", 1).unwrap());
        // one behind or ahead does not trigger repair
        assert!(!thin_pool_check_transaction(&vg, "pool0", 0).unwrap());
        assert!(!thin_pool_check_transaction(&vg, "pool0", 2).unwrap());
        // larger drift is a consistency error
        assert!(thin_pool_check_transaction(&vg, "pool0", 5).is_err());
    }

    #[test]
    fn snapshot_merge_lifecycle() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        let mut spec = LvCreate::new("snap", 20);
        spec.cow_of = Some("lv0".to_string());
        spec.chunk_size = Some(8);
        vg.lv_create(&spec).unwrap();
        assert_eq!(merge_state(&vg, "snap"), MergeState::Idle);

        lv_convert(&mut vg, "snap", &LvConvert::SnapshotMerge).unwrap();
        assert_eq!(merge_state(&vg, "snap"), MergeState::Scheduled);
        vg.validate().unwrap();

        snapshot_merge_finish(&mut vg, "snap").unwrap();
        assert!(!vg.lvs.contains_key("snap"));
        assert!(vg.lvs.contains_key("lv0"));
        assert!(!vg.lvs["lv0"].has_status(LV_STATUS_ORIGIN));
        assert_eq!(merge_state(&vg, "snap"), MergeState::Merged);
        vg.validate().unwrap();
    }

    #[test]
    fn cache_attach_detach() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 40)).unwrap();
        vg.lv_create(&LvCreate::new("fast", 10)).unwrap();
        lv_convert(
            &mut vg,
            "fast",
            &LvConvert::CachePoolAttach { metadata_extents: 1 },
        )
        .unwrap();
        lv_convert(
            &mut vg,
            "lv0",
            &LvConvert::CacheAttach {
                pool: "fast".to_string(),
            },
        )
        .unwrap();

        match &vg.lvs["lv0"].segments[0].ty {
            SegmentType::Cache { pool, origin } => {
                assert_eq!(pool, "fast");
                assert_eq!(origin, "lv0_corig");
            }
            other => panic!("expected cache, got {:?}", other),
        }
        vg.validate().unwrap();

        lv_convert(&mut vg, "lv0", &LvConvert::CacheDetach).unwrap();
        match &vg.lvs["lv0"].segments[0].ty {
            SegmentType::Striped { .. } => {}
            other => panic!("expected striped after detach, got {:?}", other),
        }
        assert!(!vg.lvs.contains_key("lv0_corig"));
        vg.validate().unwrap();
    }
}
