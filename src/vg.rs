// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Volume Groups

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::allocation::{allocate, AllocPiece, AllocPolicy, AllocRequest, FreeMap};
use crate::lv::{self, Segment, SegmentType, ThinMessage, LV, LV_STATUS_VISIBLE};
use crate::parser::{status_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::pv::{self, PV};
use crate::util::{hostname, make_uuid, now_seconds};
use crate::{Error, MetadataError, Result};

pub const DEFAULT_EXTENT_SIZE: u64 = 8192; // 4MiB in sectors

pub const VG_STATUS_READ: &str = "READ";
pub const VG_STATUS_WRITE: &str = "WRITE";
pub const VG_STATUS_RESIZEABLE: &str = "RESIZEABLE";
pub const VG_STATUS_EXPORTED: &str = "EXPORTED";
pub const VG_STATUS_CLUSTERED: &str = "CLUSTERED";
pub const VG_STATUS_SHARED: &str = "SHARED";
pub const VG_STATUS_PARTIAL: &str = "PARTIAL";

/// Origin marker carried in LV status while snapshots reference it.
pub const LV_STATUS_ORIGIN: &str = "ORIGIN";

/// Tombstone for a removed thin LV still referenced by an extant
/// snapshot graph.
#[derive(Debug, PartialEq, Clone)]
pub struct HistoricalLv {
    pub name: String,
    pub id: String,
    pub removal_time: i64,
    pub origin: Option<String>,
    pub descendants: Vec<String>,
}

/// Parameters for `lv_create`.
#[derive(Debug, Clone, Default)]
pub struct LvCreate {
    pub name: String,
    pub extents: u64,
    /// Parallel stripes; 1 means linear.
    pub stripes: u32,
    pub stripe_size: Option<u64>,
    pub policy: Option<AllocPolicy>,
    pub pv_hints: Vec<String>,
    /// Create a snapshot of this origin; `extents` sizes the cow store.
    pub cow_of: Option<String>,
    pub chunk_size: Option<u64>,
    pub tags: Vec<String>,
}

impl LvCreate {
    pub fn new(name: &str, extents: u64) -> LvCreate {
        LvCreate {
            name: name.to_string(),
            extents,
            stripes: 1,
            ..Default::default()
        }
    }
}

/// A Volume Group allows multiple Physical Volumes to be treated as a
/// storage pool that can then be used to allocate Logical Volumes.
#[derive(Debug, PartialEq, Clone)]
pub struct VG {
    /// Name.
    pub name: String,
    /// Uuid.
    pub id: String,
    /// The generation of metadata this VG represents. Bumped by the
    /// metadata store on commit, never by mutators.
    pub seqno: u64,
    /// Always "lvm2".
    pub format: String,
    /// Status.
    pub status: Vec<String>,
    /// Flags.
    pub flags: Vec<String>,
    /// Size of each extent, in 512-byte sectors.
    pub extent_size: u64,
    /// Maximum number of LVs, 0 means no limit.
    pub max_lv: u64,
    /// Maximum number of PVs, 0 means no limit.
    pub max_pv: u64,
    /// Target number of active metadata areas; 0 means all.
    pub metadata_copies: u64,
    /// Host ownership for non-clustered foreign protection.
    pub system_id: Option<String>,
    /// "none", "sanlock", "dlm", "idm" or legacy "clvm".
    pub lock_type: Option<String>,
    /// Lock-manager specific blob.
    pub lock_args: Option<String>,
    /// Configuration profile name.
    pub profile: Option<String>,
    /// Hidden spare kept at least as large as the largest pool metadata LV.
    pub pool_metadata_spare: Option<String>,
    /// The internal lease LV for sanlock VGs.
    pub sanlock_lv: Option<String>,
    /// Physical Volumes within this volume group, keyed by uuid.
    pub pvs: BTreeMap<String, PV>,
    /// Logical Volumes within this volume group, keyed by name.
    pub lvs: BTreeMap<String, LV>,
    /// Tombstones of removed thin LVs.
    pub historical_lvs: BTreeMap<String, HistoricalLv>,
}

impl VG {
    /// A new empty VG, not yet backed by any PV.
    pub fn alloc_vg(name: &str, extent_size: u64) -> VG {
        VG {
            name: name.to_string(),
            id: make_uuid(),
            seqno: 0,
            format: "lvm2".to_string(),
            status: vec![
                VG_STATUS_READ.to_string(),
                VG_STATUS_WRITE.to_string(),
                VG_STATUS_RESIZEABLE.to_string(),
            ],
            flags: Vec::new(),
            extent_size: if extent_size == 0 {
                DEFAULT_EXTENT_SIZE
            } else {
                extent_size
            },
            max_lv: 0,
            max_pv: 0,
            metadata_copies: 0,
            system_id: None,
            lock_type: None,
            lock_args: None,
            profile: None,
            pool_metadata_spare: None,
            sanlock_lv: None,
            pvs: BTreeMap::new(),
            lvs: BTreeMap::new(),
            historical_lvs: BTreeMap::new(),
        }
    }

    /// Construct a `VG` from its name and an `LvmTextMap`.
    pub fn from_textmap(name: &str, map: &LvmTextMap) -> Result<VG> {
        let err = || Error::Parse("vg textmap parsing error".into());

        let id = map.string_from_textmap("id").ok_or_else(err)?;
        let seqno = map.u64_from_textmap("seqno").ok_or_else(err)?;
        let format = map
            .string_from_textmap("format")
            .unwrap_or("lvm2")
            .to_string();
        let extent_size = map.u64_from_textmap("extent_size").ok_or_else(err)?;
        let max_lv = map.u64_from_textmap("max_lv").unwrap_or(0);
        let max_pv = map.u64_from_textmap("max_pv").unwrap_or(0);
        let metadata_copies = map.u64_from_textmap("metadata_copies").unwrap_or(0);

        let status = status_from_textmap(map)?;
        let flags = map.string_list_from_textmap("flags").unwrap_or_default();

        // The textmap uses "pv0"-style names to link physical volume
        // definitions with LV segment stripes, but those ordinals are
        // not stable across pv removal. Internally PVs are keyed by
        // uuid; the pvname_to_id table translates segment references
        // while parsing.
        let mut pvname_to_id = BTreeMap::new();
        let mut pvs = BTreeMap::new();
        let pv_section = map.textmap_from_textmap("physical_volumes").ok_or_else(err)?;
        for (key, value) in pv_section {
            match value {
                Entry::TextMap(ref pv_dict) => {
                    let pv = pv::from_textmap(pv_dict)?;
                    pvname_to_id.insert(key.clone(), pv.id.clone());
                    pvs.insert(pv.id.clone(), pv);
                }
                _ => return Err(err()),
            }
        }

        // "logical_volumes" may be absent
        let mut lvs = BTreeMap::new();
        if let Some(tm) = map.textmap_from_textmap("logical_volumes") {
            for (key, value) in tm {
                match value {
                    Entry::TextMap(ref lv_dict) => {
                        lvs.insert(key.clone(), lv::from_textmap(key, lv_dict, &pvname_to_id)?);
                    }
                    _ => return Err(err()),
                }
            }
        }

        let mut historical_lvs = BTreeMap::new();
        if let Some(tm) = map.textmap_from_textmap("historical_logical_volumes") {
            for (key, value) in tm {
                match value {
                    Entry::TextMap(ref hlv_dict) => {
                        historical_lvs.insert(
                            key.clone(),
                            HistoricalLv {
                                name: key.clone(),
                                id: hlv_dict
                                    .string_from_textmap("id")
                                    .ok_or_else(err)?
                                    .to_string(),
                                removal_time: hlv_dict
                                    .i64_from_textmap("removal_time")
                                    .unwrap_or(0),
                                origin: hlv_dict
                                    .string_from_textmap("origin")
                                    .map(|s| s.to_string()),
                                descendants: hlv_dict
                                    .string_list_from_textmap("descendants")
                                    .unwrap_or_default(),
                            },
                        );
                    }
                    _ => return Err(err()),
                }
            }
        }

        Ok(VG {
            name: name.to_string(),
            id: id.to_string(),
            seqno,
            format,
            status,
            flags,
            extent_size,
            max_lv,
            max_pv,
            metadata_copies,
            system_id: map.string_from_textmap("system_id").map(|s| s.to_string()),
            lock_type: map.string_from_textmap("lock_type").map(|s| s.to_string()),
            lock_args: map.string_from_textmap("lock_args").map(|s| s.to_string()),
            profile: map.string_from_textmap("profile").map(|s| s.to_string()),
            pool_metadata_spare: map
                .string_from_textmap("pool_metadata_spare")
                .map(|s| s.to_string()),
            sanlock_lv: map.string_from_textmap("sanlock_lv").map(|s| s.to_string()),
            pvs,
            lvs,
            historical_lvs,
        })
    }

    pub fn to_textmap(&self) -> LvmTextMap {
        let mut map = LvmTextMap::new();

        map.insert("id".to_string(), Entry::String(self.id.clone()));
        map.insert("seqno".to_string(), Entry::Number(self.seqno as i64));
        map.insert("format".to_string(), Entry::String(self.format.clone()));

        map.insert(
            "status".to_string(),
            Entry::List(Box::new(
                self.status
                    .iter()
                    .map(|x| Entry::String(x.clone()))
                    .collect(),
            )),
        );
        map.insert(
            "flags".to_string(),
            Entry::List(Box::new(
                self.flags
                    .iter()
                    .map(|x| Entry::String(x.clone()))
                    .collect(),
            )),
        );

        map.insert(
            "extent_size".to_string(),
            Entry::Number(self.extent_size as i64),
        );
        map.insert("max_lv".to_string(), Entry::Number(self.max_lv as i64));
        map.insert("max_pv".to_string(), Entry::Number(self.max_pv as i64));
        map.insert(
            "metadata_copies".to_string(),
            Entry::Number(self.metadata_copies as i64),
        );

        for (key, val) in [
            ("system_id", &self.system_id),
            ("lock_type", &self.lock_type),
            ("lock_args", &self.lock_args),
            ("profile", &self.profile),
            ("pool_metadata_spare", &self.pool_metadata_spare),
            ("sanlock_lv", &self.sanlock_lv),
        ] {
            if let Some(val) = val {
                map.insert(key.to_string(), Entry::String(val.clone()));
            }
        }

        // Assign ordinals so the textmap can use "pv0"-style strings to
        // link pvs with LV stripes.
        let id_to_pvname: BTreeMap<String, String> = self
            .pvs
            .values()
            .enumerate()
            .map(|(num, pv)| (pv.id.clone(), format!("pv{}", num)))
            .collect();

        map.insert(
            "physical_volumes".to_string(),
            Entry::TextMap(Box::new(
                self.pvs
                    .values()
                    .map(|pv| {
                        (
                            id_to_pvname[&pv.id].clone(),
                            Entry::TextMap(Box::new(pv::to_textmap(pv))),
                        )
                    })
                    .collect(),
            )),
        );

        if !self.lvs.is_empty() {
            map.insert(
                "logical_volumes".to_string(),
                Entry::TextMap(Box::new(
                    self.lvs
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.clone(),
                                Entry::TextMap(Box::new(lv::to_textmap(v, &id_to_pvname))),
                            )
                        })
                        .collect(),
                )),
            );
        }

        if !self.historical_lvs.is_empty() {
            map.insert(
                "historical_logical_volumes".to_string(),
                Entry::TextMap(Box::new(
                    self.historical_lvs
                        .iter()
                        .map(|(k, h)| {
                            let mut m = LvmTextMap::new();
                            m.insert("id".to_string(), Entry::String(h.id.clone()));
                            m.insert(
                                "removal_time".to_string(),
                                Entry::Number(h.removal_time),
                            );
                            if let Some(ref origin) = h.origin {
                                m.insert("origin".to_string(), Entry::String(origin.clone()));
                            }
                            if !h.descendants.is_empty() {
                                m.insert(
                                    "descendants".to_string(),
                                    Entry::List(Box::new(
                                        h.descendants
                                            .iter()
                                            .map(|x| Entry::String(x.clone()))
                                            .collect(),
                                    )),
                                );
                            }
                            (k.clone(), Entry::TextMap(Box::new(m)))
                        })
                        .collect(),
                )),
            );
        }

        map
    }

    /// The total number of extents in the volume group.
    pub fn extents(&self) -> u64 {
        self.pvs.values().map(|x| x.pe_count).sum()
    }

    /// The total number of extents in use in the volume group.
    pub fn extents_in_use(&self) -> u64 {
        self.used_areas()
            .values()
            .map(|areas| areas.values().sum::<u64>())
            .sum()
    }

    /// The total number of free extents in the volume group.
    pub fn extents_free(&self) -> u64 {
        self.extents() - self.extents_in_use()
    }

    /// Extents allocated on one PV.
    pub fn pv_alloc_count(&self, pv_id: &str) -> u64 {
        self.used_areas()
            .get(pv_id)
            .map(|areas| areas.values().sum())
            .unwrap_or(0)
    }

    pub fn is_partial(&self) -> bool {
        self.pvs.values().any(|pv| pv.is_missing())
    }

    pub fn is_exported(&self) -> bool {
        self.status.iter().any(|s| s == VG_STATUS_EXPORTED)
    }

    pub fn is_shared(&self) -> bool {
        match self.lock_type.as_deref() {
            Some("sanlock") | Some("dlm") | Some("idm") => true,
            _ => false,
        }
    }

    pub fn is_clustered(&self) -> bool {
        self.status.iter().any(|s| s == VG_STATUS_CLUSTERED)
    }

    // Returns used areas in the format: {pv uuid: {start: len} }
    //
    // e.g. with {"pva": {0: 45, 47: 100, 147: 200} }
    // extents 0-44 (inclusive) are used, 45 and 46 are not, 47-146
    // are used, then 147-346 are used.
    //
    // Adjacent used areas are not merged.
    //
    // PVs with no used areas are not in the outer map at all.
    //
    pub fn used_areas(&self) -> BTreeMap<String, BTreeMap<u64, u64>> {
        let mut used_map = BTreeMap::new();

        for lv in self.lvs.values() {
            for (pv_id, start, len) in lv::used_areas(lv) {
                used_map
                    .entry(pv_id)
                    .or_insert_with(BTreeMap::new)
                    .insert(start, len);
            }
        }

        used_map
    }

    // Returns unused areas in the format: {pv uuid: {start: len} },
    // considering only allocatable, present PVs.
    //
    // e.g. assuming the same "pva" as above with 1000 extents,
    // free_areas gives {"pva": {45: 2, 347: 653} }
    //
    pub fn free_areas(&self) -> FreeMap {
        let mut free_map = BTreeMap::new();

        for (pv_id, mut area_map) in self.used_areas() {
            let pv = match self.pvs.get(&pv_id) {
                Some(pv) => pv,
                None => continue,
            };
            if !pv.is_allocatable() {
                continue;
            }

            // Insert an entry to mark the end of the PV so the fold
            // works correctly
            area_map.insert(pv.pe_count, 0);

            area_map.iter().fold(0, |prev_end, (start, len)| {
                if prev_end < *start {
                    free_map
                        .entry(pv_id.clone())
                        .or_insert_with(BTreeMap::new)
                        .insert(prev_end, start - prev_end);
                }
                start + len
            });
        }

        // Also return completely-unused PVs
        for (pv_id, pv) in &self.pvs {
            if pv.is_allocatable() && !free_map.contains_key(pv_id) && !self.used_areas().contains_key(pv_id) {
                let mut map = BTreeMap::new();
                map.insert(0, pv.pe_count);
                free_map.insert(pv_id.clone(), map);
            }
        }

        free_map
    }

    fn require_writable(&self) -> Result<()> {
        if self.is_exported() {
            return Err(Error::Metadata(MetadataError::Exported(self.name.clone())));
        }
        Ok(())
    }

    fn require_complete(&self) -> Result<()> {
        if self.is_partial() {
            return Err(Error::Metadata(MetadataError::Partial(self.name.clone())));
        }
        Ok(())
    }

    /// Add a PV that is not part of any VG.
    pub fn add_pv(&mut self, pv: PV) -> Result<()> {
        self.require_writable()?;
        if self.max_pv > 0 && self.pvs.len() as u64 >= self.max_pv {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "VG {} already has max_pv={} PVs",
                self.name, self.max_pv
            ))));
        }
        if self.pvs.contains_key(&pv.id) {
            return Err(Error::Metadata(MetadataError::NameCollision(pv.id)));
        }
        if self.pvs.values().any(|p| p.device == pv.device) {
            return Err(Error::Metadata(MetadataError::NameCollision(pv.device)));
        }
        debug!("vg {}: adding pv {} ({})", self.name, pv.id, pv.device);
        self.pvs.insert(pv.id.clone(), pv);
        Ok(())
    }

    /// Remove a PV. It must be unused by any LVs.
    pub fn remove_pv(&mut self, pv_id: &str) -> Result<PV> {
        self.require_writable()?;
        if !self.pvs.contains_key(pv_id) {
            return Err(Error::Metadata(MetadataError::NotFound(pv_id.to_string())));
        }
        if self.used_areas().contains_key(pv_id) {
            return Err(Error::Metadata(MetadataError::PvInUse(pv_id.to_string())));
        }
        Ok(self.pvs.remove(pv_id).expect("checked above"))
    }

    fn new_lv(&self, name: &str, visible: bool, segments: Vec<Segment>, tags: Vec<String>) -> LV {
        let mut status = vec!["READ".to_string(), "WRITE".to_string()];
        if visible {
            status.push(LV_STATUS_VISIBLE.to_string());
        }
        LV {
            name: name.to_string(),
            id: make_uuid(),
            status,
            flags: Vec::new(),
            tags,
            creation_host: hostname(),
            creation_time: now_seconds(),
            allocation_policy: None,
            read_ahead: None,
            major: None,
            minor: None,
            lock_args: None,
            profile: None,
            segments,
        }
    }

    fn check_new_lv_name(&self, name: &str) -> Result<()> {
        if self.lvs.contains_key(name) || self.historical_lvs.contains_key(name) {
            return Err(Error::Metadata(MetadataError::NameCollision(
                name.to_string(),
            )));
        }
        if self.max_lv > 0
            && self.lvs.values().filter(|lv| lv.is_visible()).count() as u64 >= self.max_lv
        {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "VG {} already has max_lv={} LVs",
                self.name, self.max_lv
            ))));
        }
        Ok(())
    }

    /// Turn allocation pieces into striped segments appended at `start`.
    fn pieces_to_segments(start: u64, pieces: &[AllocPiece]) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut le = start;
        for (pv_id, pe_start, len) in pieces {
            segments.push(Segment {
                start_extent: le,
                extent_count: *len,
                tags: Vec::new(),
                ty: SegmentType::Striped {
                    stripes: vec![(pv_id.clone(), *pe_start)],
                    stripe_size: None,
                },
            });
            le += len;
        }
        segments
    }

    /// Allocate extents honoring the request and the VG's policy.
    pub fn alloc_extents(&self, req: &AllocRequest, policy: Option<AllocPolicy>) -> Result<Vec<AllocPiece>> {
        let policy = match policy.unwrap_or(AllocPolicy::Inherit) {
            AllocPolicy::Inherit => AllocPolicy::Normal,
            p => p,
        };
        allocate(&self.free_areas(), policy, req)
    }

    /// Create a new logical volume. Striped and linear layouts are
    /// created directly; `cow_of` creates a snapshot whose cow store is
    /// sized by `extents`.
    pub fn lv_create(&mut self, spec: &LvCreate) -> Result<&LV> {
        self.require_writable()?;
        self.require_complete()?;
        self.check_new_lv_name(&spec.name)?;

        if spec.extents == 0 {
            return Err(Error::Metadata(MetadataError::Invalid(
                "new LV needs at least one extent".into(),
            )));
        }

        if let Some(ref origin_name) = spec.cow_of {
            return self.snapshot_create(spec, origin_name.clone());
        }

        let stripes = spec.stripes.max(1) as u64;
        if spec.extents % stripes != 0 {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "{} extents cannot be striped {} ways",
                spec.extents, stripes
            ))));
        }

        let mut segments = Vec::new();
        if stripes == 1 {
            let req = AllocRequest {
                extents: spec.extents,
                pv_hints: &spec.pv_hints,
                ..Default::default()
            };
            let pieces = self.alloc_extents(&req, spec.policy)?;
            segments = Self::pieces_to_segments(0, &pieces);
        } else {
            // one leg per stripe, each on a distinct PV
            let per_leg = spec.extents / stripes;
            let mut legs: Vec<AllocPiece> = Vec::new();
            let mut avoid: Vec<String> = Vec::new();
            for _ in 0..stripes {
                let req = AllocRequest {
                    extents: per_leg,
                    pv_hints: &spec.pv_hints,
                    avoid: &avoid,
                    ..Default::default()
                };
                let pieces = self.alloc_extents(&req, spec.policy)?;
                // a striped leg must be a single run
                if pieces.len() != 1 {
                    return Err(Error::Metadata(MetadataError::InsufficientFreeExtents {
                        requested: per_leg,
                        available: pieces.iter().map(|p| p.2).sum(),
                    }));
                }
                avoid.push(pieces[0].0.clone());
                legs.push(pieces.into_iter().next().expect("checked len"));
            }
            segments.push(Segment {
                start_extent: 0,
                extent_count: spec.extents,
                tags: Vec::new(),
                ty: SegmentType::Striped {
                    stripes: legs.into_iter().map(|(pv, start, _)| (pv, start)).collect(),
                    stripe_size: spec.stripe_size.or(Some(128)),
                },
            });
        }

        let lv = self.new_lv(&spec.name, true, segments, spec.tags.clone());
        debug!("vg {}: created lv {}", self.name, lv.name);
        self.lvs.insert(spec.name.clone(), lv);
        Ok(&self.lvs[&spec.name])
    }

    // Snapshot creation: the visible LV is the cow store; a hidden
    // snapshotN LV links origin and cow.
    fn snapshot_create(&mut self, spec: &LvCreate, origin_name: String) -> Result<&LV> {
        let origin_extents = match self.lvs.get(&origin_name) {
            Some(origin) => origin.used_extents(),
            None => {
                return Err(Error::Metadata(MetadataError::NotFound(origin_name)));
            }
        };

        let req = AllocRequest {
            extents: spec.extents,
            pv_hints: &spec.pv_hints,
            ..Default::default()
        };
        let pieces = self.alloc_extents(&req, spec.policy)?;
        let cow_segments = Self::pieces_to_segments(0, &pieces);

        let cow = self.new_lv(&spec.name, true, cow_segments, spec.tags.clone());
        self.lvs.insert(spec.name.clone(), cow);

        let link_name = self.next_internal_name("snapshot");
        let link_seg = Segment {
            start_extent: 0,
            extent_count: origin_extents,
            tags: Vec::new(),
            ty: SegmentType::Snapshot {
                origin: origin_name.clone(),
                cow: spec.name.clone(),
                chunk_size: spec.chunk_size.unwrap_or(8),
                merging: false,
            },
        };
        let mut link = self.new_lv(&link_name, false, vec![link_seg], Vec::new());
        link.set_visible(false);
        self.lvs.insert(link_name, link);

        if let Some(origin) = self.lvs.get_mut(&origin_name) {
            origin.add_status(LV_STATUS_ORIGIN);
        }

        Ok(&self.lvs[&spec.name])
    }

    /// First unused name of the form `{base}{N}`.
    pub fn next_internal_name(&self, base: &str) -> String {
        for i in 0.. {
            let name = format!("{}{}", base, i);
            if !self.lvs.contains_key(&name) && !self.historical_lvs.contains_key(&name) {
                return name;
            }
        }
        unreachable!()
    }

    /// Snapshot link segments whose origin is `name`.
    pub fn snapshots_of(&self, name: &str) -> Vec<&LV> {
        self.lvs
            .values()
            .filter(|lv| {
                lv.segments.iter().any(|seg| match &seg.ty {
                    SegmentType::Snapshot { origin, .. } => origin == name,
                    _ => false,
                })
            })
            .collect()
    }

    /// Grow an LV by `extents`, honoring its allocation policy.
    pub fn lv_extend(&mut self, name: &str, extents: u64, pv_hints: &[String]) -> Result<()> {
        self.require_writable()?;
        self.require_complete()?;

        let (existing, current_extents, policy) = {
            let lv = self
                .lvs
                .get(name)
                .ok_or_else(|| Error::Metadata(MetadataError::NotFound(name.to_string())))?;
            let policy = lv
                .allocation_policy
                .as_deref()
                .and_then(|p| p.parse::<AllocPolicy>().ok());
            (lv::used_areas(lv), lv.used_extents(), policy)
        };

        let req = AllocRequest {
            extents,
            pv_hints,
            existing: &existing,
            ..Default::default()
        };
        let pieces = self.alloc_extents(&req, policy)?;
        let new_segments = Self::pieces_to_segments(current_extents, &pieces);

        let lv = self.lvs.get_mut(name).expect("checked above");
        lv.segments.extend(new_segments);
        Ok(())
    }

    /// Shrink an LV by `extents` from its tail.
    pub fn lv_reduce(&mut self, name: &str, extents: u64) -> Result<()> {
        self.require_writable()?;

        let lv = self
            .lvs
            .get_mut(name)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(name.to_string())))?;

        if extents >= lv.used_extents() {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "cannot reduce {} below one extent",
                name
            ))));
        }

        let mut to_remove = extents;
        while to_remove > 0 {
            let seg = lv.segments.last_mut().expect("extents remain");
            match seg.ty {
                SegmentType::Striped { ref stripes, .. } if stripes.len() == 1 => {}
                _ => {
                    return Err(Error::Metadata(MetadataError::Invalid(format!(
                        "{} tail segment is not linear",
                        name
                    ))))
                }
            }
            if seg.extent_count <= to_remove {
                to_remove -= seg.extent_count;
                lv.segments.pop();
            } else {
                seg.extent_count -= to_remove;
                to_remove = 0;
            }
        }
        Ok(())
    }

    /// Remove an LV and all LVs layered under it.
    pub fn lv_remove(&mut self, name: &str) -> Result<()> {
        self.require_writable()?;

        let lv = self
            .lvs
            .get(name)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(name.to_string())))?;

        if !self.snapshots_of(name).is_empty() {
            return Err(Error::Metadata(MetadataError::InUse(name.to_string())));
        }

        // a pool with live thin LVs cannot go away
        let users: Vec<String> = self
            .lvs
            .values()
            .filter(|other| {
                other.segments.iter().any(|seg| match &seg.ty {
                    SegmentType::Thin { pool, .. } => pool == name,
                    SegmentType::Cache { pool, .. } => pool == name,
                    SegmentType::Vdo { pool, .. } => pool == name,
                    _ => false,
                })
            })
            .map(|other| other.name.clone())
            .collect();
        if !users.is_empty() {
            return Err(Error::Metadata(MetadataError::InUse(name.to_string())));
        }

        // If a removed thin LV is still referenced as a snapshot origin
        // inside the pool, keep a tombstone.
        let mut tombstone = None;
        if let Some(seg) = lv.segments.first() {
            if let SegmentType::Thin { .. } = seg.ty {
                let descendants: Vec<String> = self
                    .lvs
                    .values()
                    .filter(|other| {
                        other.segments.iter().any(|s| match &s.ty {
                            SegmentType::Thin { origin, .. } => origin.as_deref() == Some(name),
                            _ => false,
                        })
                    })
                    .map(|other| other.name.clone())
                    .collect();
                if !descendants.is_empty() {
                    tombstone = Some(HistoricalLv {
                        name: name.to_string(),
                        id: lv.id.clone(),
                        removal_time: now_seconds(),
                        origin: lv.segments.first().and_then(|s| match &s.ty {
                            SegmentType::Thin { origin, .. } => origin.clone(),
                            _ => None,
                        }),
                        descendants,
                    });
                }
            }
        }

        let subs: Vec<String> = lv.sub_lv_names().iter().map(|s| s.to_string()).collect();
        self.lvs.remove(name);
        for sub in subs {
            // sub-LVs are referenced by exactly one parent, so removal
            // is not shared
            self.lvs.remove(&sub);
        }

        // Removing a cow store tears down its snapshot link LV too.
        let links: Vec<(String, String)> = self
            .lvs
            .values()
            .filter_map(|link| match link.segments.first().map(|s| &s.ty) {
                Some(SegmentType::Snapshot { origin, cow, .. }) if cow == name => {
                    Some((link.name.clone(), origin.clone()))
                }
                _ => None,
            })
            .collect();
        for (link_name, origin_name) in links {
            self.lvs.remove(&link_name);
            if self.snapshots_of(&origin_name).is_empty() {
                if let Some(origin) = self.lvs.get_mut(&origin_name) {
                    origin.clear_status(LV_STATUS_ORIGIN);
                }
            }
        }

        if let Some(h) = tombstone {
            self.historical_lvs.insert(h.name.clone(), h);
        }
        self.gc_historical();
        Ok(())
    }

    /// Rename an LV, preserving its UUID and fixing up every reference.
    pub fn lv_rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.require_writable()?;
        if self.lvs.contains_key(new) || self.historical_lvs.contains_key(new) {
            return Err(Error::Metadata(MetadataError::NameCollision(
                new.to_string(),
            )));
        }
        let mut lv = self
            .lvs
            .remove(old)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(old.to_string())))?;
        lv.name = new.to_string();
        self.lvs.insert(new.to_string(), lv);
        self.rename_lv_refs(old, new);
        Ok(())
    }

    /// Rewrite every by-name reference from `old` to `new`.
    pub fn rename_lv_refs(&mut self, old: &str, new: &str) {
        let fix = |s: &mut String| {
            if s == old {
                *s = new.to_string();
            }
        };
        let fix_opt = |s: &mut Option<String>| {
            if s.as_deref() == Some(old) {
                *s = Some(new.to_string());
            }
        };

        for lv in self.lvs.values_mut() {
            for seg in &mut lv.segments {
                match &mut seg.ty {
                    SegmentType::Striped { .. } => {}
                    SegmentType::Mirror { images, log, .. } => {
                        images.iter_mut().for_each(fix);
                        fix_opt(log);
                    }
                    SegmentType::Raid {
                        images, meta_areas, ..
                    } => {
                        images.iter_mut().for_each(fix);
                        meta_areas.iter_mut().for_each(fix);
                    }
                    SegmentType::Snapshot { origin, cow, .. } => {
                        fix(origin);
                        fix(cow);
                    }
                    SegmentType::ThinPool {
                        data,
                        metadata,
                        messages,
                        ..
                    } => {
                        fix(data);
                        fix(metadata);
                        for msg in messages {
                            match msg {
                                ThinMessage::Create(name) => fix(name),
                                ThinMessage::CreateSnap { name, origin } => {
                                    fix(name);
                                    fix(origin);
                                }
                                ThinMessage::Delete(_) => {}
                            }
                        }
                    }
                    SegmentType::Thin {
                        pool,
                        origin,
                        external_origin,
                        merge,
                        ..
                    } => {
                        fix(pool);
                        fix_opt(origin);
                        fix_opt(external_origin);
                        fix_opt(merge);
                    }
                    SegmentType::CachePool { data, metadata, .. } => {
                        fix(data);
                        fix(metadata);
                    }
                    SegmentType::Cache { pool, origin } => {
                        fix(pool);
                        fix(origin);
                    }
                    SegmentType::Writecache {
                        origin,
                        fast_device,
                        ..
                    } => {
                        fix(origin);
                        fix(fast_device);
                    }
                    SegmentType::Integrity {
                        origin, meta_dev, ..
                    } => {
                        fix(origin);
                        fix(meta_dev);
                    }
                    SegmentType::VdoPool { data, .. } => fix(data),
                    SegmentType::Vdo { pool, .. } => fix(pool),
                }
            }
        }

        for h in self.historical_lvs.values_mut() {
            fix_opt(&mut h.origin);
            h.descendants.iter_mut().for_each(fix);
        }
        fix_opt(&mut self.pool_metadata_spare);
        fix_opt(&mut self.sanlock_lv);
    }

    /// Drop tombstones whose last referent disappeared.
    pub fn gc_historical(&mut self) {
        let live: BTreeSet<String> = self.lvs.keys().cloned().collect();
        let historical: BTreeSet<String> = self.historical_lvs.keys().cloned().collect();
        self.historical_lvs.retain(|_, h| {
            h.descendants
                .iter()
                .any(|d| live.contains(d) || historical.contains(d))
        });
    }

    /// Check every structural invariant. Called after parsing and as
    /// the commit precondition.
    pub fn validate(&self) -> Result<()> {
        let broken = |msg: String| Err(Error::Metadata(MetadataError::Inconsistent(msg)));

        // LV uuids unique
        let mut uuids = BTreeSet::new();
        for lv in self.lvs.values() {
            if !uuids.insert(&lv.id) {
                return broken(format!("duplicate LV uuid {}", lv.id));
            }
        }

        // Each segment area points into an existing PV, within bounds,
        // and no extent is mapped twice.
        let mut per_pv: BTreeMap<&str, Vec<(u64, u64, &str)>> = BTreeMap::new();
        for lv in self.lvs.values() {
            for seg in &lv.segments {
                for (pv_id, start) in seg.ty.stripe_areas() {
                    let pv = match self.pvs.get(pv_id) {
                        Some(pv) => pv,
                        None => {
                            return broken(format!(
                                "LV {} references unknown PV {}",
                                lv.name, pv_id
                            ))
                        }
                    };
                    let len = match &seg.ty {
                        SegmentType::Striped { stripes, .. } => {
                            seg.extent_count / stripes.len() as u64
                        }
                        _ => seg.extent_count,
                    };
                    if start + len > pv.pe_count {
                        return broken(format!(
                            "LV {} maps beyond PV {} ({} + {} > {})",
                            lv.name, pv_id, start, len, pv.pe_count
                        ));
                    }
                    per_pv
                        .entry(pv_id.as_str())
                        .or_default()
                        .push((*start, len, lv.name.as_str()));
                }
            }
        }
        for (pv_id, mut areas) in per_pv {
            areas.sort();
            for pair in areas.windows(2) {
                let (a_start, a_len, a_lv) = pair[0];
                let (b_start, _, b_lv) = pair[1];
                if a_start + a_len > b_start {
                    return broken(format!(
                        "PV {} extent {} mapped by both {} and {}",
                        pv_id, b_start, a_lv, b_lv
                    ));
                }
            }
        }

        // Segment lists must tile the LV address space.
        for lv in self.lvs.values() {
            let mut segs: Vec<(u64, u64)> = lv
                .segments
                .iter()
                .map(|s| (s.start_extent, s.extent_count))
                .collect();
            segs.sort();
            let mut expected = 0;
            for (start, len) in segs {
                if start != expected {
                    return broken(format!(
                        "LV {} segment starts at {} instead of {}",
                        lv.name, start, expected
                    ));
                }
                expected = start + len;
            }
        }

        // Sub-LVs are hidden and referenced by exactly one parent.
        let mut sub_refs: BTreeMap<&str, u32> = BTreeMap::new();
        for lv in self.lvs.values() {
            for sub in lv.sub_lv_names() {
                *sub_refs.entry(sub).or_insert(0) += 1;
            }
        }
        for (sub, count) in &sub_refs {
            let sub_lv = match self.lvs.get(*sub) {
                Some(x) => x,
                None => return broken(format!("missing sub-LV {}", sub)),
            };
            if sub_lv.is_visible() {
                return broken(format!("sub-LV {} is visible", sub));
            }
            if *count != 1 {
                return broken(format!("sub-LV {} referenced {} times", sub, count));
            }
        }

        // Peer references resolve.
        for lv in self.lvs.values() {
            for seg in &lv.segments {
                let peers: Vec<&String> = match &seg.ty {
                    SegmentType::Snapshot { origin, cow, .. } => vec![origin, cow],
                    SegmentType::Thin { pool, origin, .. } => {
                        let mut v = vec![pool];
                        if let Some(origin) = origin {
                            v.push(origin);
                        }
                        v
                    }
                    _ => Vec::new(),
                };
                for peer in peers {
                    if !self.lvs.contains_key(peer) && !self.historical_lvs.contains_key(peer) {
                        return broken(format!(
                            "LV {} references unknown LV {}",
                            lv.name, peer
                        ));
                    }
                }
            }
        }

        // The pool metadata spare is hidden and as large as the largest
        // pool metadata LV.
        if let Some(ref spare_name) = self.pool_metadata_spare {
            let spare = match self.lvs.get(spare_name) {
                Some(x) => x,
                None => return broken(format!("missing spare {}", spare_name)),
            };
            if spare.is_visible() {
                return broken(format!("spare {} is visible", spare_name));
            }
            let largest_meta = self
                .lvs
                .values()
                .flat_map(|lv| lv.segments.iter())
                .filter_map(|seg| match &seg.ty {
                    SegmentType::ThinPool { metadata, .. }
                    | SegmentType::CachePool { metadata, .. } => {
                        self.lvs.get(metadata).map(|m| m.used_extents())
                    }
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            if spare.used_extents() < largest_meta {
                return broken(format!(
                    "spare {} smaller than largest pool metadata ({} < {})",
                    spare_name,
                    spare.used_extents(),
                    largest_meta
                ));
            }
        }

        // Thin message queues form valid transactions.
        for lv in self.lvs.values() {
            for seg in &lv.segments {
                if let SegmentType::ThinPool { messages, .. } = &seg.ty {
                    let mut creates = BTreeSet::new();
                    let mut deletes = BTreeSet::new();
                    let live_ids: BTreeSet<u64> = self
                        .lvs
                        .values()
                        .flat_map(|l| l.segments.iter())
                        .filter_map(|s| match &s.ty {
                            SegmentType::Thin {
                                pool, device_id, ..
                            } if pool == &lv.name => Some(*device_id),
                            _ => None,
                        })
                        .collect();
                    for msg in messages {
                        match msg {
                            ThinMessage::Create(name)
                            | ThinMessage::CreateSnap { name, .. } => {
                                if !creates.insert(name.clone()) {
                                    return broken(format!(
                                        "duplicate create message for {}",
                                        name
                                    ));
                                }
                                if !self.lvs.contains_key(name) {
                                    return broken(format!(
                                        "create message for unknown LV {}",
                                        name
                                    ));
                                }
                            }
                            ThinMessage::Delete(id) => {
                                if !deletes.insert(*id) {
                                    return broken(format!("duplicate delete of id {}", id));
                                }
                                if live_ids.contains(id) {
                                    return broken(format!(
                                        "delete message for live thin id {}",
                                        id
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// A working copy of a VG. Mutate the copy, then either `commit()` to
/// take the result or drop it to roll back.
#[derive(Debug)]
pub struct VgTransaction {
    work: VG,
}

impl VgTransaction {
    pub fn begin(vg: &VG) -> VgTransaction {
        VgTransaction { work: vg.clone() }
    }

    pub fn vg_mut(&mut self) -> &mut VG {
        &mut self.work
    }

    pub fn vg(&self) -> &VG {
        &self.work
    }

    /// Validate the mutated copy and hand it back. On invariant failure
    /// the copy is discarded and the caller keeps the original.
    pub fn commit(self) -> Result<VG> {
        self.work.validate()?;
        Ok(self.work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::PV_STATUS_ALLOCATABLE;

    pub fn test_pv(id: &str, device: &str, pe_count: u64) -> PV {
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

    pub fn test_vg() -> VG {
        let mut vg = VG::alloc_vg("vg0", DEFAULT_EXTENT_SIZE);
        vg.seqno = 7;
        vg.add_pv(test_pv("pva-uuid", "/dev/pva", 100)).unwrap();
        vg.add_pv(test_pv("pvb-uuid", "/dev/pvb", 100)).unwrap();
        vg
    }

    #[test]
    fn create_linear_lv_allocates_first_pv() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();

        let lv = &vg.lvs["lv0"];
        assert_eq!(lv.segments.len(), 1);
        assert_eq!(
            lv.segments[0].ty,
            SegmentType::Striped {
                stripes: vec![("pva-uuid".to_string(), 0)],
                stripe_size: None,
            }
        );
        assert_eq!(vg.pv_alloc_count("pva-uuid"), 50);
        assert_eq!(vg.pv_alloc_count("pvb-uuid"), 0);
        assert_eq!(vg.extents_free(), 150);
        vg.validate().unwrap();
    }

    #[test]
    fn vg_accounting_balances() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        vg.lv_create(&LvCreate::new("lv1", 75)).unwrap();
        assert_eq!(
            vg.extents_free()
                + vg.pvs.keys().map(|id| vg.pv_alloc_count(id)).sum::<u64>(),
            vg.extents()
        );
    }

    #[test]
    fn textmap_round_trip() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        vg.lv_create(&LvCreate::new("lv1", 30)).unwrap();

        let map = vg.to_textmap();
        let back = VG::from_textmap("vg0", &map).unwrap();
        // scanner-only fields are not serialized
        assert_eq!(back, vg);
    }

    #[test]
    fn extend_and_reduce() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        vg.lv_extend("lv0", 10, &[]).unwrap();
        assert_eq!(vg.lvs["lv0"].used_extents(), 60);
        vg.validate().unwrap();

        vg.lv_reduce("lv0", 20).unwrap();
        assert_eq!(vg.lvs["lv0"].used_extents(), 40);
        vg.validate().unwrap();
    }

    #[test]
    fn partial_vg_refuses_allocation() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        vg.pvs.get_mut("pvb-uuid").unwrap().set_missing(true);

        let before = vg.seqno;
        match vg.lv_extend("lv0", 10, &[]) {
            Err(ref e @ Error::Metadata(MetadataError::Partial(_))) => {
                assert_eq!(e.tag(), "ERR_PARTIAL");
            }
            other => panic!("expected ERR_PARTIAL, got {:?}", other),
        }
        assert_eq!(vg.seqno, before);
        assert_eq!(vg.lvs["lv0"].used_extents(), 50);
    }

    #[test]
    fn remove_pv_in_use_fails() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        match vg.remove_pv("pva-uuid") {
            Err(Error::Metadata(MetadataError::PvInUse(_))) => {}
            other => panic!("expected ERR_PV_IN_USE, got {:?}", other),
        }
        vg.remove_pv("pvb-uuid").unwrap();
        assert_eq!(vg.pvs.len(), 1);
    }

    #[test]
    fn snapshot_create_links_origin_and_cow() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();

        let mut spec = LvCreate::new("snap", 20);
        spec.cow_of = Some("lv0".to_string());
        spec.chunk_size = Some(8);
        vg.lv_create(&spec).unwrap();

        assert!(vg.lvs["lv0"].has_status(LV_STATUS_ORIGIN));
        let link = &vg.lvs["snapshot0"];
        assert!(!link.is_visible());
        match &link.segments[0].ty {
            SegmentType::Snapshot {
                origin,
                cow,
                chunk_size,
                merging,
            } => {
                assert_eq!(origin, "lv0");
                assert_eq!(cow, "snap");
                assert_eq!(*chunk_size, 8);
                assert!(!merging);
            }
            other => panic!("expected snapshot segment, got {:?}", other),
        }
        vg.validate().unwrap();

        // origin with a snapshot cannot be removed
        match vg.lv_remove("lv0") {
            Err(Error::Metadata(MetadataError::InUse(_))) => {}
            other => panic!("expected ERR_IN_USE, got {:?}", other),
        }
    }

    #[test]
    fn rename_rewrites_references() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        let mut spec = LvCreate::new("snap", 20);
        spec.cow_of = Some("lv0".to_string());
        vg.lv_create(&spec).unwrap();

        vg.lv_rename("lv0", "root").unwrap();
        match &vg.lvs["snapshot0"].segments[0].ty {
            SegmentType::Snapshot { origin, .. } => assert_eq!(origin, "root"),
            other => panic!("unexpected {:?}", other),
        }
        vg.validate().unwrap();
    }

    #[test]
    fn transaction_rolls_back_on_invariant_failure() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();

        let mut txn = VgTransaction::begin(&vg);
        // sabotage: map lv0 beyond the end of its PV
        if let SegmentType::Striped { ref mut stripes, .. } =
            txn.vg_mut().lvs.get_mut("lv0").unwrap().segments[0].ty
        {
            stripes[0].1 = 90;
        }
        assert!(txn.commit().is_err());
        // original untouched
        vg.validate().unwrap();
    }

    #[test]
    fn duplicate_extent_use_detected() {
        let mut vg = test_vg();
        vg.lv_create(&LvCreate::new("lv0", 50)).unwrap();
        let mut clash = vg.lvs["lv0"].clone();
        clash.name = "clash".to_string();
        clash.id = make_uuid();
        vg.lvs.insert("clash".to_string(), clash);
        assert!(vg.validate().is_err());
    }

    #[test]
    fn historical_tombstones_are_collected() {
        let mut vg = test_vg();
        vg.historical_lvs.insert(
            "ghost".to_string(),
            HistoricalLv {
                name: "ghost".to_string(),
                id: make_uuid(),
                removal_time: 1,
                origin: None,
                descendants: vec!["nobody".to_string()],
            },
        );
        vg.gc_historical();
        assert!(vg.historical_lvs.is_empty());
    }
}
