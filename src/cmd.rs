// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed command entry points, one per logical operation. A command
//! composes scan → read → lock → mutate → validate → write → unlock;
//! the surrounding tool binds them to argv.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::allocation::{AllocPolicy, AllocRequest};
use crate::config::RuntimeConfig;
use crate::convert::{self, LvConvert};
use crate::devctl::{DeviceController, NoopController};
use crate::flock::{Flock, LockScope};
use crate::lockd::client::LockdClient;
use crate::lockd::lm::LmType;
use crate::lockd::LockMode;
use crate::lv::SegmentType;
use crate::metadata::{pv_from_header, read_vg, write_vg, VgHandle};
use crate::pvlabel::{PvHeader, PV_EXT_USED};
use crate::scan::{rescan, scan, ScanFilter, ScanTable};
use crate::util::hostname;
use crate::vg::{LvCreate, VG, VG_STATUS_CLUSTERED, VG_STATUS_EXPORTED, VG_STATUS_SHARED};
use crate::{Error, MetadataError, Result};

pub struct CommandContext {
    pub config: RuntimeConfig,
    pub filter: ScanFilter,
    pub devctl: Box<dyn DeviceController>,
}

/// Either a daemon lock or a local flock, released on drop.
enum VgLock {
    Lockd { client: LockdClient, vg_name: String },
    Local(#[allow(dead_code)] Flock),
}

impl VgLock {
    fn release(self) {
        if let VgLock::Lockd {
            mut client,
            vg_name,
        } = self
        {
            let _ = client.lock_vg(&vg_name, LockMode::Un, 0);
            client.quit();
        }
    }

    /// Tell the lock daemon about a committed seqno so other hosts
    /// invalidate their caches.
    fn note_seqno(&mut self, seqno: u64) {
        if let VgLock::Lockd { client, vg_name } = self {
            if let Err(e) = client.update_vg(vg_name, seqno as u32) {
                warn!("update_vg failed: {}", e);
            }
        }
    }
}

impl CommandContext {
    pub fn new(config: RuntimeConfig) -> CommandContext {
        CommandContext {
            config,
            filter: ScanFilter::default(),
            devctl: Box::new(NoopController),
        }
    }

    /// Scan for labeled devices.
    pub fn scan(&self) -> Result<ScanTable> {
        scan(&self.config, &self.filter)
    }

    fn local_system_id(&self) -> String {
        hostname()
    }

    fn access_for_write(&self, vg: &VG, force_takeover: bool) -> Result<()> {
        if vg.is_exported() {
            return Err(Error::Metadata(MetadataError::Exported(vg.name.clone())));
        }
        if vg.is_clustered() && !force_takeover {
            return Err(Error::Metadata(MetadataError::Clustered(vg.name.clone())));
        }
        if let Some(ref system_id) = vg.system_id {
            if !system_id.is_empty() && *system_id != self.local_system_id() {
                return Err(Error::Metadata(MetadataError::Foreign {
                    vg: vg.name.clone(),
                    system_id: system_id.clone(),
                }));
            }
        }
        Ok(())
    }

    fn lock_vg(&self, vg: &VG, mode: LockMode) -> Result<VgLock> {
        if vg.is_shared() {
            let mut client = LockdClient::connect(&self.config)?;
            client.lock_vg(&vg.name, mode, 0)?;
            Ok(VgLock::Lockd {
                client,
                vg_name: vg.name.clone(),
            })
        } else {
            let scope = LockScope::Vg(vg.name.clone());
            let flock = match mode {
                LockMode::Ex => Flock::lock_exclusive(&self.config, scope)?,
                _ => Flock::lock_shared(&self.config, scope)?,
            };
            Ok(VgLock::Local(flock))
        }
    }

    /// Read a VG and take its lock for update. The scan table is
    /// refreshed under the lock because the unlocked scan may be stale.
    fn open_vg_for_update(&self, table: &mut ScanTable, name: &str) -> Result<(VgHandle, VgLock)> {
        let handle = read_vg(table, name)?;
        self.access_for_write(&handle.vg, false)?;
        let lock = self.lock_vg(&handle.vg, LockMode::Ex)?;
        rescan(table, name)?;
        let handle = read_vg(table, name)?;
        Ok((handle, lock))
    }

    fn commit(&self, handle: &mut VgHandle, work: VG, lock: &mut VgLock) -> Result<u64> {
        let seqno = write_vg(handle, work, self.devctl.as_ref())?;
        lock.note_seqno(seqno);
        Ok(seqno)
    }

    // ---- pv commands ----

    /// Initialize a device as a PV.
    pub fn pv_create(&self, path: &Path) -> Result<String> {
        if PvHeader::find_in_dev(path).is_ok() {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "{} is already a PV",
                path.display()
            ))));
        }
        let pvh = PvHeader::initialize(path)?;
        info!("initialized PV {} on {}", pvh.uuid, path.display());
        Ok(pvh.uuid)
    }

    /// Wipe the label from an orphan PV.
    pub fn pv_remove(&self, path: &Path) -> Result<()> {
        let table = self.scan()?;
        let dev = table
            .values()
            .find(|d| d.dev_path == path)
            .ok_or_else(|| Error::Metadata(MetadataError::NotFound(path.display().to_string())))?;
        if let Some(ref vg_name) = dev.vg_name {
            return Err(Error::Metadata(MetadataError::InUse(format!(
                "{} belongs to VG {}",
                path.display(),
                vg_name
            ))));
        }

        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().write(true).open(path)?;
        let zeros = [0u8; crate::pvlabel::SECTOR_SIZE * crate::pvlabel::LABEL_SCAN_SECTORS];
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&zeros)?;
        f.sync_all()?;
        Ok(())
    }

    /// Refresh a PV's extent count after the underlying device grew.
    pub fn pv_resize(&self, vg_name: &str, pv_device: &str) -> Result<u64> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            let extent_size = work.extent_size;
            let pv = work
                .pvs
                .values_mut()
                .find(|pv| pv.device == pv_device)
                .ok_or_else(|| {
                    Error::Metadata(MetadataError::NotFound(pv_device.to_string()))
                })?;
            let path = pv
                .dev_path
                .clone()
                .ok_or_else(|| Error::Metadata(MetadataError::Partial(vg_name.to_string())))?;
            let pvh = PvHeader::find_in_dev(&path)?;
            let fresh = pv_from_header(&pvh, extent_size);
            if fresh.pe_count < pv.pe_count {
                // shrinking below allocated extents is checked by the
                // invariant pass at commit
                warn!("{} shrank from {} to {} extents", pv_device, pv.pe_count, fresh.pe_count);
            }
            pv.pe_count = fresh.pe_count;
            pv.dev_size = fresh.dev_size;
            let count = pv.pe_count;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(count)
        })();
        lock.release();
        result
    }

    /// Move allocated extents off one PV onto others.
    pub fn pv_move(&self, vg_name: &str, from_device: &str, to_device: Option<&str>) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            let from_id = work
                .pvs
                .values()
                .find(|pv| pv.device == from_device)
                .map(|pv| pv.id.clone())
                .ok_or_else(|| {
                    Error::Metadata(MetadataError::NotFound(from_device.to_string()))
                })?;
            let hints: Vec<String> = match to_device {
                Some(dev) => vec![work
                    .pvs
                    .values()
                    .find(|pv| pv.device == dev)
                    .map(|pv| pv.id.clone())
                    .ok_or_else(|| Error::Metadata(MetadataError::NotFound(dev.to_string())))?],
                None => Vec::new(),
            };
            let avoid = [from_id.clone()];

            // replace every area on the source PV with a fresh run of
            // the same length elsewhere; the data copy itself is the
            // device controller's job
            let mut free = work.free_areas();
            let lv_names: Vec<String> = work.lvs.keys().cloned().collect();
            for lv_name in lv_names {
                let lv = work.lvs.get_mut(&lv_name).expect("listed above");
                for seg in &mut lv.segments {
                    let seg_extents = seg.extent_count;
                    if let SegmentType::Striped { stripes, .. } = &mut seg.ty {
                        let per_leg = seg_extents / stripes.len() as u64;
                        for stripe in stripes.iter_mut() {
                            if stripe.0 != from_id {
                                continue;
                            }
                            let req = AllocRequest {
                                extents: per_leg,
                                pv_hints: &hints,
                                avoid: &avoid,
                                ..Default::default()
                            };
                            let pieces =
                                crate::allocation::allocate(&free, AllocPolicy::Contiguous, &req)?;
                            let (pv, start, len) = pieces.into_iter().next().expect("single run");
                            // carve the chosen run out so parallel areas
                            // cannot land on it again
                            if let Some(runs) = free.get_mut(&pv) {
                                if let Some(run_len) = runs.remove(&start) {
                                    if run_len > len {
                                        runs.insert(start + len, run_len - len);
                                    }
                                }
                            }
                            *stripe = (pv, start);
                        }
                    }
                }
            }

            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    // ---- vg commands ----

    /// Create a VG from initialized PVs.
    pub fn vg_create(
        &self,
        name: &str,
        pv_paths: &[PathBuf],
        extent_size: u64,
        lock_type: Option<LmType>,
    ) -> Result<()> {
        if pv_paths.is_empty() {
            return Err(Error::Metadata(MetadataError::Invalid(
                "one or more PV paths required".into(),
            )));
        }
        let table = self.scan()?;
        if table
            .values()
            .any(|dev| dev.vg_name.as_deref() == Some(name))
        {
            return Err(Error::Metadata(MetadataError::NameCollision(
                name.to_string(),
            )));
        }

        let _gl = Flock::lock_exclusive(&self.config, LockScope::Global)?;

        let mut vg = VG::alloc_vg(name, extent_size);
        vg.system_id = Some(self.local_system_id());

        let mut headers = std::collections::BTreeMap::new();
        for path in pv_paths {
            let mut pvh = PvHeader::find_in_dev(path)?;
            if pvh.ext_flags & PV_EXT_USED != 0 {
                return Err(Error::Metadata(MetadataError::InUse(
                    path.display().to_string(),
                )));
            }
            pvh.set_used(true)?;
            let pv = pv_from_header(&pvh, vg.extent_size);
            headers.insert(pv.id.clone(), pvh);
            vg.add_pv(pv)?;
        }
        if vg.pvs.values().all(|pv| pv.mdas.is_empty()) {
            return Err(Error::Metadata(MetadataError::Invalid(
                "PVs must have at least one metadata area".into(),
            )));
        }

        if let Some(lm_type) = lock_type {
            if lm_type != LmType::None {
                let mut client = LockdClient::connect(&self.config)?;
                let vg_args = client.init_vg(name, &vg.id, lm_type, true)?;
                vg.lock_type = Some(lm_type.as_str().to_string());
                vg.lock_args = Some(vg_args);
                vg.status.push(VG_STATUS_SHARED.to_string());
                client.quit();
            }
        }

        // the committed copy of a brand-new VG is the empty state, so
        // the first write is a real change and lands at seqno 1
        let mut handle = VgHandle {
            committed: VG::alloc_vg(name, vg.extent_size),
            vg: vg.clone(),
            headers,
        };
        write_vg(&mut handle, vg, self.devctl.as_ref())?;
        info!("created VG {}", name);
        Ok(())
    }

    /// Remove an empty VG, wiping its MDAs.
    pub fn vg_remove(&self, name: &str) -> Result<()> {
        let mut table = self.scan()?;
        let (handle, lock) = self.open_vg_for_update(&mut table, name)?;

        let result = (|| {
            if handle.vg.lvs.values().any(|lv| lv.is_visible()) {
                return Err(Error::Metadata(MetadataError::InUse(name.to_string())));
            }
            for (uuid, pvh) in &handle.headers {
                let mut pvh = pvh.clone();
                for i in 0..pvh.metadata_areas.len() {
                    let area = pvh.metadata_areas[i];
                    let mut f = std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&pvh.dev_path)?;
                    PvHeader::write_mda_header(&area, &mut f, &Default::default())?;
                }
                pvh.set_used(false)?;
                let _ = uuid;
            }
            if let Some(ref args) = handle.vg.lock_args {
                let mut client = LockdClient::connect(&self.config)?;
                let _ = client.stop_vg(name);
                let _ = client.free_vg(name, args);
                client.quit();
            }
            info!("removed VG {}", name);
            Ok(())
        })();
        lock.release();
        result
    }

    pub fn vg_rename(&self, old: &str, new: &str) -> Result<()> {
        let mut table = self.scan()?;
        if table
            .values()
            .any(|dev| dev.vg_name.as_deref() == Some(new))
        {
            return Err(Error::Metadata(MetadataError::NameCollision(
                new.to_string(),
            )));
        }
        // commands touching the VG namespace take the global lock first
        let _gl = Flock::lock_exclusive(&self.config, LockScope::Global)?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, old)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            work.name = new.to_string();
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    pub fn vg_extend(&self, name: &str, pv_path: &Path) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, name)?;

        let result = (|| {
            let mut pvh = PvHeader::find_in_dev(pv_path)?;
            if pvh.ext_flags & PV_EXT_USED != 0 {
                return Err(Error::Metadata(MetadataError::InUse(
                    pv_path.display().to_string(),
                )));
            }
            pvh.set_used(true)?;
            let mut work = handle.vg.clone();
            let pv = pv_from_header(&pvh, work.extent_size);
            handle.headers.insert(pv.id.clone(), pvh);
            work.add_pv(pv)?;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Remove a PV from a VG, or with `remove_missing` drop every
    /// missing PV that has no allocated extents.
    pub fn vg_reduce(&self, name: &str, pv_device: Option<&str>, remove_missing: bool) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            match (pv_device, remove_missing) {
                (Some(dev), _) => {
                    let id = work
                        .pvs
                        .values()
                        .find(|pv| pv.device == dev)
                        .map(|pv| pv.id.clone())
                        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(dev.to_string())))?;
                    work.remove_pv(&id)?;
                }
                (None, true) => {
                    let used = work.used_areas();
                    let missing: Vec<String> = work
                        .pvs
                        .values()
                        .filter(|pv| pv.is_missing() && !used.contains_key(&pv.id))
                        .map(|pv| pv.id.clone())
                        .collect();
                    if missing.is_empty() {
                        return Err(Error::Metadata(MetadataError::NotFound(
                            "no removable missing PVs".into(),
                        )));
                    }
                    for id in missing {
                        work.remove_pv(&id)?;
                    }
                }
                (None, false) => {
                    return Err(Error::Metadata(MetadataError::Invalid(
                        "vg_reduce needs a PV or --removemissing".into(),
                    )))
                }
            }
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Restore a previously missing PV whose device reappeared.
    pub fn vg_extend_restore_missing(&self, name: &str, pv_device: &str) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            let pv = work
                .pvs
                .values_mut()
                .find(|pv| pv.device == pv_device)
                .ok_or_else(|| Error::Metadata(MetadataError::NotFound(pv_device.to_string())))?;
            if !pv.is_missing() {
                return Err(Error::Metadata(MetadataError::Invalid(format!(
                    "{} is not missing",
                    pv_device
                ))));
            }
            if pv.dev_path.is_none() {
                return Err(Error::Metadata(MetadataError::NotFound(
                    pv_device.to_string(),
                )));
            }
            pv.set_missing(false);
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Parameter changes: system_id, mda copies, lock type, legacy
    /// clustered takeover.
    pub fn vg_change(&self, name: &str, change: &VgChange) -> Result<()> {
        let mut table = self.scan()?;
        let handle_peek = read_vg(&table, name)?;
        self.access_for_write(&handle_peek.vg, change.force_takeover)?;
        let lock = self.lock_vg(&handle_peek.vg, LockMode::Ex)?;
        rescan(&mut table, name)?;
        let mut handle = read_vg(&table, name)?;
        let mut lock = lock;

        let result = (|| {
            let mut work = handle.vg.clone();
            if work.is_clustered() {
                if !change.force_takeover {
                    return Err(Error::Metadata(MetadataError::Clustered(name.to_string())));
                }
                // rewrite the legacy flag as shared or host-owned
                work.status.retain(|s| s != VG_STATUS_CLUSTERED);
                if change.lock_type.is_none() {
                    work.lock_type = None;
                    work.lock_args = None;
                }
            }
            if let Some(ref system_id) = change.system_id {
                work.system_id = Some(system_id.clone());
            }
            if let Some(copies) = change.metadata_copies {
                work.metadata_copies = copies;
            }
            if let Some(lm_type) = change.lock_type {
                match lm_type {
                    LmType::None => {
                        if let Some(ref args) = work.lock_args.clone() {
                            let mut client = LockdClient::connect(&self.config)?;
                            let _ = client.free_vg(name, args);
                            client.quit();
                        }
                        work.lock_type = None;
                        work.lock_args = None;
                        work.status.retain(|s| s != VG_STATUS_SHARED);
                    }
                    t => {
                        let mut client = LockdClient::connect(&self.config)?;
                        let vg_args = client.init_vg(name, &work.id, t, true)?;
                        client.quit();
                        work.lock_type = Some(t.as_str().to_string());
                        work.lock_args = Some(vg_args);
                        if !work.status.iter().any(|s| s == VG_STATUS_SHARED) {
                            work.status.push(VG_STATUS_SHARED.to_string());
                        }
                    }
                }
            }
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Move whole PVs (and the LVs fully contained on them) to a new VG.
    pub fn vg_split(&self, name: &str, new_name: &str, pv_devices: &[String]) -> Result<()> {
        let mut table = self.scan()?;
        if table
            .values()
            .any(|dev| dev.vg_name.as_deref() == Some(new_name))
        {
            return Err(Error::Metadata(MetadataError::NameCollision(
                new_name.to_string(),
            )));
        }
        let _gl = Flock::lock_exclusive(&self.config, LockScope::Global)?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            let move_ids: Vec<String> = pv_devices
                .iter()
                .map(|dev| {
                    work.pvs
                        .values()
                        .find(|pv| pv.device == *dev)
                        .map(|pv| pv.id.clone())
                        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(dev.clone())))
                })
                .collect::<Result<_>>()?;

            let mut new_vg = VG::alloc_vg(new_name, work.extent_size);
            new_vg.system_id = work.system_id.clone();

            // an LV moves iff every area it maps sits on a moved PV
            let mut moved_lvs = Vec::new();
            for (lv_name, lv) in &work.lvs {
                let areas = crate::lv::used_areas(lv);
                if areas.is_empty() {
                    continue;
                }
                let all_moved = areas.iter().all(|(pv, _, _)| move_ids.contains(pv));
                let any_moved = areas.iter().any(|(pv, _, _)| move_ids.contains(pv));
                if all_moved {
                    moved_lvs.push(lv_name.clone());
                } else if any_moved {
                    return Err(Error::Metadata(MetadataError::InUse(format!(
                        "LV {} straddles the split",
                        lv_name
                    ))));
                }
            }

            for id in &move_ids {
                if let Some(pv) = work.pvs.remove(id) {
                    new_vg.pvs.insert(id.clone(), pv);
                }
            }
            for lv_name in &moved_lvs {
                if let Some(lv) = work.lvs.remove(lv_name) {
                    new_vg.lvs.insert(lv_name.clone(), lv);
                }
            }
            work.validate()?;
            new_vg.validate()?;

            // the source VG first, then the new one on the moved PVs
            let mut new_headers = std::collections::BTreeMap::new();
            for id in &move_ids {
                if let Some(pvh) = handle.headers.remove(id) {
                    new_headers.insert(id.clone(), pvh);
                }
            }
            self.commit(&mut handle, work, &mut lock)?;

            let mut new_handle = VgHandle {
                committed: VG::alloc_vg(new_name, new_vg.extent_size),
                vg: new_vg.clone(),
                headers: new_headers,
            };
            write_vg(&mut new_handle, new_vg, self.devctl.as_ref())?;
            info!("split VG {} from {}", new_name, name);
            Ok(())
        })();
        lock.release();
        result
    }

    /// Fold `src`'s PVs and LVs into `dst`; `src` disappears.
    pub fn vg_merge(&self, dst: &str, src: &str) -> Result<()> {
        let mut table = self.scan()?;
        let _gl = Flock::lock_exclusive(&self.config, LockScope::Global)?;

        // lock both VGs in name order to avoid deadlock with the
        // opposite merge direction
        let mut names = [dst, src];
        names.sort();
        let first_handle = read_vg(&table, names[0])?;
        let lock_a = self.lock_vg(&first_handle.vg, LockMode::Ex)?;
        let second_handle = read_vg(&table, names[1])?;
        let lock_b = self.lock_vg(&second_handle.vg, LockMode::Ex)?;
        // the seqno notification goes to the surviving VG's lockspace
        let (dst_lock, src_lock) = if names[0] == dst {
            (lock_a, lock_b)
        } else {
            (lock_b, lock_a)
        };

        rescan(&mut table, dst)?;
        rescan(&mut table, src)?;
        let mut dst_handle = read_vg(&table, dst)?;
        let src_handle = read_vg(&table, src)?;
        self.access_for_write(&dst_handle.vg, false)?;
        self.access_for_write(&src_handle.vg, false)?;

        let mut lock_for_note = dst_lock;
        let result = (|| {
            if src_handle.vg.extent_size != dst_handle.vg.extent_size {
                return Err(Error::Metadata(MetadataError::Invalid(format!(
                    "extent sizes differ ({} vs {})",
                    src_handle.vg.extent_size, dst_handle.vg.extent_size
                ))));
            }
            let mut work = dst_handle.vg.clone();
            for (id, pv) in &src_handle.vg.pvs {
                if work.pvs.contains_key(id) {
                    return Err(Error::Metadata(MetadataError::NameCollision(id.clone())));
                }
                work.pvs.insert(id.clone(), pv.clone());
            }
            for (name, lv) in &src_handle.vg.lvs {
                if work.lvs.contains_key(name) {
                    return Err(Error::Metadata(MetadataError::NameCollision(name.clone())));
                }
                work.lvs.insert(name.clone(), lv.clone());
            }
            work.validate()?;

            for (id, pvh) in &src_handle.headers {
                dst_handle.headers.insert(id.clone(), pvh.clone());
            }
            self.commit(&mut dst_handle, work, &mut lock_for_note)?;
            info!("merged VG {} into {}", src, dst);
            Ok(())
        })();
        lock_for_note.release();
        src_lock.release();
        result
    }

    pub fn vg_export(&self, name: &str) -> Result<()> {
        self.toggle_export(name, true)
    }

    pub fn vg_import(&self, name: &str) -> Result<()> {
        self.toggle_export(name, false)
    }

    fn toggle_export(&self, name: &str, export: bool) -> Result<()> {
        let mut table = self.scan()?;
        let handle_peek = read_vg(&table, name)?;
        if export {
            self.access_for_write(&handle_peek.vg, false)?;
        } else if !handle_peek.vg.is_exported() {
            return Err(Error::Metadata(MetadataError::Invalid(format!(
                "VG {} is not exported",
                name
            ))));
        }
        let mut lock = self.lock_vg(&handle_peek.vg, LockMode::Ex)?;
        rescan(&mut table, name)?;
        let mut handle = read_vg(&table, name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            work.status.retain(|s| s != VG_STATUS_EXPORTED);
            if export {
                if work.lvs.values().any(|lv| lv.is_visible()) {
                    // exporting with active LVs is the caller's risk;
                    // deactivation is the device controller's concern
                    for lv in work.lvs.values() {
                        if lv.is_visible() {
                            self.devctl.deactivate(&work, &lv.name)?;
                        }
                    }
                }
                work.status.push(VG_STATUS_EXPORTED.to_string());
                work.system_id = None;
            } else {
                work.system_id = Some(self.local_system_id());
            }
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    // ---- lv commands ----

    pub fn lv_create(&self, vg_name: &str, spec: &LvCreate) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            work.lv_create(spec)?;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    pub fn lv_remove(&self, vg_name: &str, lv_name: &str) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            self.devctl.deactivate(&handle.vg, lv_name)?;
            let mut work = handle.vg.clone();
            work.lv_remove(lv_name)?;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    pub fn lv_rename(&self, vg_name: &str, old: &str, new: &str) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            work.lv_rename(old, new)?;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Positive `extents` grows the LV, negative shrinks it.
    pub fn lv_resize(&self, vg_name: &str, lv_name: &str, extents: i64) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            if extents >= 0 {
                work.lv_extend(lv_name, extents as u64, &[])?;
            } else {
                work.lv_reduce(lv_name, (-extents) as u64)?;
            }
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    pub fn lv_convert(&self, vg_name: &str, lv_name: &str, conv: &LvConvert) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            convert::lv_convert(&mut work, lv_name, conv)?;
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }

    /// Activation state and tag changes.
    pub fn lv_change(&self, vg_name: &str, lv_name: &str, change: &LvChange) -> Result<()> {
        let mut table = self.scan()?;
        let (mut handle, mut lock) = self.open_vg_for_update(&mut table, vg_name)?;

        let result = (|| {
            let mut work = handle.vg.clone();
            {
                let lv = work
                    .lvs
                    .get_mut(lv_name)
                    .ok_or_else(|| Error::Metadata(MetadataError::NotFound(lv_name.to_string())))?;
                for tag in &change.add_tags {
                    if !lv.tags.contains(tag) {
                        lv.tags.push(tag.clone());
                    }
                }
                lv.tags.retain(|t| !change.del_tags.contains(t));
                if let Some(ref policy) = change.allocation_policy {
                    lv.allocation_policy = Some(policy.clone());
                }
            }

            match change.activate {
                Some(true) => {
                    let lv = &work.lvs[lv_name];
                    self.devctl.activate(&work, lv)?;
                }
                Some(false) => self.devctl.deactivate(&work, lv_name)?,
                None => {}
            }

            if work == handle.vg {
                return Ok(());
            }
            self.commit(&mut handle, work, &mut lock)?;
            Ok(())
        })();
        lock.release();
        result
    }
}

#[derive(Debug, Default, Clone)]
pub struct VgChange {
    pub system_id: Option<String>,
    pub metadata_copies: Option<u64>,
    pub lock_type: Option<LmType>,
    pub force_takeover: bool,
}

#[derive(Debug, Default, Clone)]
pub struct LvChange {
    pub activate: Option<bool>,
    pub add_tags: Vec<String>,
    pub del_tags: Vec<String>,
    pub allocation_policy: Option<String>,
}

/// Map a command result onto the tool's exit codes. Exit 3 is reserved
/// for argv syntax errors and is produced by the argv parser itself;
/// semantic validation failures count as a failed operation.
pub fn exit_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(Error::Metadata(MetadataError::NotFound(_))) => 4,
        Err(_) => 5,
    }
}
