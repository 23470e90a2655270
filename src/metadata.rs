// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The metadata store: translating between on-disk text and the VG
//! object, selecting the authoritative replica, and performing atomic
//! multi-replica updates.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::devctl::DeviceController;
use crate::parser::{buf_to_textmap, textmap_to_buf, Entry, LvmTextMap, TextMapOps};
use crate::pv::{PvMda, PV};
use crate::pvlabel::{PvHeader, SECTOR_SIZE};
use crate::scan::{DeviceState, ScanTable};
use crate::util::{align_to, hostname, now_seconds};
use crate::vg::{VG, VG_STATUS_PARTIAL};
use crate::{Error, MetadataError, Result};

/// A VG read from disk, ready to be mutated and written back.
#[derive(Debug)]
pub struct VgHandle {
    /// The working object handed to mutators.
    pub vg: VG,
    /// Deep clone taken at read time; a failed write reverts to it.
    pub committed: VG,
    /// PV headers of the devices present at read time, keyed by pv uuid.
    pub headers: BTreeMap<String, PvHeader>,
}

/// Derive a VG-member PV from an initialized device header.
pub fn pv_from_header(pvh: &PvHeader, extent_size: u64) -> PV {
    let dev_size_sectors = pvh.size / SECTOR_SIZE as u64;
    let pe_start_sectors = pvh
        .data_areas
        .first()
        .map(|da| align_to((da.offset / SECTOR_SIZE as u64) as usize, extent_size as usize) as u64)
        .unwrap_or(extent_size);
    let mda1_size_sectors = match pvh.metadata_areas.get(1) {
        Some(area) => area.size / SECTOR_SIZE as u64,
        None => 0,
    };
    let area_size_sectors = dev_size_sectors - pe_start_sectors - mda1_size_sectors;

    PV {
        id: pvh.uuid.clone(),
        device: pvh.dev_path.to_string_lossy().into_owned(),
        status: vec![crate::pv::PV_STATUS_ALLOCATABLE.to_string()],
        flags: Vec::new(),
        tags: Vec::new(),
        dev_size: dev_size_sectors,
        pe_start: pe_start_sectors,
        pe_count: area_size_sectors / extent_size,
        dev_path: Some(pvh.dev_path.clone()),
        mdas: pvh
            .metadata_areas
            .iter()
            .map(|area| PvMda {
                area: *area,
                ignored: false,
            })
            .collect(),
    }
}

// The on-disk text wraps the VG section in a small banner map.
fn wrap_vg_text(vg: &VG) -> Vec<u8> {
    let mut disk_map = LvmTextMap::new();
    disk_map.insert(
        "contents".to_string(),
        Entry::String("Malvin Text Format Volume Group".to_string()),
    );
    disk_map.insert("version".to_string(), Entry::Number(1));
    disk_map.insert("description".to_string(), Entry::String("".to_string()));
    disk_map.insert("creation_host".to_string(), Entry::String(hostname()));
    disk_map.insert("creation_time".to_string(), Entry::Number(now_seconds()));
    disk_map.insert(vg.name.clone(), Entry::TextMap(Box::new(vg.to_textmap())));

    let mut text = textmap_to_buf(&disk_map);
    // Ends with one null
    text.push(b'\0');
    text
}

fn unwrap_vg_text(text: &[u8]) -> Result<(String, LvmTextMap)> {
    let map = buf_to_textmap(text)?;
    for (key, value) in map {
        if let Entry::TextMap(vg_map) = value {
            return Ok((key, *vg_map));
        }
    }
    Err(Error::Parse("no VG section in metadata text".into()))
}

struct Replica {
    pv_uuid: String,
    mda_index: usize,
    seqno: u64,
    text: Vec<u8>,
}

/// Read a VG from every replica found by the scanner, keeping the copy
/// with the highest seqno.
pub fn read_vg(table: &ScanTable, target: &str) -> Result<VgHandle> {
    let mut headers = BTreeMap::new();
    let mut replicas: Vec<Replica> = Vec::new();

    for dev in table.values() {
        let claims = dev.vg_name.as_deref() == Some(target) || dev.vg_id.as_deref() == Some(target);
        if !claims {
            continue;
        }
        if let DeviceState::IoError(ref e) = dev.state {
            warn!("device {} unreadable: {}", dev.device_id, e);
            continue;
        }

        let pvh = match PvHeader::find_in_dev(&dev.dev_path) {
            Ok(x) => x,
            Err(e) => {
                warn!("label vanished from {}: {}", dev.device_id, e);
                continue;
            }
        };

        for (i, mda) in dev.mdas.iter().enumerate() {
            if mda.ignored {
                continue;
            }
            // re-verify the text CRC against the MDA header
            let text = match pvh.read_metadata_area(i) {
                Ok(t) => t,
                Err(e) => {
                    warn!("bad metadata in {} mda{}: {}", dev.device_id, i, e);
                    continue;
                }
            };
            let seqno = match unwrap_vg_text(&text) {
                Ok((_, vg_map)) => vg_map.u64_from_textmap("seqno").unwrap_or(0),
                Err(e) => {
                    warn!("unparsable metadata in {} mda{}: {}", dev.device_id, i, e);
                    continue;
                }
            };
            replicas.push(Replica {
                pv_uuid: pvh.uuid.clone(),
                mda_index: i,
                seqno,
                text,
            });
        }

        headers.insert(pvh.uuid.clone(), pvh);
    }

    let best = replicas
        .iter()
        .max_by_key(|r| r.seqno)
        .ok_or_else(|| Error::Metadata(MetadataError::NotFound(target.to_string())))?;

    for other in &replicas {
        if other.seqno == best.seqno && other.text != best.text {
            warn!(
                "replicas at seqno {} differ ({}:{} vs {}:{})",
                best.seqno, best.pv_uuid, best.mda_index, other.pv_uuid, other.mda_index
            );
        } else if other.seqno < best.seqno {
            debug!(
                "stale replica seqno {} on {} mda{}, will repair on next write",
                other.seqno, other.pv_uuid, other.mda_index
            );
        }
    }

    let (name, vg_map) = unwrap_vg_text(&best.text)?;
    let mut vg = VG::from_textmap(&name, &vg_map)?;

    // Cross-reference the text against the scanner table: every listed
    // PV must have a device, else it is kept but marked MISSING.
    let by_uuid: BTreeMap<&str, &crate::scan::ScannedDevice> =
        table.values().map(|d| (d.pv_uuid.as_str(), d)).collect();
    for pv in vg.pvs.values_mut() {
        match by_uuid.get(pv.id.as_str()) {
            Some(dev) if dev.state == DeviceState::Ok => {
                pv.dev_path = Some(dev.dev_path.clone());
                pv.mdas = dev
                    .mdas
                    .iter()
                    .map(|m| PvMda {
                        area: m.area,
                        ignored: m.ignored,
                    })
                    .collect();
                // a PV recorded missing stays missing until explicitly
                // restored, even if its device reappeared
            }
            _ => {
                warn!("vg {}: pv {} has no device, marking missing", vg.name, pv.id);
                pv.set_missing(true);
            }
        }
    }

    vg.validate()?;

    Ok(VgHandle {
        committed: vg.clone(),
        vg,
        headers,
    })
}

// Which (pv uuid, mda index, ignored) tuples the next write touches, in
// primary order: lowest PV uuid first.
fn write_plan(vg: &VG) -> Vec<(String, usize, bool)> {
    let mut plan = Vec::new();
    let target_copies = vg.metadata_copies;
    let mut active = 0u64;

    for (uuid, pv) in &vg.pvs {
        if pv.is_missing() || pv.dev_path.is_none() {
            continue;
        }
        for (i, _mda) in pv.mdas.iter().enumerate() {
            let ignored = target_copies > 0 && active >= target_copies;
            if !ignored {
                active += 1;
            }
            plan.push((uuid.clone(), i, ignored));
        }
    }
    plan
}

/// Two-phase write of a mutated VG. On success the handle's committed
/// copy is replaced and the new seqno is returned. If every MDA fails,
/// the working copy reverts to the committed one and previously
/// suspended LVs are reactivated from it.
pub fn write_vg(
    handle: &mut VgHandle,
    mut new_vg: VG,
    devctl: &dyn DeviceController,
) -> Result<u64> {
    // Committing an unchanged VG must not advance seqno or touch MDAs.
    if new_vg == handle.committed {
        debug!("vg {}: no change, seqno stays {}", new_vg.name, new_vg.seqno);
        return Ok(new_vg.seqno);
    }

    new_vg.validate()?;
    new_vg.seqno = handle.committed.seqno + 1;

    // reflect missing PVs in the status flags
    let partial = new_vg.is_partial();
    new_vg.status.retain(|s| s != VG_STATUS_PARTIAL);
    if partial {
        new_vg.status.push(VG_STATUS_PARTIAL.to_string());
    }

    let text = wrap_vg_text(&new_vg);
    let plan = write_plan(&new_vg);
    if plan.is_empty() {
        return Err(Error::Metadata(MetadataError::MetadataWrite(format!(
            "vg {} has no writable MDA",
            new_vg.name
        ))));
    }

    // Phase one: append the text and point the precommit slot at it.
    // Old and new records both exist afterwards; the committed slot
    // still points at the old one.
    let mut precommitted = Vec::new();
    let mut failed = Vec::new();
    for (uuid, mda_index, ignored) in &plan {
        let pvh = match handle.headers.get(uuid) {
            Some(x) => x,
            None => {
                failed.push((uuid.clone(), *mda_index));
                continue;
            }
        };
        match pvh.precommit_metadata(*mda_index, &text, *ignored) {
            Ok(()) => precommitted.push((uuid.clone(), *mda_index)),
            Err(e) => {
                warn!("precommit failed on {} mda{}: {}", uuid, mda_index, e);
                failed.push((uuid.clone(), *mda_index));
            }
        }
    }

    if precommitted.is_empty() {
        revert_write(handle, devctl);
        return Err(Error::Metadata(MetadataError::MetadataWrite(format!(
            "no MDA of vg {} could be precommitted",
            new_vg.name
        ))));
    }

    // Phase two: flip the committed slot, primary MDA first. A crash
    // before any flip leaves the old metadata authoritative; a crash
    // part-way leaves mixed seqnos and the reader picks the highest.
    let mut committed = 0;
    for (uuid, mda_index) in &precommitted {
        let pvh = handle.headers.get(uuid).expect("precommitted above");
        match pvh.commit_metadata(*mda_index) {
            Ok(()) => committed += 1,
            Err(e) => {
                warn!("commit failed on {} mda{}: {}", uuid, mda_index, e);
                failed.push((uuid.clone(), *mda_index));
            }
        }
    }

    if committed == 0 {
        for (uuid, mda_index) in &precommitted {
            if let Some(pvh) = handle.headers.get(uuid) {
                let _ = pvh.revert_precommit(*mda_index);
            }
        }
        revert_write(handle, devctl);
        return Err(Error::Metadata(MetadataError::MetadataWrite(format!(
            "no MDA of vg {} could be committed",
            new_vg.name
        ))));
    }

    if !failed.is_empty() {
        warn!(
            "vg {}: {} of {} MDAs failed, continuing degraded",
            new_vg.name,
            failed.len(),
            plan.len()
        );
    }

    let seqno = new_vg.seqno;
    debug!("vg {}: committed seqno {}", new_vg.name, seqno);
    handle.committed = new_vg.clone();
    handle.vg = new_vg;
    Ok(seqno)
}

// All replicas failed: drop the working copy and bring LVs back up from
// the committed one.
fn revert_write(handle: &mut VgHandle, devctl: &dyn DeviceController) {
    warn!("vg {}: reverting to committed metadata", handle.committed.name);
    handle.vg = handle.committed.clone();
    for lv in handle.committed.lvs.values() {
        if lv.is_visible() {
            if let Err(e) = devctl.activate(&handle.committed, lv) {
                warn!("reactivation of {} failed: {}", lv.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::devctl::NoopController;
    use crate::scan::{scan, ScanFilter};
    use crate::vg::LvCreate;
    use std::fs::File;
    use std::path::PathBuf;

    fn image(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let f = File::create(&path).unwrap();
        f.set_len(64 * 1024 * 1024).unwrap();
        path
    }

    fn fresh_vg(dir: &tempfile::TempDir, paths: &[PathBuf]) -> VgHandle {
        let _ = dir;
        let mut vg = VG::alloc_vg("vg0", 2048);
        let mut headers = BTreeMap::new();
        for path in paths {
            let pvh = PvHeader::initialize(path).unwrap();
            let pv = pv_from_header(&pvh, vg.extent_size);
            headers.insert(pv.id.clone(), pvh);
            vg.add_pv(pv).unwrap();
        }
        VgHandle {
            committed: vg.clone(),
            vg,
            headers,
        }
    }

    fn scan_paths(paths: &[PathBuf]) -> ScanTable {
        let config = RuntimeConfig::default();
        let filter = ScanFilter {
            paths: paths.to_vec(),
            ..Default::default()
        };
        scan(&config, &filter).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![image(&dir, "pva"), image(&dir, "pvb")];
        let mut handle = fresh_vg(&dir, &paths);

        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("lv0", 10)).unwrap();
        let seqno = write_vg(&mut handle, work, &NoopController).unwrap();
        assert_eq!(seqno, 1);

        let table = scan_paths(&paths);
        let read = read_vg(&table, "vg0").unwrap();
        assert_eq!(read.vg.seqno, 1);
        assert_eq!(read.vg.name, "vg0");
        assert!(read.vg.lvs.contains_key("lv0"));
        assert_eq!(read.vg.lvs["lv0"].used_extents(), 10);
        // every present PV got a device and MDA list attached
        for pv in read.vg.pvs.values() {
            assert!(pv.dev_path.is_some());
            assert_eq!(pv.mdas.len(), 2);
            assert!(!pv.is_missing());
        }
    }

    #[test]
    fn commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![image(&dir, "pva")];
        let mut handle = fresh_vg(&dir, &paths);

        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("lv0", 10)).unwrap();
        let seqno = write_vg(&mut handle, work, &NoopController).unwrap();

        // committing the identical VG again must not bump seqno
        let again = handle.vg.clone();
        let seqno2 = write_vg(&mut handle, again, &NoopController).unwrap();
        assert_eq!(seqno, seqno2);

        let table = scan_paths(&paths);
        let read = read_vg(&table, "vg0").unwrap();
        assert_eq!(read.vg.seqno, seqno);
    }

    #[test]
    fn seqno_increases_per_commit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![image(&dir, "pva")];
        let mut handle = fresh_vg(&dir, &paths);

        for (i, lv) in ["lv0", "lv1", "lv2"].iter().enumerate() {
            let mut work = handle.vg.clone();
            work.lv_create(&LvCreate::new(lv, 5)).unwrap();
            let seqno = write_vg(&mut handle, work, &NoopController).unwrap();
            assert_eq!(seqno, i as u64 + 1);
        }
    }

    #[test]
    fn missing_device_marks_pv_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![image(&dir, "pva"), image(&dir, "pvb")];
        let mut handle = fresh_vg(&dir, &paths);

        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("lv0", 10)).unwrap();
        write_vg(&mut handle, work, &NoopController).unwrap();

        // lose pvb
        std::fs::remove_file(&paths[1]).unwrap();
        let table = scan_paths(&paths);
        let read = read_vg(&table, "vg0").unwrap();

        let missing: Vec<&PV> = read.vg.pvs.values().filter(|pv| pv.is_missing()).collect();
        assert_eq!(missing.len(), 1);
        assert!(read.vg.is_partial());
    }

    #[test]
    fn stale_replica_is_repaired_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![image(&dir, "pva"), image(&dir, "pvb")];
        let mut handle = fresh_vg(&dir, &paths);

        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("lv0", 10)).unwrap();
        write_vg(&mut handle, work, &NoopController).unwrap();

        // Simulate a crash between commits: precommit everywhere, flip
        // only the primary PV's first MDA.
        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("lv1", 5)).unwrap();
        work.seqno = handle.committed.seqno + 1;
        let text = wrap_vg_text(&work);
        let primary = handle.headers.keys().next().unwrap().clone();
        for (uuid, pvh) in &handle.headers {
            pvh.precommit_metadata(0, &text, false).unwrap();
            pvh.precommit_metadata(1, &text, false).unwrap();
            if *uuid == primary {
                pvh.commit_metadata(0).unwrap();
            }
        }

        // the reader selects the highest seqno
        let table = scan_paths(&paths);
        let read = read_vg(&table, "vg0").unwrap();
        assert_eq!(read.vg.seqno, 2);
        assert!(read.vg.lvs.contains_key("lv1"));

        // the next successful write rewrites the stale MDAs
        let mut handle2 = read;
        let mut work2 = handle2.vg.clone();
        work2.lv_create(&LvCreate::new("lv2", 5)).unwrap();
        write_vg(&mut handle2, work2, &NoopController).unwrap();

        for pvh in handle2.headers.values() {
            let (_, vg_map) = unwrap_vg_text(&pvh.read_metadata_area(0).unwrap()).unwrap();
            assert_eq!(vg_map.u64_from_textmap("seqno"), Some(3));
        }
    }
}
