// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The label scanner.
//!
//! Enumerates block devices, finds LVM-labeled PVs, and reports the
//! metadata area locations embedded in each PV header. Reads fan out
//! across devices through a bounded pool of reader threads; with a
//! budget of zero the scan degrades to sequential reads with identical
//! results.

use std::collections::BTreeMap;
use std::fs::read_dir;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};
use nix::sys::stat;

use crate::config::RuntimeConfig;
use crate::parser::{buf_to_textmap, Entry, TextMapOps};
use crate::pvlabel::{PvArea, PvHeader, RawLocn};
use crate::Result;

/// One metadata area as seen by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaLocation {
    pub area: PvArea,
    pub ignored: bool,
    /// The committed text record, if the MDA holds one.
    pub raw_locn: Option<RawLocn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceState {
    Ok,
    /// The device carried a label but reading beyond it failed; kept so
    /// higher layers can report a missing PV deterministically.
    IoError(String),
}

/// Everything the scanner learned about one labeled device.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub dev_path: PathBuf,
    pub device_id: String,
    pub pv_uuid: String,
    /// None for orphan PVs.
    pub vg_name: Option<String>,
    pub vg_id: Option<String>,
    pub mdas: Vec<MdaLocation>,
    pub header_version: u32,
    pub ext_flags: u32,
    pub state: DeviceState,
}

/// Scan results keyed by device-id.
pub type ScanTable = BTreeMap<String, ScannedDevice>;

/// Which devices to look at.
#[derive(Debug, Default, Clone)]
pub struct ScanFilter {
    /// Explicit device paths; when set, the dev directory is not walked.
    pub paths: Vec<PathBuf>,
    /// Substrings that exclude a device path.
    pub reject: Vec<String>,
}

impl ScanFilter {
    pub fn accepts(&self, path: &Path) -> bool {
        let s = path.to_string_lossy();
        !self.reject.iter().any(|r| s.contains(r.as_str()))
    }
}

fn candidate_devices(config: &RuntimeConfig, filter: &ScanFilter) -> Result<Vec<PathBuf>> {
    if !filter.paths.is_empty() {
        return Ok(filter
            .paths
            .iter()
            .filter(|p| filter.accepts(p))
            .cloned()
            .collect());
    }

    let mut devices = Vec::new();
    for entry in read_dir(&config.dev_dir)? {
        let path = entry?.path();
        if !filter.accepts(&path) {
            continue;
        }
        match stat::stat(&path) {
            Ok(st) if (st.st_mode & libc::S_IFMT) == libc::S_IFBLK => devices.push(path),
            _ => {}
        }
    }
    Ok(devices)
}

// Pull the VG name and id out of the committed metadata text: the VG is
// the single top-level section.
fn vg_name_from_text(text: &[u8]) -> (Option<String>, Option<String>) {
    let map = match buf_to_textmap(text) {
        Ok(m) => m,
        Err(_) => return (None, None),
    };
    for (key, value) in &map {
        if let Entry::TextMap(vg_map) = value {
            let id = vg_map.string_from_textmap("id").map(|s| s.to_string());
            return (Some(key.clone()), id);
        }
    }
    (None, None)
}

/// Probe one device. Returns None for devices with no valid LVM label.
fn probe_device(path: &Path) -> Option<ScannedDevice> {
    let pvh = match PvHeader::find_in_dev(path) {
        Ok(x) => x,
        Err(_) => return None, // unlabeled or bad label CRC
    };

    let mut dev = ScannedDevice {
        dev_path: path.to_owned(),
        device_id: path.to_string_lossy().into_owned(),
        pv_uuid: pvh.uuid.clone(),
        vg_name: None,
        vg_id: None,
        mdas: Vec::new(),
        header_version: pvh.ext_version,
        ext_flags: pvh.ext_flags,
        state: DeviceState::Ok,
    };

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            dev.state = DeviceState::IoError(e.to_string());
            return Some(dev);
        }
    };

    for area in &pvh.metadata_areas {
        match PvHeader::read_mda_header(area, &mut file) {
            Ok(mdah) => {
                let ignored = mdah.committed.map(|rl| rl.ignored).unwrap_or(false);
                dev.mdas.push(MdaLocation {
                    area: *area,
                    ignored,
                    raw_locn: mdah.committed,
                });
            }
            Err(e) => {
                // a bad MDA header drops that MDA, other MDAs stay valid
                warn!("bad MDA header on {}: {}", path.display(), e);
            }
        }
    }

    if let Ok(text) = pvh.read_metadata() {
        let (vg_name, vg_id) = vg_name_from_text(&text);
        dev.vg_name = vg_name;
        dev.vg_id = vg_id;
    }

    Some(dev)
}

/// Scan for LVM-labeled devices and build the device table. Orphan PVs
/// are included; unlabeled devices are excluded.
pub fn scan(config: &RuntimeConfig, filter: &ScanFilter) -> Result<ScanTable> {
    let devices = candidate_devices(config, filter)?;
    let budget = config.scan_events;

    debug!("scanning {} devices, budget {}", devices.len(), budget);

    let found = if budget > 1 && devices.len() > 1 {
        scan_parallel(devices, budget)
    } else {
        devices.iter().filter_map(|p| probe_device(p)).collect()
    };

    let mut table = ScanTable::new();
    for dev in found {
        table.insert(dev.device_id.clone(), dev);
    }
    debug!("scan found {} labeled devices", table.len());
    Ok(table)
}

// Up to `budget` reader threads pull paths from a shared queue. Results
// arrive unordered; the table sort restores a deterministic view.
fn scan_parallel(devices: Vec<PathBuf>, budget: usize) -> Vec<ScannedDevice> {
    let queue = Arc::new(Mutex::new(devices));
    let (tx, rx) = mpsc::channel();

    let workers = budget.min(num_threads_cap());
    let mut handles = Vec::new();
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name("malvin-scan".to_string())
            .spawn(move || loop {
                let path = match queue.lock() {
                    Ok(mut q) => match q.pop() {
                        Some(p) => p,
                        None => break,
                    },
                    Err(_) => break,
                };
                if let Some(dev) = probe_device(&path) {
                    if tx.send(dev).is_err() {
                        break;
                    }
                }
            });
        match handle {
            Ok(h) => handles.push(h),
            Err(e) => {
                // thread spawn failure degrades to a sequential scan of
                // whatever remains on the queue
                warn!("scan worker spawn failed, going sequential: {}", e);
                break;
            }
        }
    }
    drop(tx);

    let mut found: Vec<ScannedDevice> = rx.iter().collect();

    // drain anything left if spawning stopped early
    if let Ok(mut q) = queue.lock() {
        while let Some(path) = q.pop() {
            if let Some(dev) = probe_device(&path) {
                found.push(dev);
            }
        }
    }

    for h in handles {
        let _ = h.join();
    }
    found
}

fn num_threads_cap() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

/// Re-read only the devices the previous scan associated with `vg`.
/// Required before a command takes a VG write lock, because the
/// unlocked initial scan may be stale.
pub fn rescan(table: &mut ScanTable, vg: &str) -> Result<()> {
    let paths: Vec<(String, PathBuf)> = table
        .values()
        .filter(|dev| {
            dev.vg_name.as_deref() == Some(vg) || dev.vg_id.as_deref() == Some(vg)
        })
        .map(|dev| (dev.device_id.clone(), dev.dev_path.clone()))
        .collect();

    for (device_id, path) in paths {
        match probe_device(&path) {
            Some(dev) => {
                table.insert(device_id, dev);
            }
            None => {
                // device disappeared or lost its label
                table.remove(&device_id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn image(dir: &tempfile::TempDir, name: &str, size: u64) -> PathBuf {
        let path = dir.path().join(name);
        let f = File::create(&path).unwrap();
        f.set_len(size).unwrap();
        path
    }

    #[test]
    fn scan_finds_labeled_and_skips_unlabeled() {
        let dir = tempfile::tempdir().unwrap();
        let labeled = image(&dir, "pv0", 16 * 1024 * 1024);
        let unlabeled = image(&dir, "pv1", 16 * 1024 * 1024);
        let pvh = PvHeader::initialize(&labeled).unwrap();

        let config = RuntimeConfig::default();
        let filter = ScanFilter {
            paths: vec![labeled.clone(), unlabeled],
            ..Default::default()
        };
        let table = scan(&config, &filter).unwrap();

        assert_eq!(table.len(), 1);
        let dev = &table[&labeled.to_string_lossy().into_owned()];
        assert_eq!(dev.pv_uuid, pvh.uuid);
        assert_eq!(dev.vg_name, None);
        assert_eq!(dev.mdas.len(), 2);
        assert_eq!(dev.state, DeviceState::Ok);
    }

    #[test]
    fn filter_rejects_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        let labeled = image(&dir, "pv0", 16 * 1024 * 1024);
        PvHeader::initialize(&labeled).unwrap();

        let config = RuntimeConfig::default();
        let filter = ScanFilter {
            paths: vec![labeled],
            reject: vec!["pv0".to_string()],
        };
        let table = scan(&config, &filter).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn sequential_budget_matches_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..4 {
            let path = image(&dir, &format!("pv{}", i), 16 * 1024 * 1024);
            PvHeader::initialize(&path).unwrap();
            paths.push(path);
        }

        let mut config = RuntimeConfig::default();
        let filter = ScanFilter {
            paths,
            ..Default::default()
        };

        config.scan_events = 0;
        let seq = scan(&config, &filter).unwrap();
        config.scan_events = 4;
        let par = scan(&config, &filter).unwrap();

        assert_eq!(seq.len(), 4);
        assert_eq!(
            seq.keys().collect::<Vec<_>>(),
            par.keys().collect::<Vec<_>>()
        );
    }
}
