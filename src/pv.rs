// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical Volumes

use std::path::PathBuf;

use crate::parser::{status_from_textmap, Entry, LvmTextMap, TextMapOps};
use crate::pvlabel::PvArea;
use crate::{Error, Result};

pub const PV_STATUS_ALLOCATABLE: &str = "ALLOCATABLE";
pub const PV_STATUS_MISSING: &str = "MISSING";
pub const PV_STATUS_EXPORTED: &str = "EXPORTED";

/// One metadata area belonging to a PV, as tracked by the VG.
#[derive(Debug, PartialEq, Clone)]
pub struct PvMda {
    pub area: PvArea,
    /// Written through but not trusted on read.
    pub ignored: bool,
}

/// A Physical Volume as a member of a VG.
#[derive(Debug, PartialEq, Clone)]
pub struct PV {
    /// The unique identifier.
    pub id: String,
    /// Free-form device identity, normally the device path.
    pub device: String,
    /// The status.
    pub status: Vec<String>,
    /// Flags.
    pub flags: Vec<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Size of the device in 512-byte sectors.
    pub dev_size: u64,
    /// First physical extent, in sectors from device start.
    pub pe_start: u64,
    /// Number of physical extents.
    pub pe_count: u64,

    // The rest is carried from the binary PV header by the scanner, not
    // from the metadata text.
    /// Resolved device path, if the device was present at scan time.
    pub dev_path: Option<PathBuf>,
    /// Metadata areas on this PV.
    pub mdas: Vec<PvMda>,
}

impl PV {
    pub fn is_missing(&self) -> bool {
        self.status.iter().any(|s| s == PV_STATUS_MISSING)
    }

    pub fn is_allocatable(&self) -> bool {
        !self.is_missing() && self.status.iter().any(|s| s == PV_STATUS_ALLOCATABLE)
    }

    pub fn set_missing(&mut self, missing: bool) {
        if missing && !self.is_missing() {
            self.status.push(PV_STATUS_MISSING.to_string());
        } else if !missing {
            self.status.retain(|s| s != PV_STATUS_MISSING);
        }
    }
}

pub fn from_textmap(map: &LvmTextMap) -> Result<PV> {
    let err = || Error::Parse("pv textmap parsing error".into());

    let id = map.string_from_textmap("id").ok_or_else(err)?;
    let device = map.string_from_textmap("device").ok_or_else(err)?;
    let dev_size = map.u64_from_textmap("dev_size").ok_or_else(err)?;
    let pe_start = map.u64_from_textmap("pe_start").ok_or_else(err)?;
    let pe_count = map.u64_from_textmap("pe_count").ok_or_else(err)?;

    let status = status_from_textmap(map)?;
    let flags = map.string_list_from_textmap("flags").unwrap_or_default();
    let tags = map.string_list_from_textmap("tags").unwrap_or_default();

    Ok(PV {
        id: id.to_string(),
        device: device.to_string(),
        status,
        flags,
        tags,
        dev_size,
        pe_start,
        pe_count,
        dev_path: None,
        mdas: Vec::new(),
    })
}

pub fn to_textmap(pv: &PV) -> LvmTextMap {
    let mut map = LvmTextMap::new();

    map.insert("id".to_string(), Entry::String(pv.id.clone()));
    map.insert("device".to_string(), Entry::String(pv.device.clone()));

    map.insert(
        "status".to_string(),
        Entry::List(Box::new(
            pv.status.iter().map(|x| Entry::String(x.clone())).collect(),
        )),
    );
    map.insert(
        "flags".to_string(),
        Entry::List(Box::new(
            pv.flags.iter().map(|x| Entry::String(x.clone())).collect(),
        )),
    );
    if !pv.tags.is_empty() {
        map.insert(
            "tags".to_string(),
            Entry::List(Box::new(
                pv.tags.iter().map(|x| Entry::String(x.clone())).collect(),
            )),
        );
    }

    map.insert("dev_size".to_string(), Entry::Number(pv.dev_size as i64));
    map.insert("pe_start".to_string(), Entry::Number(pv.pe_start as i64));
    map.insert("pe_count".to_string(), Entry::Number(pv.pe_count as i64));

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PV {
        PV {
            id: "pvuuid".to_string(),
            device: "/dev/sda".to_string(),
            status: vec![PV_STATUS_ALLOCATABLE.to_string()],
            flags: vec![],
            tags: vec!["fast".to_string()],
            dev_size: 204800,
            pe_start: 2048,
            pe_count: 24,
            dev_path: None,
            mdas: Vec::new(),
        }
    }

    #[test]
    fn textmap_round_trip() {
        let pv = sample();
        let map = to_textmap(&pv);
        let back = from_textmap(&map).unwrap();
        assert_eq!(back, pv);
    }

    #[test]
    fn missing_flag_toggles() {
        let mut pv = sample();
        assert!(pv.is_allocatable());
        pv.set_missing(true);
        assert!(pv.is_missing());
        assert!(!pv.is_allocatable());
        pv.set_missing(false);
        assert!(!pv.is_missing());
    }
}
