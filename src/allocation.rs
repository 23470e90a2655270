// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Extent allocation.
//!
//! The allocator works on free-run maps computed by the VG
//! (`{pv uuid: {start: len}}`) and emits the minimum number of pieces
//! that satisfies a request. Policies differ only in how they order and
//! restrict candidate PVs.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{Error, MetadataError, Result};

pub type FreeMap = BTreeMap<String, BTreeMap<u64, u64>>;

/// (pv uuid, start extent, extent count)
pub type AllocPiece = (String, u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    Contiguous,
    Cling,
    Normal,
    Anywhere,
    /// Resolved to the VG's policy before allocation.
    Inherit,
}

impl AllocPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocPolicy::Contiguous => "contiguous",
            AllocPolicy::Cling => "cling",
            AllocPolicy::Normal => "normal",
            AllocPolicy::Anywhere => "anywhere",
            AllocPolicy::Inherit => "inherit",
        }
    }
}

impl FromStr for AllocPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<AllocPolicy> {
        Ok(match s {
            "contiguous" => AllocPolicy::Contiguous,
            "cling" => AllocPolicy::Cling,
            "normal" => AllocPolicy::Normal,
            "anywhere" => AllocPolicy::Anywhere,
            "inherit" => AllocPolicy::Inherit,
            _ => {
                return Err(Error::Metadata(MetadataError::Invalid(format!(
                    "unknown allocation policy {}",
                    s
                ))))
            }
        })
    }
}

/// Per-segment-type allocation requirements, the remnant of the old
/// function-pointer ops tables.
#[derive(Debug, Clone, Copy)]
pub struct SegTypeTraits {
    /// Parallel data areas one instance needs (stripes, mirror legs).
    pub areas_per_instance: u32,
    /// Parallel metadata sub-LVs one instance needs.
    pub metadata_areas_per_instance: u32,
    /// Extents held back per instance (log, headers).
    pub reserved_extents: u64,
}

pub fn traits_for(type_name: &str) -> SegTypeTraits {
    match type_name {
        "mirror" => SegTypeTraits {
            areas_per_instance: 2,
            metadata_areas_per_instance: 0,
            reserved_extents: 1, // mirror log
        },
        "raid1" | "raid10" => SegTypeTraits {
            areas_per_instance: 2,
            metadata_areas_per_instance: 2,
            reserved_extents: 0,
        },
        "raid4" | "raid5" => SegTypeTraits {
            areas_per_instance: 3,
            metadata_areas_per_instance: 3,
            reserved_extents: 0,
        },
        "raid6" => SegTypeTraits {
            areas_per_instance: 5,
            metadata_areas_per_instance: 5,
            reserved_extents: 0,
        },
        "thin-pool" | "cache-pool" | "vdo-pool" => SegTypeTraits {
            areas_per_instance: 1,
            metadata_areas_per_instance: 1,
            reserved_extents: 0,
        },
        _ => SegTypeTraits {
            areas_per_instance: 1,
            metadata_areas_per_instance: 0,
            reserved_extents: 0,
        },
    }
}

#[derive(Debug, Default)]
pub struct AllocRequest<'a> {
    pub extents: u64,
    /// Restrict candidates to these PVs; empty means all allocatable PVs.
    pub pv_hints: &'a [String],
    /// PVs that must not be used (parallel images of the same LV).
    pub avoid: &'a [String],
    /// The LV's current areas, for cling affinity and contiguous checks.
    pub existing: &'a [AllocPiece],
}

fn total_free(free: &FreeMap) -> u64 {
    free.values().map(|areas| areas.values().sum::<u64>()).sum()
}

fn candidate_allowed(req: &AllocRequest, pv: &str) -> bool {
    if !req.pv_hints.is_empty() && !req.pv_hints.iter().any(|h| h == pv) {
        return false;
    }
    !req.avoid.iter().any(|a| a == pv)
}

// Candidate runs in allocation preference order: all runs on earlier PVs
// first, largest runs first within one PV.
fn ordered_runs(free: &FreeMap, req: &AllocRequest, pv_order: &[String]) -> Vec<AllocPiece> {
    let mut runs = Vec::new();
    for pv in pv_order {
        if !candidate_allowed(req, pv) {
            continue;
        }
        if let Some(areas) = free.get(pv) {
            let mut pv_runs: Vec<AllocPiece> = areas
                .iter()
                .map(|(start, len)| (pv.clone(), *start, *len))
                .collect();
            pv_runs.sort_by(|a, b| b.2.cmp(&a.2).then(a.1.cmp(&b.1)));
            runs.extend(pv_runs);
        }
    }
    runs
}

fn take_from_runs(runs: &[AllocPiece], mut needed: u64) -> Option<Vec<AllocPiece>> {
    let mut pieces = Vec::new();
    for (pv, start, len) in runs {
        if needed == 0 {
            break;
        }
        let take = needed.min(*len);
        pieces.push((pv.clone(), *start, take));
        needed -= take;
    }
    if needed == 0 {
        // keep on-disk ordering stable within the allocation
        pieces.sort();
        Some(pieces)
    } else {
        None
    }
}

/// Allocate `req.extents` according to `policy`. Returns the pieces or
/// `ERR_INSUFFICIENT_FREE_EXTENTS` if no satisfying allocation exists.
pub fn allocate(free: &FreeMap, policy: AllocPolicy, req: &AllocRequest) -> Result<Vec<AllocPiece>> {
    let shortfall = || {
        Error::Metadata(MetadataError::InsufficientFreeExtents {
            requested: req.extents,
            available: total_free(free),
        })
    };

    if req.extents == 0 {
        return Ok(Vec::new());
    }

    match policy {
        AllocPolicy::Inherit => Err(Error::Metadata(MetadataError::Invalid(
            "inherit policy must be resolved by the caller".into(),
        ))),
        AllocPolicy::Contiguous => {
            // A single run abutting the LV's existing last extent.
            let (pv, next) = match req.existing.last() {
                Some((pv, start, len)) => (pv.clone(), start + len),
                None => {
                    // New LV: any single run large enough.
                    let pv_order: Vec<String> = free.keys().cloned().collect();
                    for (pv, start, len) in ordered_runs(free, req, &pv_order) {
                        if len >= req.extents {
                            return Ok(vec![(pv, start, req.extents)]);
                        }
                    }
                    return Err(shortfall());
                }
            };
            match free.get(&pv).and_then(|areas| areas.get(&next)) {
                Some(len) if *len >= req.extents && candidate_allowed(req, &pv) => {
                    Ok(vec![(pv, next, req.extents)])
                }
                _ => Err(shortfall()),
            }
        }
        AllocPolicy::Cling => {
            // PVs already carrying this LV first, then the rest.
            let mut order: Vec<String> = req
                .existing
                .iter()
                .map(|(pv, _, _)| pv.clone())
                .collect();
            order.dedup();
            for pv in free.keys() {
                if !order.contains(pv) {
                    order.push(pv.clone());
                }
            }
            take_from_runs(&ordered_runs(free, req, &order), req.extents).ok_or_else(shortfall)
        }
        AllocPolicy::Normal | AllocPolicy::Anywhere => {
            let order: Vec<String> = free.keys().cloned().collect();
            take_from_runs(&ordered_runs(free, req, &order), req.extents).ok_or_else(shortfall)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_map(entries: &[(&str, &[(u64, u64)])]) -> FreeMap {
        entries
            .iter()
            .map(|(pv, runs)| {
                (
                    pv.to_string(),
                    runs.iter().cloned().collect::<BTreeMap<u64, u64>>(),
                )
            })
            .collect()
    }

    #[test]
    fn normal_takes_first_pv_first() {
        let free = free_map(&[("pva", &[(0, 100)]), ("pvb", &[(0, 100)])]);
        let req = AllocRequest {
            extents: 50,
            ..Default::default()
        };
        let pieces = allocate(&free, AllocPolicy::Normal, &req).unwrap();
        assert_eq!(pieces, vec![("pva".to_string(), 0, 50)]);
    }

    #[test]
    fn normal_spans_pvs_when_needed() {
        let free = free_map(&[("pva", &[(0, 30)]), ("pvb", &[(0, 100)])]);
        let req = AllocRequest {
            extents: 50,
            ..Default::default()
        };
        let pieces = allocate(&free, AllocPolicy::Normal, &req).unwrap();
        assert_eq!(
            pieces,
            vec![("pva".to_string(), 0, 30), ("pvb".to_string(), 0, 20)]
        );
    }

    #[test]
    fn shortfall_reports_totals() {
        let free = free_map(&[("pva", &[(0, 10)])]);
        let req = AllocRequest {
            extents: 50,
            ..Default::default()
        };
        match allocate(&free, AllocPolicy::Normal, &req) {
            Err(Error::Metadata(MetadataError::InsufficientFreeExtents {
                requested,
                available,
            })) => {
                assert_eq!(requested, 50);
                assert_eq!(available, 10);
            }
            other => panic!("expected shortfall, got {:?}", other),
        }
    }

    #[test]
    fn avoid_excludes_parallel_pvs() {
        let free = free_map(&[("pva", &[(0, 100)]), ("pvb", &[(0, 100)])]);
        let avoid = ["pva".to_string()];
        let req = AllocRequest {
            extents: 50,
            avoid: &avoid,
            ..Default::default()
        };
        let pieces = allocate(&free, AllocPolicy::Normal, &req).unwrap();
        assert_eq!(pieces, vec![("pvb".to_string(), 0, 50)]);
    }

    #[test]
    fn contiguous_requires_abutting_run() {
        let free = free_map(&[("pva", &[(50, 50)]), ("pvb", &[(0, 100)])]);
        let existing = [("pva".to_string(), 0, 50)];
        let req = AllocRequest {
            extents: 20,
            existing: &existing,
            ..Default::default()
        };
        let pieces = allocate(&free, AllocPolicy::Contiguous, &req).unwrap();
        assert_eq!(pieces, vec![("pva".to_string(), 50, 20)]);

        // a gap breaks contiguity
        let free = free_map(&[("pva", &[(60, 50)]), ("pvb", &[(0, 100)])]);
        assert!(allocate(&free, AllocPolicy::Contiguous, &req).is_err());
    }

    #[test]
    fn cling_prefers_existing_pv() {
        let free = free_map(&[("pva", &[(50, 50)]), ("pvb", &[(10, 90)])]);
        let existing = [("pvb".to_string(), 0, 10)];
        let req = AllocRequest {
            extents: 20,
            existing: &existing,
            ..Default::default()
        };
        let pieces = allocate(&free, AllocPolicy::Cling, &req).unwrap();
        assert_eq!(pieces, vec![("pvb".to_string(), 10, 20)]);
    }

    #[test]
    fn policy_strings_round_trip() {
        for p in [
            AllocPolicy::Contiguous,
            AllocPolicy::Cling,
            AllocPolicy::Normal,
            AllocPolicy::Anywhere,
            AllocPolicy::Inherit,
        ] {
            assert_eq!(p.as_str().parse::<AllocPolicy>().unwrap(), p);
        }
        assert!("bogus".parse::<AllocPolicy>().is_err());
    }
}
