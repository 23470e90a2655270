// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end metadata engine scenarios over sparse-file PVs.

use std::fs::File;
use std::path::PathBuf;

use malvin::cmd::CommandContext;
use malvin::config::RuntimeConfig;
use malvin::convert::{self, LvConvert, MergeState};
use malvin::devctl::NoopController;
use malvin::lv::SegmentType;
use malvin::metadata::{read_vg, write_vg};
use malvin::scan::{scan, ScanFilter};
use malvin::vg::{LvCreate, LV_STATUS_ORIGIN};
use malvin::{Error, MetadataError};

// 4 MiB extents on 406 MiB devices leave 100 usable extents per PV
// (after the two 1 MiB metadata areas and data alignment).
const EXTENT_SIZE: u64 = 8192;
const DEV_SIZE: u64 = 406 * 1024 * 1024;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: CommandContext,
    paths: Vec<PathBuf>,
}

impl Fixture {
    fn new(pv_names: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for name in pv_names {
            let path = dir.path().join(name);
            let f = File::create(&path).unwrap();
            f.set_len(DEV_SIZE).unwrap();
            paths.push(path);
        }

        let mut config = RuntimeConfig::default();
        config.lease_dir = dir.path().join("locks");
        config.scan_events = 0;

        let mut ctx = CommandContext::new(config);
        ctx.filter = ScanFilter {
            paths: paths.clone(),
            ..Default::default()
        };
        ctx.devctl = Box::new(NoopController);

        Fixture {
            _dir: dir,
            ctx,
            paths,
        }
    }

    fn vg_with_two_pvs(&self) -> String {
        for path in &self.paths {
            self.ctx.pv_create(path).unwrap();
        }
        self.ctx
            .vg_create("vg0", &self.paths, EXTENT_SIZE, None)
            .unwrap();
        "vg0".to_string()
    }

    fn read(&self, name: &str) -> malvin::vg::VG {
        let table = self.ctx.scan().unwrap();
        read_vg(&table, name).unwrap().vg
    }
}

#[test]
fn create_linear_lv_end_to_end() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();

    let before = fx.read("vg0");
    let base_seqno = before.seqno;
    let free_per_pv: Vec<u64> = before.pvs.values().map(|pv| pv.pe_count).collect();
    assert!(free_per_pv.iter().all(|c| *c >= 50));

    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 50)).unwrap();

    let vg = fx.read("vg0");
    assert_eq!(vg.seqno, base_seqno + 1);
    let lv = &vg.lvs["lv0"];
    assert_eq!(lv.segments.len(), 1);
    let (first_pv_id, offset) = match &lv.segments[0].ty {
        SegmentType::Striped { stripes, .. } => stripes[0].clone(),
        other => panic!("expected striped, got {:?}", other),
    };
    assert_eq!(offset, 0);
    assert_eq!(lv.segments[0].extent_count, 50);
    assert_eq!(vg.pv_alloc_count(&first_pv_id), 50);
    let other_pv: Vec<&String> = vg.pvs.keys().filter(|id| **id != first_pv_id).collect();
    assert_eq!(vg.pv_alloc_count(other_pv[0]), 0);

    // serialize and reparse yields an identical object
    let map = vg.to_textmap();
    let back = malvin::vg::VG::from_textmap("vg0", &map).unwrap();
    let mut stripped = vg.clone();
    for pv in stripped.pvs.values_mut() {
        pv.dev_path = None;
        pv.mdas.clear();
    }
    assert_eq!(back, stripped);
}

#[test]
fn convert_linear_to_two_way_mirror() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 50)).unwrap();
    let seqno_before = fx.read("vg0").seqno;

    fx.ctx
        .lv_convert(
            "vg0",
            "lv0",
            &LvConvert::Mirror {
                mirrors: 1,
                region_size: 1024,
            },
        )
        .unwrap();

    let vg = fx.read("vg0");
    assert_eq!(vg.seqno, seqno_before + 1);
    match &vg.lvs["lv0"].segments[0].ty {
        SegmentType::Mirror { images, log, .. } => {
            assert_eq!(
                images,
                &vec!["lv0_mimage_0".to_string(), "lv0_mimage_1".to_string()]
            );
            assert_eq!(log.as_deref(), Some("lv0_mlog"));
        }
        other => panic!("expected mirror, got {:?}", other),
    }
    for image in ["lv0_mimage_0", "lv0_mimage_1"] {
        let sub = &vg.lvs[image];
        assert!(!sub.is_visible());
        assert_eq!(sub.used_extents(), 50);
    }
    // the two images sit on different PVs
    let pv_of = |name: &str| match &vg.lvs[name].segments[0].ty {
        SegmentType::Striped { stripes, .. } => stripes[0].0.clone(),
        other => panic!("expected striped image, got {:?}", other),
    };
    assert_ne!(pv_of("lv0_mimage_0"), pv_of("lv0_mimage_1"));
    assert_eq!(vg.lvs["lv0_mlog"].used_extents(), 1);
    vg.validate().unwrap();
}

#[test]
fn snapshot_create_and_merge_scheduling() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 50)).unwrap();
    let seqno_start = fx.read("vg0").seqno;

    let mut spec = LvCreate::new("snap", 20);
    spec.cow_of = Some("lv0".to_string());
    spec.chunk_size = Some(8);
    fx.ctx.lv_create("vg0", &spec).unwrap();

    let vg = fx.read("vg0");
    assert!(vg.lvs["lv0"].has_status(LV_STATUS_ORIGIN));
    let link = vg
        .lvs
        .values()
        .find(|lv| {
            lv.segments
                .iter()
                .any(|seg| matches!(seg.ty, SegmentType::Snapshot { .. }))
        })
        .expect("snapshot link LV exists");
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
        other => panic!("expected snapshot, got {:?}", other),
    }

    fx.ctx
        .lv_convert("vg0", "snap", &LvConvert::SnapshotMerge)
        .unwrap();

    let vg = fx.read("vg0");
    assert_eq!(convert::merge_state(&vg, "snap"), MergeState::Scheduled);
    // seqno advanced exactly twice: create, then merge scheduling
    assert_eq!(vg.seqno, seqno_start + 2);

    // activation simulation consumes the merge
    let table = fx.ctx.scan().unwrap();
    let mut handle = read_vg(&table, "vg0").unwrap();
    let mut work = handle.vg.clone();
    convert::snapshot_merge_finish(&mut work, "snap").unwrap();
    write_vg(&mut handle, work, &NoopController).unwrap();

    let vg = fx.read("vg0");
    assert!(!vg.lvs.contains_key("snap"));
    assert!(vg.lvs.contains_key("lv0"));
    assert!(!vg.lvs["lv0"].has_status(LV_STATUS_ORIGIN));
    vg.validate().unwrap();
}

#[test]
fn partial_vg_refuses_mutation() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 50)).unwrap();
    let seqno_before = fx.read("vg0").seqno;

    // find which device lv0 does NOT use, and lose it
    let vg = fx.read("vg0");
    let used_pv = match &vg.lvs["lv0"].segments[0].ty {
        SegmentType::Striped { stripes, .. } => stripes[0].0.clone(),
        other => panic!("unexpected {:?}", other),
    };
    let lost_path = vg
        .pvs
        .values()
        .find(|pv| pv.id != used_pv)
        .and_then(|pv| pv.dev_path.clone())
        .expect("second PV has a device");
    std::fs::remove_file(&lost_path).unwrap();

    match fx.ctx.lv_resize("vg0", "lv0", 10) {
        Err(ref e @ Error::Metadata(MetadataError::Partial(_))) => {
            assert_eq!(e.tag(), "ERR_PARTIAL");
        }
        other => panic!("expected ERR_PARTIAL, got {:?}", other),
    }

    // no change to metadata or seqno
    let vg = fx.read("vg0");
    assert_eq!(vg.seqno, seqno_before);
    assert_eq!(vg.lvs["lv0"].used_extents(), 50);
    assert!(vg.is_partial());
}

#[test]
fn crash_prefix_never_yields_hybrid_metadata() {
    // For every prefix of {precommit each MDA, commit each MDA},
    // re-reading observes either the old VG or the new VG.
    let op_count = 8; // 2 PVs x 2 MDAs, precommit + commit
    for prefix in 0..=op_count {
        let fx = Fixture::new(&["pva", "pvb"]);
        fx.vg_with_two_pvs();
        fx.ctx.lv_create("vg0", &LvCreate::new("old", 10)).unwrap();

        let table = fx.ctx.scan().unwrap();
        let handle = read_vg(&table, "vg0").unwrap();
        let old_seqno = handle.vg.seqno;

        // build the new metadata text by hand
        let mut work = handle.vg.clone();
        work.lv_create(&LvCreate::new("new", 10)).unwrap();
        work.seqno = old_seqno + 1;
        let text = {
            // write_vg wraps the text the same way
            use malvin::parser::{textmap_to_buf, Entry, LvmTextMap};
            let mut disk = LvmTextMap::new();
            disk.insert(
                "contents".to_string(),
                Entry::String("Malvin Text Format Volume Group".to_string()),
            );
            disk.insert("version".to_string(), Entry::Number(1));
            disk.insert("vg0".to_string(), Entry::TextMap(Box::new(work.to_textmap())));
            let mut buf = textmap_to_buf(&disk);
            buf.push(b'\0');
            buf
        };

        let mut ops: Vec<Box<dyn Fn()>> = Vec::new();
        let headers: Vec<_> = handle.headers.values().cloned().collect();
        for pvh in &headers {
            for mda in 0..2 {
                let pvh = pvh.clone();
                let text = text.clone();
                ops.push(Box::new(move || {
                    pvh.precommit_metadata(mda, &text, false).unwrap();
                }));
            }
        }
        for pvh in &headers {
            for mda in 0..2 {
                let pvh = pvh.clone();
                ops.push(Box::new(move || {
                    pvh.commit_metadata(mda).unwrap();
                }));
            }
        }
        assert_eq!(ops.len(), op_count);

        for op in ops.iter().take(prefix) {
            op();
        }

        // crash here; what does a fresh reader see?
        let vg = fx.read("vg0");
        if vg.seqno == old_seqno {
            assert!(vg.lvs.contains_key("old"));
            assert!(!vg.lvs.contains_key("new"));
        } else {
            assert_eq!(vg.seqno, old_seqno + 1);
            assert!(vg.lvs.contains_key("old"));
            assert!(vg.lvs.contains_key("new"));
        }
        vg.validate().unwrap();
    }
}

#[test]
fn vg_rename_and_reduce_flow() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 30)).unwrap();

    fx.ctx.vg_rename("vg0", "vg1").unwrap();
    let vg = fx.read("vg1");
    assert_eq!(vg.name, "vg1");
    assert!(vg.lvs.contains_key("lv0"));

    // the PV not carrying lv0 can be removed
    let used_pv = match &vg.lvs["lv0"].segments[0].ty {
        SegmentType::Striped { stripes, .. } => stripes[0].0.clone(),
        other => panic!("unexpected {:?}", other),
    };
    let unused_device = vg
        .pvs
        .values()
        .find(|pv| pv.id != used_pv)
        .map(|pv| pv.device.clone())
        .unwrap();
    fx.ctx
        .vg_reduce("vg1", Some(&unused_device), false)
        .unwrap();

    let vg = fx.read("vg1");
    assert_eq!(vg.pvs.len(), 1);
    vg.validate().unwrap();
}

#[test]
fn thin_pool_attach_via_command() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.lv_create("vg0", &LvCreate::new("pool0", 40)).unwrap();

    fx.ctx
        .lv_convert(
            "vg0",
            "pool0",
            &LvConvert::ThinPoolAttach {
                metadata_extents: 2,
                chunk_size: 128,
            },
        )
        .unwrap();

    let vg = fx.read("vg0");
    match &vg.lvs["pool0"].segments[0].ty {
        SegmentType::ThinPool {
            data,
            metadata,
            chunk_size,
            ..
        } => {
            assert_eq!(data, "pool0_tdata");
            assert_eq!(metadata, "pool0_tmeta");
            assert_eq!(*chunk_size, 128);
        }
        other => panic!("expected thin-pool, got {:?}", other),
    }
    assert_eq!(vg.pool_metadata_spare.as_deref(), Some("lvol0_pmspare"));
    vg.validate().unwrap();
}

#[test]
fn exported_vg_refuses_writes() {
    let fx = Fixture::new(&["pva", "pvb"]);
    fx.vg_with_two_pvs();
    fx.ctx.vg_export("vg0").unwrap();

    match fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 10)) {
        Err(Error::Metadata(MetadataError::Exported(_))) => {}
        other => panic!("expected ERR_EXPORTED, got {:?}", other),
    }

    fx.ctx.vg_import("vg0").unwrap();
    fx.ctx.lv_create("vg0", &LvCreate::new("lv0", 10)).unwrap();
}
