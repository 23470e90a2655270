// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading and writing LVM on-disk labels and metadata areas.

//
// label is at start of sectors 0-3, usually 1
// label includes offset of pvheader (also within 1st 4 sectors)
// pvheader includes ptrs to data (1), metadata (0-2), and boot (0-1) areas
// metadata area (MDA), located anywhere, starts with 512b mda header, then
//   large text area
// mda header has 40b of stuff, then rlocns[].
// rlocns point into mda text area. rlocn 0 is the committed text metadata,
//   rlocn 1 points to precommitted-but-not-yet-committed text.
// text metadata written aligned to sector-size; text area treated as circular
//   and text may wrap across end to beginning
// text metadata contains vg metadata in lvm config text format. Each commit
//   increments seqno.
//

use std::cmp::min;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind::Other;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::util::{align_to, crc32_calc, hyphenate_uuid, make_uuid};
use crate::{Error, Result};

pub const LABEL_SCAN_SECTORS: usize = 4;
const ID_LEN: usize = 32;
const MDA_MAGIC: &[u8] = b"\x20\x4c\x56\x4d\x32\x20\x78\x5b\x35\x41\x25\x72\x30\x4e\x2a\x3e";
const LABEL_SIZE: usize = 32;
const LABEL_SECTOR: usize = 1;
pub const SECTOR_SIZE: usize = 512;
pub const MDA_HEADER_SIZE: usize = 512;
const DEFAULT_MDA_SIZE: u64 = 1024 * 1024;
const EXTENSION_VERSION: u32 = 2;

/// PV extension flag: the PV belongs to a VG (or was once written by us).
pub const PV_EXT_USED: u32 = 0x1;

const RAW_LOCN_IGNORED: u32 = 0x1;

// BLKGETSIZE64
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

#[derive(Debug)]
pub struct LabelHeader {
    pub id: String,
    pub sector: u64,
    pub crc: u32,
    pub offset: u32,
    pub label: String,
}

impl LabelHeader {
    pub fn from_buf(buf: &[u8]) -> Result<LabelHeader> {
        for x in 0..LABEL_SCAN_SECTORS {
            let sec_buf = &buf[x * SECTOR_SIZE..x * SECTOR_SIZE + SECTOR_SIZE];
            if &sec_buf[..8] == b"LABELONE" {
                let crc = LittleEndian::read_u32(&sec_buf[16..20]);
                if crc != crc32_calc(&sec_buf[20..SECTOR_SIZE]) {
                    return Err(Error::Io(io::Error::new(Other, "Label CRC error")));
                }

                let sector = LittleEndian::read_u64(&sec_buf[8..16]);
                if sector != x as u64 {
                    return Err(Error::Io(io::Error::new(
                        Other,
                        "Sector field should equal sector count",
                    )));
                }

                return Ok(LabelHeader {
                    id: String::from_utf8_lossy(&sec_buf[..8]).into_owned(),
                    sector,
                    crc,
                    // switch from "offset from label" to "offset from start", more convenient.
                    offset: LittleEndian::read_u32(&sec_buf[20..24]) + (x * SECTOR_SIZE) as u32,
                    label: String::from_utf8_lossy(&sec_buf[24..32]).into_owned(),
                });
            }
        }

        Err(Error::Io(io::Error::new(Other, "Label not found")))
    }

    /// Fill in a label header over an already-serialized pv_header.
    fn initialize(sec_buf: &mut [u8; SECTOR_SIZE]) {
        sec_buf[..8].copy_from_slice(b"LABELONE");
        LittleEndian::write_u64(&mut sec_buf[8..16], LABEL_SECTOR as u64);
        LittleEndian::write_u32(&mut sec_buf[20..24], LABEL_SIZE as u32);
        sec_buf[24..32].copy_from_slice(b"LVM2 001");
        let crc_val = crc32_calc(&sec_buf[20..]);
        LittleEndian::write_u32(&mut sec_buf[16..20], crc_val);
    }
}

/// Describes an area within a PV
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PvArea {
    /// The offset from the start of the device in bytes
    pub offset: u64,
    /// The size in bytes
    pub size: u64,
}

#[derive(Debug)]
struct PvAreaIter<'a> {
    area: &'a [u8],
}

fn iter_pv_area(buf: &[u8]) -> PvAreaIter {
    PvAreaIter { area: buf }
}

impl<'a> Iterator for PvAreaIter<'a> {
    type Item = PvArea;

    fn next(&mut self) -> Option<PvArea> {
        let off = LittleEndian::read_u64(&self.area[..8]);
        let size = LittleEndian::read_u64(&self.area[8..16]);

        if off == 0 {
            None
        } else {
            self.area = &self.area[16..];
            Some(PvArea { offset: off, size })
        }
    }
}

/// A pointer within an MDA to one metadata text record.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct RawLocn {
    /// Byte offset of the record from the start of the MDA.
    pub offset: u64,
    /// Record length in bytes.
    pub size: u64,
    /// CRC over the record text.
    pub checksum: u32,
    /// The MDA is written through but not trusted on read.
    pub ignored: bool,
}

// Raw locns are positional: slot 0 is the committed record, slot 1 the
// precommitted one. A zero offset means the slot is empty.
fn read_raw_locn(buf: &[u8]) -> Option<RawLocn> {
    let off = LittleEndian::read_u64(&buf[..8]);
    let size = LittleEndian::read_u64(&buf[8..16]);
    let checksum = LittleEndian::read_u32(&buf[16..20]);
    let flags = LittleEndian::read_u32(&buf[20..24]);

    if off == 0 {
        None
    } else {
        Some(RawLocn {
            offset: off,
            size,
            checksum,
            ignored: (flags & RAW_LOCN_IGNORED) > 0,
        })
    }
}

/// The 512-byte header at the start of each metadata area. Slot 0 points
/// at the committed text, slot 1 at a precommitted text awaiting the
/// header flip.
#[derive(Debug, PartialEq, Clone, Copy, Default)]
pub struct MdaHeader {
    pub committed: Option<RawLocn>,
    pub precommitted: Option<RawLocn>,
}

/// A block device that has been initialized to be an LVM Physical
/// Volume, but that may not be part of a VG yet.
#[derive(Debug, PartialEq, Clone)]
pub struct PvHeader {
    /// The unique identifier.
    pub uuid: String,
    /// Size in bytes of the entire PV.
    pub size: u64,
    /// Extension version. If nonzero, an extension header follows with
    /// flags and possibly bootloader areas.
    pub ext_version: u32,
    /// Extension flags; PV_EXT_USED marks a PV that belongs to a VG.
    pub ext_flags: u32,
    /// A list of the data areas.
    pub data_areas: Vec<PvArea>,
    /// A list of the metadata areas.
    pub metadata_areas: Vec<PvArea>,
    /// A list of the bootloader areas.
    pub bootloader_areas: Vec<PvArea>,
    /// The path to the device this pvheader is within.
    pub dev_path: PathBuf,
}

impl PvHeader {
    //
    // PV HEADER LAYOUT:
    // - static header (uuid and size)
    // - 0+ data areas (actually max 1, usually 1; size 0 == "rest of blkdev")
    //   Remember to subtract mda1 size if present.
    // - blank entry
    // - 0+ metadata areas (max 2, usually 1)
    // - blank entry
    // - 8 bytes of pvextension header
    // - if version > 0
    //   - 0+ bootloader areas (usually 0)
    //
    pub fn from_buf(buf: &[u8], path: &Path) -> Result<PvHeader> {
        let mut da_buf = &buf[ID_LEN + 8..];

        let da_vec: Vec<_> = iter_pv_area(da_buf).collect();

        // move slice past any actual entries plus blank
        // terminating entry
        da_buf = &da_buf[(da_vec.len() + 1) * 16..];

        let md_vec: Vec<_> = iter_pv_area(da_buf).collect();

        da_buf = &da_buf[(md_vec.len() + 1) * 16..];

        let ext_version = LittleEndian::read_u32(&da_buf[..4]);
        let mut ext_flags = 0;
        let mut ba_vec = Vec::new();

        if ext_version != 0 {
            ext_flags = LittleEndian::read_u32(&da_buf[4..8]);

            da_buf = &da_buf[8..];

            ba_vec = iter_pv_area(da_buf).collect();
        }

        Ok(PvHeader {
            uuid: hyphenate_uuid(&buf[..ID_LEN]),
            size: LittleEndian::read_u64(&buf[ID_LEN..ID_LEN + 8]),
            ext_version,
            ext_flags,
            data_areas: da_vec,
            metadata_areas: md_vec,
            bootloader_areas: ba_vec,
            dev_path: path.to_owned(),
        })
    }

    /// Find the PvHeader struct in a given device.
    pub fn find_in_dev(path: &Path) -> Result<PvHeader> {
        let mut f = File::open(path)?;

        let mut buf = [0u8; LABEL_SCAN_SECTORS * SECTOR_SIZE];

        f.read_exact(&mut buf)?;

        let label_header = LabelHeader::from_buf(&buf)?;
        let pvheader = Self::from_buf(&buf[label_header.offset as usize..], path)?;

        Ok(pvheader)
    }

    fn blkdev_size(file: &File) -> Result<u64> {
        let mut val: u64 = 0;
        match unsafe { blkgetsize64(file.as_raw_fd(), &mut val) } {
            Ok(_) => Ok(val),
            Err(_) => {
                // Not a block device; fall back to file size so image
                // files work the same way.
                let len = file.metadata()?.len();
                if len == 0 {
                    Err(Error::Io(io::Error::last_os_error()))
                } else {
                    Ok(len)
                }
            }
        }
    }

    /// Initialize a device as a PV with reasonable defaults: two metadata
    /// areas, no bootloader area, and size based on the device's size.
    pub fn initialize(path: &Path) -> Result<PvHeader> {
        let mut f = OpenOptions::new().read(true).write(true).open(path)?;

        // mda0 starts at 9th sector
        let mda0_offset = (8 * SECTOR_SIZE) as u64;
        // mda0's length is reduced a little by the header length,
        // keeping the data area aligned to 1MB.
        let mda0_length = DEFAULT_MDA_SIZE - mda0_offset;
        let dev_size = Self::blkdev_size(&f)?;

        if dev_size < (DEFAULT_MDA_SIZE * 2) + mda0_offset {
            return Err(Error::Io(io::Error::new(Other, "Device too small")));
        }

        let pvh = PvHeader {
            uuid: make_uuid(),
            size: dev_size,
            ext_version: EXTENSION_VERSION,
            ext_flags: 0,
            data_areas: vec![
                // da0 length is not used
                PvArea {
                    offset: mda0_offset + mda0_length,
                    size: 0,
                },
            ],
            metadata_areas: vec![
                PvArea {
                    offset: mda0_offset,
                    size: mda0_length,
                },
                PvArea {
                    offset: dev_size - DEFAULT_MDA_SIZE,
                    size: DEFAULT_MDA_SIZE,
                },
            ],
            bootloader_areas: Vec::new(),
            dev_path: path.to_owned(),
        };

        pvh.write_label(&mut f)?;

        for area in &pvh.metadata_areas {
            Self::write_mda_header(area, &mut f, &MdaHeader::default())?;
        }

        f.sync_all()?;

        Ok(pvh)
    }

    /// Serialize the header and (re)write the label sector.
    pub fn write_label(&self, f: &mut File) -> Result<()> {
        let mut sec_buf = [0u8; SECTOR_SIZE];

        {
            let mut off = LABEL_SIZE;
            let mut put_u64 = |buf: &mut [u8; SECTOR_SIZE], off: &mut usize, val: u64| {
                LittleEndian::write_u64(&mut buf[*off..*off + 8], val);
                *off += 8;
            };

            let uuid = self.uuid.replace('-', "");
            sec_buf[off..off + ID_LEN].copy_from_slice(uuid.as_bytes());
            off += ID_LEN;

            put_u64(&mut sec_buf, &mut off, self.size);

            for da in &self.data_areas {
                put_u64(&mut sec_buf, &mut off, da.offset);
                put_u64(&mut sec_buf, &mut off, da.size);
            }
            // blank terminating entry
            off += 16;

            for mda in &self.metadata_areas {
                put_u64(&mut sec_buf, &mut off, mda.offset);
                put_u64(&mut sec_buf, &mut off, mda.size);
            }
            off += 16;

            // Extension header
            LittleEndian::write_u32(&mut sec_buf[off..off + 4], self.ext_version);
            LittleEndian::write_u32(&mut sec_buf[off + 4..off + 8], self.ext_flags);
            off += 8;

            for ba in &self.bootloader_areas {
                put_u64(&mut sec_buf, &mut off, ba.offset);
                put_u64(&mut sec_buf, &mut off, ba.size);
            }
        }

        // Must do label last since it calcs crc over everything
        LabelHeader::initialize(&mut sec_buf);

        f.seek(SeekFrom::Start((LABEL_SECTOR * SECTOR_SIZE) as u64))?;
        f.write_all(&sec_buf)?;
        Ok(())
    }

    /// Mark the PV as belonging to a VG (or clear it), rewriting the label.
    pub fn set_used(&mut self, used: bool) -> Result<()> {
        if used {
            self.ext_flags |= PV_EXT_USED;
        } else {
            self.ext_flags &= !PV_EXT_USED;
        }
        let mut f = OpenOptions::new().read(true).write(true).open(&self.dev_path)?;
        self.write_label(&mut f)?;
        f.sync_all()?;
        Ok(())
    }

    pub fn read_mda_header(area: &PvArea, file: &mut File) -> Result<MdaHeader> {
        if area.size as usize <= MDA_HEADER_SIZE {
            return Err(Error::Io(io::Error::new(Other, "MDA too small")));
        }
        file.seek(SeekFrom::Start(area.offset))?;
        let mut hdr = [0u8; MDA_HEADER_SIZE];
        file.read_exact(&mut hdr)?;

        if LittleEndian::read_u32(&hdr[..4]) != crc32_calc(&hdr[4..MDA_HEADER_SIZE]) {
            return Err(Error::Io(io::Error::new(
                Other,
                "MDA header checksum failure",
            )));
        }

        if &hdr[4..20] != MDA_MAGIC {
            return Err(Error::Io(io::Error::new(
                Other,
                format!(
                    "'{}' doesn't match MDA_MAGIC",
                    String::from_utf8_lossy(&hdr[4..20])
                ),
            )));
        }

        let ver = LittleEndian::read_u32(&hdr[20..24]);
        if ver != 1 {
            return Err(Error::Io(io::Error::new(Other, "Bad version, expected 1")));
        }

        let start = LittleEndian::read_u64(&hdr[24..32]);
        if start != area.offset {
            return Err(Error::Io(io::Error::new(
                Other,
                format!(
                    "mdah start {} does not equal pvarea start {}",
                    start, area.offset
                ),
            )));
        }

        let size = LittleEndian::read_u64(&hdr[32..40]);
        if size != area.size {
            return Err(Error::Io(io::Error::new(
                Other,
                format!("mdah size {} does not equal pvarea size {}", size, area.size),
            )));
        }

        Ok(MdaHeader {
            committed: read_raw_locn(&hdr[40..64]),
            precommitted: read_raw_locn(&hdr[64..88]),
        })
    }

    pub fn write_mda_header(area: &PvArea, file: &mut File, mdah: &MdaHeader) -> Result<()> {
        let mut hdr = [0u8; MDA_HEADER_SIZE];

        hdr[4..20].copy_from_slice(MDA_MAGIC);
        LittleEndian::write_u32(&mut hdr[20..24], 1);
        LittleEndian::write_u64(&mut hdr[24..32], area.offset);
        LittleEndian::write_u64(&mut hdr[32..40], area.size);

        for (slot, rl) in [&mdah.committed, &mdah.precommitted].iter().enumerate() {
            if let Some(rl) = rl {
                let off = 40 + slot * 24;
                LittleEndian::write_u64(&mut hdr[off..off + 8], rl.offset);
                LittleEndian::write_u64(&mut hdr[off + 8..off + 16], rl.size);
                LittleEndian::write_u32(&mut hdr[off + 16..off + 20], rl.checksum);
                LittleEndian::write_u32(&mut hdr[off + 20..off + 24], rl.ignored as u32);
            }
        }

        let csum = crc32_calc(&hdr[4..]);
        LittleEndian::write_u32(&mut hdr[..4], csum);

        file.seek(SeekFrom::Start(area.offset))?;
        file.write_all(&hdr)?;
        Ok(())
    }

    // Read one text record out of the circular text area.
    fn read_text(area: &PvArea, file: &mut File, rl: &RawLocn) -> Result<Vec<u8>> {
        let mut text = vec![0; rl.size as usize];
        let first_read = min(area.size - rl.offset, rl.size) as usize;

        file.seek(SeekFrom::Start(area.offset + rl.offset))?;
        file.read_exact(&mut text[..first_read])?;

        if first_read != rl.size as usize {
            // wrapped around the end of the ring
            file.seek(SeekFrom::Start(area.offset + MDA_HEADER_SIZE as u64))?;
            file.read_exact(&mut text[first_read..])?;
        }

        if rl.checksum != crc32_calc(&text) {
            return Err(Error::Io(io::Error::new(Other, "MDA text checksum failure")));
        }

        Ok(text)
    }

    // Append one text record at the next ring position after the committed
    // record, returning its RawLocn. The header is not modified.
    fn write_text(area: &PvArea, file: &mut File, text: &[u8], after: Option<&RawLocn>) -> Result<RawLocn> {
        let usable = area.size - MDA_HEADER_SIZE as u64;
        if text.len() as u64 > usable {
            return Err(Error::Io(io::Error::new(Other, "Metadata too large for MDA")));
        }

        let mut start_off = match after {
            Some(rl) => align_to((rl.offset + rl.size) as usize, SECTOR_SIZE) as u64 % area.size,
            None => MDA_HEADER_SIZE as u64,
        };
        if start_off < MDA_HEADER_SIZE as u64 {
            start_off = MDA_HEADER_SIZE as u64;
        }

        debug_assert_eq!(start_off % SECTOR_SIZE as u64, 0);

        let tail_space = area.size - start_off;
        let written = min(tail_space as usize, text.len());

        if written != 0 {
            file.seek(SeekFrom::Start(area.offset + start_off))?;
            file.write_all(&text[..written])?;
        }

        if written != text.len() {
            file.seek(SeekFrom::Start(area.offset + MDA_HEADER_SIZE as u64))?;
            file.write_all(&text[written..])?;
        }

        Ok(RawLocn {
            offset: start_off,
            size: text.len() as u64,
            checksum: crc32_calc(text),
            ignored: false,
        })
    }

    /// Read the committed metadata text from the first valid,
    /// non-ignored metadata area.
    pub fn read_metadata(&self) -> Result<Vec<u8>> {
        let mut f = OpenOptions::new().read(true).open(&self.dev_path)?;

        for pvarea in &self.metadata_areas {
            let mdah = match Self::read_mda_header(pvarea, &mut f) {
                Ok(x) => x,
                Err(e) => {
                    warn!("skipping bad MDA on {}: {}", self.dev_path.display(), e);
                    continue;
                }
            };

            let rl = match mdah.committed {
                None => continue,
                Some(x) => x,
            };

            if rl.ignored {
                continue;
            }

            return Self::read_text(pvarea, &mut f, &rl);
        }

        Err(Error::Io(io::Error::new(Other, "No valid metadata found")))
    }

    /// Read the committed text from one specific MDA.
    pub fn read_metadata_area(&self, mda_index: usize) -> Result<Vec<u8>> {
        let pvarea = self
            .metadata_areas
            .get(mda_index)
            .ok_or_else(|| Error::Io(io::Error::new(Other, "No such MDA")))?;
        let mut f = OpenOptions::new().read(true).open(&self.dev_path)?;
        let mdah = Self::read_mda_header(pvarea, &mut f)?;
        let rl = mdah
            .committed
            .ok_or_else(|| Error::Io(io::Error::new(Other, "MDA holds no metadata")))?;
        Self::read_text(pvarea, &mut f, &rl)
    }

    /// Phase one of a metadata update on one MDA: append the new text at
    /// the next ring position and point the precommit raw_locn at it. The
    /// committed raw_locn still points at the old text afterwards.
    pub fn precommit_metadata(&self, mda_index: usize, text: &[u8], ignored: bool) -> Result<()> {
        let pvarea = self
            .metadata_areas
            .get(mda_index)
            .ok_or_else(|| Error::Io(io::Error::new(Other, "No such MDA")))?;
        let mut f = OpenOptions::new().read(true).write(true).open(&self.dev_path)?;

        let mut mdah = Self::read_mda_header(pvarea, &mut f)?;
        let mut new_rl = Self::write_text(pvarea, &mut f, text, mdah.committed.as_ref())?;
        new_rl.ignored = ignored;
        mdah.precommitted = Some(new_rl);

        Self::write_mda_header(pvarea, &mut f, &mdah)?;
        f.sync_all()?;
        Ok(())
    }

    /// Phase two: flip the committed raw_locn to the precommitted record.
    /// A no-op if nothing is precommitted.
    pub fn commit_metadata(&self, mda_index: usize) -> Result<()> {
        let pvarea = self
            .metadata_areas
            .get(mda_index)
            .ok_or_else(|| Error::Io(io::Error::new(Other, "No such MDA")))?;
        let mut f = OpenOptions::new().read(true).write(true).open(&self.dev_path)?;

        let mut mdah = Self::read_mda_header(pvarea, &mut f)?;
        if let Some(rl) = mdah.precommitted.take() {
            mdah.committed = Some(rl);
            Self::write_mda_header(pvarea, &mut f, &mdah)?;
            f.sync_all()?;
        }
        Ok(())
    }

    /// Drop a precommitted record, leaving the committed text authoritative.
    pub fn revert_precommit(&self, mda_index: usize) -> Result<()> {
        let pvarea = self
            .metadata_areas
            .get(mda_index)
            .ok_or_else(|| Error::Io(io::Error::new(Other, "No such MDA")))?;
        let mut f = OpenOptions::new().read(true).write(true).open(&self.dev_path)?;

        let mut mdah = Self::read_mda_header(pvarea, &mut f)?;
        if mdah.precommitted.take().is_some() {
            Self::write_mda_header(pvarea, &mut f, &mdah)?;
            f.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;

    fn image(size: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pv0");
        let f = File::create(&path).unwrap();
        f.set_len(size).unwrap();
        (dir, path)
    }

    #[test]
    fn initialize_and_find() {
        let (_dir, path) = image(16 * 1024 * 1024);
        let pvh = PvHeader::initialize(&path).unwrap();
        assert_eq!(pvh.metadata_areas.len(), 2);

        let found = PvHeader::find_in_dev(&path).unwrap();
        assert_eq!(found.uuid, pvh.uuid);
        assert_eq!(found.size, 16 * 1024 * 1024);
        assert_eq!(found.metadata_areas, pvh.metadata_areas);
    }

    #[test]
    fn too_small_device_rejected() {
        let (_dir, path) = image(1024 * 1024);
        assert!(PvHeader::initialize(&path).is_err());
    }

    #[test]
    fn corrupt_label_crc_detected() {
        let (_dir, path) = image(16 * 1024 * 1024);
        PvHeader::initialize(&path).unwrap();

        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start((SECTOR_SIZE + 40) as u64)).unwrap();
        f.write_all(b"garbage!").unwrap();

        assert!(PvHeader::find_in_dev(&path).is_err());
    }

    #[test]
    fn precommit_then_commit_flips_text() {
        let (_dir, path) = image(16 * 1024 * 1024);
        let pvh = PvHeader::initialize(&path).unwrap();

        pvh.precommit_metadata(0, b"one = 1\n", false).unwrap();
        // not yet committed
        assert!(pvh.read_metadata_area(0).is_err());
        pvh.commit_metadata(0).unwrap();
        assert_eq!(pvh.read_metadata_area(0).unwrap(), b"one = 1\n".to_vec());

        pvh.precommit_metadata(0, b"two = 2\n", false).unwrap();
        // old text still authoritative before the flip
        assert_eq!(pvh.read_metadata_area(0).unwrap(), b"one = 1\n".to_vec());
        pvh.commit_metadata(0).unwrap();
        assert_eq!(pvh.read_metadata_area(0).unwrap(), b"two = 2\n".to_vec());
    }

    #[test]
    fn revert_drops_precommit() {
        let (_dir, path) = image(16 * 1024 * 1024);
        let pvh = PvHeader::initialize(&path).unwrap();

        pvh.precommit_metadata(0, b"one = 1\n", false).unwrap();
        pvh.commit_metadata(0).unwrap();
        pvh.precommit_metadata(0, b"two = 2\n", false).unwrap();
        pvh.revert_precommit(0).unwrap();
        pvh.commit_metadata(0).unwrap();

        assert_eq!(pvh.read_metadata_area(0).unwrap(), b"one = 1\n".to_vec());
    }

    #[test]
    fn used_flag_round_trips() {
        let (_dir, path) = image(16 * 1024 * 1024);
        let mut pvh = PvHeader::initialize(&path).unwrap();
        assert_eq!(pvh.ext_flags & PV_EXT_USED, 0);

        pvh.set_used(true).unwrap();
        let found = PvHeader::find_in_dev(&path).unwrap();
        assert_eq!(found.ext_flags & PV_EXT_USED, PV_EXT_USED);
    }
}
