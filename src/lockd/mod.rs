// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The lock daemon and its client library.
//!
//! The wire protocol carries the crate's config-style key/value text in
//! length-prefixed frames over a UNIX stream socket, one reply per
//! request. Protocol id "lvmlockd", version 1.

pub mod client;
pub mod daemon;
pub mod lm;
pub mod lockspace;

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::parser::{buf_to_textmap, textmap_to_buf, Entry, LvmTextMap};
use crate::{Error, Result};

pub const PROTOCOL: &str = "lvmlockd";
pub const PROTOCOL_VERSION: i64 = 1;

/// Lockspace names are the prefix plus the VG name.
pub const LS_PREFIX: &str = "lvm_";
/// The dlm/idm global lockspace.
pub const LS_NAME_GL: &str = "lvm_global";

/// The global-lock resource name inside its lockspace.
pub const R_NAME_GL: &str = "GLLK";
/// The VG-lock resource name inside a VG lockspace.
pub const R_NAME_VG: &str = "VGLK";

// Request flags.
pub const AF_PERSISTENT: u32 = 0x0000_0001;
pub const AF_NO_CLIENT: u32 = 0x0000_0002;
pub const AF_UNLOCK_CANCEL: u32 = 0x0000_0004;
pub const AF_WAIT: u32 = 0x0000_0010;
pub const AF_WAIT_STARTING: u32 = 0x0000_1000;
pub const AF_ADOPT: u32 = 0x0001_0000;
pub const AF_SH_EXISTS_OK: u32 = 0x0010_0000;
pub const AF_ADOPT_ONLY: u32 = 0x0020_0000;
pub const AF_REPAIR: u32 = 0x0080_0000;
pub const AF_NOWAIT: u32 = 0x0100_0000;

// Reply result_flags bits.
pub const RF_NO_LOCKSPACES: u32 = 0x0000_0001;
pub const RF_NO_GL_LS: u32 = 0x0000_0002;
pub const RF_WARN_GL_REMOVED: u32 = 0x0000_0004;
pub const RF_DUP_GL_LS: u32 = 0x0000_0008;
pub const RF_NO_LM: u32 = 0x0000_0010;
pub const RF_SH_EXISTS: u32 = 0x0000_0020;

/// Lock modes; a larger value is strictly more restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Iv,
    Un,
    Nl,
    Sh,
    Ex,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Iv => "iv",
            LockMode::Un => "un",
            LockMode::Nl => "nl",
            LockMode::Sh => "sh",
            LockMode::Ex => "ex",
        }
    }

    pub fn parse(s: &str) -> Option<LockMode> {
        Some(match s {
            "iv" => LockMode::Iv,
            "un" => LockMode::Un,
            "nl" => LockMode::Nl,
            "sh" => LockMode::Sh,
            "ex" => LockMode::Ex,
            _ => return None,
        })
    }

    /// Two holders may coexist iff neither is more restrictive than SH.
    pub fn compatible(self, other: LockMode) -> bool {
        self <= LockMode::Sh && other <= LockMode::Sh
    }
}

/// Resource scopes, from widest to narrowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Gl,
    Vg,
    Lv,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Gl => "gl",
            ResourceType::Vg => "vg",
            ResourceType::Lv => "lv",
        }
    }

    pub fn parse(s: &str) -> Option<ResourceType> {
        Some(match s {
            "gl" => ResourceType::Gl,
            "vg" => ResourceType::Vg,
            "lv" => ResourceType::Lv,
            _ => return None,
        })
    }
}

pub const VAL_BLK_VERSION: u16 = 0x0101;
pub const VBF_REMOVED: u16 = 0x0001;

/// The small payload a lock backend transports alongside GL/VG lock
/// state. `r_version` invalidates remote metadata caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValBlk {
    pub version: u16,
    pub flags: u16,
    pub r_version: u32,
}

impl ValBlk {
    pub fn new(r_version: u32) -> ValBlk {
        ValBlk {
            version: VAL_BLK_VERSION,
            flags: 0,
            r_version,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.flags & VBF_REMOVED != 0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        LittleEndian::write_u16(&mut buf[0..2], self.version);
        LittleEndian::write_u16(&mut buf[2..4], self.flags);
        LittleEndian::write_u32(&mut buf[4..8], self.r_version);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<ValBlk> {
        if buf.len() < 8 {
            return None;
        }
        Some(ValBlk {
            version: LittleEndian::read_u16(&buf[0..2]),
            flags: LittleEndian::read_u16(&buf[2..4]),
            r_version: LittleEndian::read_u32(&buf[4..8]),
        })
    }
}

const MAX_FRAME: u32 = 1024 * 1024;

/// Write one length-prefixed frame carrying a serialized textmap.
pub fn write_frame<W: Write>(stream: &mut W, map: &LvmTextMap) -> Result<()> {
    let body = textmap_to_buf(map);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, body.len() as u32);
    stream.write_all(&len)?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame; None on a clean EOF at a frame boundary.
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Option<LvmTextMap>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let len = LittleEndian::read_u32(&len);
    if len > MAX_FRAME {
        return Err(Error::Parse(format!("oversized frame ({} bytes)", len)));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(Some(buf_to_textmap(&body)?))
}

/// Builder for request maps with the standard fields.
pub fn request_map(op: &str) -> LvmTextMap {
    let mut map = LvmTextMap::new();
    map.insert("request".to_string(), Entry::String(PROTOCOL.to_string()));
    map.insert("version".to_string(), Entry::Number(PROTOCOL_VERSION));
    map.insert("op".to_string(), Entry::String(op.to_string()));
    map
}

pub fn map_put_str(map: &mut LvmTextMap, key: &str, val: &str) {
    map.insert(key.to_string(), Entry::String(val.to_string()));
}

pub fn map_put_num(map: &mut LvmTextMap, key: &str, val: i64) {
    map.insert(key.to_string(), Entry::Number(val));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_ordering_matches_restrictiveness() {
        assert!(LockMode::Iv < LockMode::Un);
        assert!(LockMode::Un < LockMode::Nl);
        assert!(LockMode::Nl < LockMode::Sh);
        assert!(LockMode::Sh < LockMode::Ex);
    }

    #[test]
    fn mode_compatibility_algebra() {
        // both succeed iff both are <= SH
        let modes = [LockMode::Un, LockMode::Nl, LockMode::Sh, LockMode::Ex];
        for a in modes {
            for b in modes {
                assert_eq!(
                    a.compatible(b),
                    a <= LockMode::Sh && b <= LockMode::Sh
                );
            }
        }
    }

    #[test]
    fn val_blk_round_trips() {
        let vb = ValBlk::new(42);
        let back = ValBlk::from_bytes(&vb.to_bytes()).unwrap();
        assert_eq!(back, vb);
        assert_eq!(back.version, VAL_BLK_VERSION);
        assert!(!back.is_removed());
    }

    #[test]
    fn frame_round_trips() {
        let mut map = request_map("lock_vg");
        map_put_str(&mut map, "vg_name", "vg0");
        map_put_num(&mut map, "flags", 3);

        let mut buf = Vec::new();
        write_frame(&mut buf, &map).unwrap();
        let back = read_frame(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(back, map);

        // EOF at a frame boundary is a clean close
        assert!(read_frame(&mut &[][..]).unwrap().is_none());
    }
}
