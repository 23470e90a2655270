// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crc::crc32;
use time::OffsetDateTime;
use uuid::Uuid;

const INITIAL_CRC: u32 = 0xf597a6cf;
const CRC_SEED: u32 = 0xedb88320;

// The character set LVM uses for the textual form of its 32-byte ids.
const UUID_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// Hyphen grouping of the 32 chars: 6-4-4-4-4-4-6.
const UUID_GROUPS: [usize; 7] = [6, 4, 4, 4, 4, 4, 6];

pub fn align_to(num: usize, align_to: usize) -> usize {
    let agn = align_to - 1;

    (num + agn) & !agn
}

pub fn crc32_calc(buf: &[u8]) -> u32 {
    let table = crc32::make_table(CRC_SEED);

    // For some reason, we need to negate the initial CRC value
    // and the result, to match what LVM2 is generating.
    !crc32::update(!INITIAL_CRC, &table, buf)
}

/// Insert hyphens into a raw 32-char id, 6-4-4-4-4-4-6.
pub fn hyphenate_uuid(bytes: &[u8]) -> String {
    debug_assert_eq!(bytes.len(), 32);

    let mut out = String::with_capacity(38);
    let mut pos = 0;
    for (i, group) in UUID_GROUPS.iter().enumerate() {
        if i != 0 {
            out.push('-');
        }
        out.push_str(&String::from_utf8_lossy(&bytes[pos..pos + group]));
        pos += group;
    }
    out
}

/// Generate a new hyphenated id in LVM's base-62 format.
pub fn make_uuid() -> String {
    let mut raw = [0u8; 32];

    let a = *Uuid::new_v4().as_bytes();
    let b = *Uuid::new_v4().as_bytes();
    for (i, byte) in a.iter().chain(b.iter()).enumerate() {
        raw[i] = UUID_CHARS[*byte as usize % UUID_CHARS.len()];
    }

    hyphenate_uuid(&raw)
}

pub fn now_seconds() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Node name used for creation_host fields.
pub fn hostname() -> String {
    match nix::sys::utsname::uname() {
        Ok(u) => u.nodename().to_string_lossy().into_owned(),
        Err(_) => "localhost".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align_to(1, 512), 512);
        assert_eq!(align_to(512, 512), 512);
        assert_eq!(align_to(513, 512), 1024);
        assert_eq!(align_to(0, 4096), 0);
    }

    #[test]
    fn uuid_shape() {
        let id = make_uuid();
        assert_eq!(id.len(), 38);
        let lens: Vec<usize> = id.split('-').map(|g| g.len()).collect();
        assert_eq!(lens, vec![6, 4, 4, 4, 4, 4, 6]);
    }

    #[test]
    fn crc_is_stable() {
        let c1 = crc32_calc(b"LVM2 001");
        assert_eq!(c1, crc32_calc(b"LVM2 001"));
        assert_ne!(c1, crc32_calc(b"LVM2 002"));
    }
}
