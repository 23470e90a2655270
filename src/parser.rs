// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parser for the LVM text metadata format.
//
// The language is nested key/value text: `key = value` pairs and
// `name { ... }` sections, with `#` comments, double-quoted strings
// (no escapes), decimal integers, and flat `[...]` lists of strings
// and numbers. One recursive-descent pass over the raw bytes builds
// the tree directly; there is no intermediate token stream. The same
// language serves on-disk VG metadata, the lvm.conf-style config file,
// and the lock daemon's request bodies.

use std::collections::btree_map::BTreeMap;

use crate::{Error, Result};

pub type LvmTextMap = BTreeMap<String, Entry>;

#[derive(Debug, PartialEq, Clone)]
pub enum Entry {
    Number(i64),
    String(String),
    TextMap(Box<LvmTextMap>),
    List(Box<Vec<Entry>>),
}

pub trait TextMapOps {
    fn i64_from_textmap(&self, name: &str) -> Option<i64>;
    fn u64_from_textmap(&self, name: &str) -> Option<u64>;
    fn string_from_textmap(&self, name: &str) -> Option<&str>;
    fn textmap_from_textmap(&self, name: &str) -> Option<&LvmTextMap>;
    fn list_from_textmap(&self, name: &str) -> Option<&Vec<Entry>>;
    fn string_list_from_textmap(&self, name: &str) -> Option<Vec<String>>;
}

impl TextMapOps for LvmTextMap {
    fn i64_from_textmap(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(&Entry::Number(x)) => Some(x),
            _ => None,
        }
    }
    fn u64_from_textmap(&self, name: &str) -> Option<u64> {
        self.i64_from_textmap(name).map(|x| x as u64)
    }
    fn string_from_textmap(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(&Entry::String(ref x)) => Some(x),
            _ => None,
        }
    }
    fn textmap_from_textmap(&self, name: &str) -> Option<&LvmTextMap> {
        match self.get(name) {
            Some(&Entry::TextMap(ref x)) => Some(x),
            _ => None,
        }
    }
    fn list_from_textmap(&self, name: &str) -> Option<&Vec<Entry>> {
        match self.get(name) {
            Some(&Entry::List(ref x)) => Some(x),
            _ => None,
        }
    }
    fn string_list_from_textmap(&self, name: &str) -> Option<Vec<String>> {
        self.list_from_textmap(name).map(|list| {
            list.iter()
                .filter_map(|item| match item {
                    Entry::String(ref x) => Some(x.clone()),
                    _ => None,
                })
                .collect()
        })
    }
}

// Cursor over the input bytes. Every parse method leaves the cursor
// just past what it consumed; errors report the byte offset.
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Scanner<'a> {
        Scanner { buf, pos: 0 }
    }

    fn fail(&self, what: &str) -> Error {
        Error::Parse(format!("{} at byte {}", what, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    // Whitespace, NUL padding, and `#` comments to end of line.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' | b'\0' => {
                    self.pos += 1;
                }
                b'#' => {
                    while let Some(c) = self.bump() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn is_ident_byte(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-'
    }

    // Keys may contain letters, digits, `_`, `.` and `-`, and may lead
    // with a digit ("pv0" sections are often named "0", "1", ...).
    fn take_key(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if Self::is_ident_byte(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.fail("expected a key"));
        }
        Ok(String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned())
    }

    fn take_string(&mut self) -> Result<String> {
        if self.bump() != Some(b'"') {
            return Err(self.fail("expected an opening quote"));
        }
        let start = self.pos;
        while let Some(c) = self.bump() {
            if c == b'"' {
                return Ok(String::from_utf8_lossy(&self.buf[start..self.pos - 1]).into_owned());
            }
        }
        Err(self.fail("unterminated string"))
    }

    fn take_number(&mut self) -> Result<i64> {
        let negative = if self.peek() == Some(b'-') {
            self.pos += 1;
            true
        } else {
            false
        };

        let mut val: i64 = 0;
        let mut digits = 0;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            self.pos += 1;
            digits += 1;
            val = val
                .checked_mul(10)
                .and_then(|v| v.checked_add((c - b'0') as i64))
                .ok_or_else(|| self.fail("number out of range"))?;
        }
        if digits == 0 {
            return Err(self.fail("expected a number"));
        }
        Ok(if negative { -val } else { val })
    }

    fn take_scalar(&mut self) -> Result<Entry> {
        match self.peek() {
            Some(b'"') => Ok(Entry::String(self.take_string()?)),
            Some(c) if c == b'-' || c.is_ascii_digit() => Ok(Entry::Number(self.take_number()?)),
            _ => Err(self.fail("expected a string or number")),
        }
    }

    // `[` has not been consumed yet; lists hold only scalars.
    fn take_list(&mut self) -> Result<Vec<Entry>> {
        if self.bump() != Some(b'[') {
            return Err(self.fail("expected '['"));
        }
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(b']') => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(_) => items.push(self.take_scalar()?),
                None => return Err(self.fail("unterminated list")),
            }
        }
    }

    // The right-hand side of `key =`.
    fn take_value(&mut self) -> Result<Entry> {
        self.skip_trivia();
        match self.peek() {
            Some(b'[') => Ok(Entry::List(Box::new(self.take_list()?))),
            _ => self.take_scalar(),
        }
    }

    // Key/value pairs up to a closing brace (inside a section, which is
    // consumed) or to the end of input (top level).
    fn take_body(&mut self, in_section: bool) -> Result<LvmTextMap> {
        let mut map = LvmTextMap::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None if in_section => return Err(self.fail("unterminated section")),
                None => return Ok(map),
                Some(b'}') if in_section => {
                    self.pos += 1;
                    return Ok(map);
                }
                Some(b'}') => return Err(self.fail("unmatched '}'")),
                Some(_) => {}
            }

            let key = self.take_key()?;
            self.skip_trivia();
            match self.bump() {
                Some(b'=') => {
                    map.insert(key, self.take_value()?);
                }
                Some(b'{') => {
                    map.insert(key, Entry::TextMap(Box::new(self.take_body(true)?)));
                }
                _ => return Err(self.fail("expected '=' or '{' after a key")),
            }
        }
    }
}

pub fn buf_to_textmap(buf: &[u8]) -> Result<LvmTextMap> {
    Scanner::new(buf).take_body(false)
}

// status may be either a single string or a list of strings
pub fn status_from_textmap(map: &LvmTextMap) -> Result<Vec<String>> {
    match map.get("status") {
        Some(Entry::String(x)) => Ok(vec![x.clone()]),
        Some(Entry::List(_)) => map
            .string_list_from_textmap("status")
            .ok_or_else(|| Error::Parse("status list is malformed".into())),
        _ => Err(Error::Parse("status missing or malformed".into())),
    }
}

pub fn textmap_to_buf(tm: &LvmTextMap) -> Vec<u8> {
    let mut out = Vec::new();
    write_body(tm, 0, &mut out);
    out
}

fn push_indent(out: &mut Vec<u8>, depth: usize) {
    for _ in 0..depth {
        out.push(b'\t');
    }
}

fn push_scalar(entry: &Entry, out: &mut Vec<u8>) {
    match entry {
        Entry::Number(n) => out.extend(n.to_string().into_bytes()),
        Entry::String(s) => {
            out.push(b'"');
            out.extend(s.as_bytes());
            out.push(b'"');
        }
        _ => unreachable!("lists and sections are not scalars"),
    }
}

fn write_body(tm: &LvmTextMap, depth: usize, out: &mut Vec<u8>) {
    for (key, entry) in tm {
        push_indent(out, depth);
        out.extend(key.as_bytes());
        match entry {
            Entry::TextMap(section) => {
                out.extend(b" {\n");
                write_body(section, depth + 1, out);
                push_indent(out, depth);
                out.extend(b"}\n");
            }
            Entry::List(items) => {
                out.extend(b" = [");
                for (i, item) in items.iter().enumerate() {
                    if i != 0 {
                        out.extend(b", ");
                    }
                    push_scalar(item, out);
                }
                out.extend(b"]\n");
            }
            scalar => {
                out.extend(b" = ");
                push_scalar(scalar, out);
                out.push(b'\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_and_sections() {
        let buf = b"
vg0 {
id = \"abcdef\"
seqno = 8
status = [\"READ\", \"WRITE\"]
physical_volumes {
pv0 {
pe_count = 100
}
}
}
";
        let tm = buf_to_textmap(buf).unwrap();
        let vg = tm.textmap_from_textmap("vg0").unwrap();
        assert_eq!(vg.i64_from_textmap("seqno"), Some(8));
        assert_eq!(
            status_from_textmap(vg).unwrap(),
            vec!["READ".to_string(), "WRITE".to_string()]
        );
        let pvs = vg.textmap_from_textmap("physical_volumes").unwrap();
        assert_eq!(
            pvs.textmap_from_textmap("pv0")
                .unwrap()
                .u64_from_textmap("pe_count"),
            Some(100)
        );
    }

    #[test]
    fn keys_may_lead_with_digits() {
        let tm = buf_to_textmap(b"outer {\n0 = 1\n1a = 2\n}\n").unwrap();
        let outer = tm.textmap_from_textmap("outer").unwrap();
        assert_eq!(outer.i64_from_textmap("0"), Some(1));
        assert_eq!(outer.i64_from_textmap("1a"), Some(2));
    }

    #[test]
    fn stray_bytes_fail_with_an_offset() {
        match buf_to_textmap(b"ok = 1\n% = 2\n") {
            Err(Error::Parse(msg)) => assert!(msg.contains("byte 7"), "{}", msg),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn comments_and_nul_padding_are_skipped() {
        let buf = b"# leading comment\nseqno = 3 # trailing\n\0\0";
        let tm = buf_to_textmap(buf).unwrap();
        assert_eq!(tm.i64_from_textmap("seqno"), Some(3));
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn negative_numbers_parse() {
        let tm = buf_to_textmap(b"major = -1\n").unwrap();
        assert_eq!(tm.i64_from_textmap("major"), Some(-1));
    }

    #[test]
    fn number_overflow_is_an_error() {
        assert!(buf_to_textmap(b"a = 99999999999999999999999\n").is_err());
    }

    #[test]
    fn truncated_input_fails() {
        assert!(buf_to_textmap(b"a {\nb = 1\n").is_err());
        assert!(buf_to_textmap(b"a = \"no closing quote\n").is_err());
        assert!(buf_to_textmap(b"a = [1, 2\n").is_err());
        assert!(buf_to_textmap(b"a = \n").is_err());
        assert!(buf_to_textmap(b"}\n").is_err());
    }

    #[test]
    fn lists_hold_mixed_scalars() {
        let tm = buf_to_textmap(b"stripes = [\"pv0\", 0, \"pv1\", 128]\n").unwrap();
        let list = tm.list_from_textmap("stripes").unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[1], Entry::Number(0));
        assert_eq!(list[2], Entry::String("pv1".to_string()));
    }

    #[test]
    fn serializer_output_is_indented() {
        let mut inner = LvmTextMap::new();
        inner.insert("e".to_string(), Entry::Number(5));
        let mut tm = LvmTextMap::new();
        tm.insert("a".to_string(), Entry::Number(1));
        tm.insert("d".to_string(), Entry::TextMap(Box::new(inner)));

        let out = textmap_to_buf(&tm);
        assert_eq!(&out[..], &b"a = 1\nd {\n\te = 5\n}\n"[..]);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let buf = b"a = 1\nb = \"two\"\nc = [\"x\", 9]\nd {\ne = 5\nf {\ng = \"deep\"\n}\n}\n";
        let tm = buf_to_textmap(buf).unwrap();
        let out = textmap_to_buf(&tm);
        let tm2 = buf_to_textmap(&out).unwrap();
        assert_eq!(tm, tm2);
    }
}
