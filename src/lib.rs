// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Malvin: an LVM-style volume manager core.
//!
//! The crate covers the on-disk metadata engine (labels, metadata
//! areas, the text format, the VG object model) and the cluster lock
//! manager that coordinates concurrent access to shared VGs. Kernel
//! device-mapper wiring stays behind the `devctl::DeviceController`
//! seam.

pub mod allocation;
pub mod cmd;
pub mod config;
pub mod convert;
pub mod devctl;
pub mod flock;
pub mod lockd;
pub mod lv;
pub mod metadata;
pub mod parser;
pub mod pv;
pub mod pvlabel;
pub mod scan;
pub mod vg;
mod error;
mod util;

pub use error::{Error, LockError, MetadataError, Result};
pub use util::{align_to, crc32_calc, hyphenate_uuid, make_uuid};
