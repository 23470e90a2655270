// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device controller seam.
//!
//! Loading device-mapper tables is outside the core; commands hand an
//! implementation of `DeviceController` to the metadata store, which
//! calls it to reactivate LVs from the committed copy when a commit
//! fails mid-way.

use log::debug;

use crate::lv::LV;
use crate::vg::VG;
use crate::Result;

pub trait DeviceController {
    fn activate(&self, vg: &VG, lv: &LV) -> Result<()>;
    fn deactivate(&self, vg: &VG, lv_name: &str) -> Result<()>;
    fn suspend(&self, vg: &VG, lv_name: &str) -> Result<()>;
    fn resume(&self, vg: &VG, lv_name: &str) -> Result<()>;
}

/// Controller that records intent in the log and succeeds. Used by
/// commands running without an activation backend and by tests.
#[derive(Debug, Default)]
pub struct NoopController;

impl DeviceController for NoopController {
    fn activate(&self, vg: &VG, lv: &LV) -> Result<()> {
        debug!("activate {}/{}", vg.name, lv.name);
        Ok(())
    }

    fn deactivate(&self, vg: &VG, lv_name: &str) -> Result<()> {
        debug!("deactivate {}/{}", vg.name, lv_name);
        Ok(())
    }

    fn suspend(&self, vg: &VG, lv_name: &str) -> Result<()> {
        debug!("suspend {}/{}", vg.name, lv_name);
        Ok(())
    }

    fn resume(&self, vg: &VG, lv_name: &str) -> Result<()> {
        debug!("resume {}/{}", vg.name, lv_name);
        Ok(())
    }
}
