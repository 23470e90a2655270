// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Host-local command locking for VGs that have no shared lock type.
//! The daemon is not involved; concurrent tool invocations on one host
//! serialize through flock files.

use std::borrow::Cow;
use std::fs::{create_dir_all, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

use crate::config::RuntimeConfig;
use crate::Result;

pub struct Flock {
    _locked_file: File,
}

pub enum LockScope {
    Global,
    Vg(String),
}

impl Flock {
    pub fn lock_exclusive(config: &RuntimeConfig, scope: LockScope) -> Result<Flock> {
        Self::lock(config, scope, FlockArg::LockExclusive)
    }

    pub fn lock_shared(config: &RuntimeConfig, scope: LockScope) -> Result<Flock> {
        Self::lock(config, scope, FlockArg::LockShared)
    }

    fn lock(config: &RuntimeConfig, scope: LockScope, lock_type: FlockArg) -> Result<Flock> {
        let mut pathbuf: PathBuf = config.lease_dir.clone();
        let filename: Cow<Path> = match scope {
            LockScope::Global => Cow::Borrowed(Path::new("P_global")),
            LockScope::Vg(name) => Cow::Owned(PathBuf::from(format!("V_{}", name))),
        };
        create_dir_all(&pathbuf)?;
        pathbuf.push(filename);

        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&pathbuf)?;
        flock(f.as_raw_fd(), lock_type)?;
        Ok(Flock { _locked_file: f })
    }

    // When the file is closed the lock is released.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vg_scope_locks_are_exclusive_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.lease_dir = dir.path().to_owned();

        let a = Flock::lock_exclusive(&config, LockScope::Vg("vg0".to_string())).unwrap();
        // a different VG's lock does not conflict
        let _b = Flock::lock_exclusive(&config, LockScope::Vg("vg1".to_string())).unwrap();
        drop(a);
        let _c = Flock::lock_exclusive(&config, LockScope::Vg("vg0".to_string())).unwrap();
    }
}
