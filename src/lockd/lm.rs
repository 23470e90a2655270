// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock manager backends.
//!
//! The daemon talks to a backend through the `LockManager` trait. The
//! lock-manager types dlm/sanlock/idm are carried end-to-end in the
//! protocol and lockspace naming; this crate ships a file-lease manager
//! (flock-based, with persisted value blocks and orphan records) and an
//! in-memory manager used in daemon-test mode. Binding the trait to the
//! kernel DLM or the sanlock/idm libraries is a linking concern outside
//! the crate.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use log::{debug, warn};
use nix::fcntl::{flock, FlockArg};

use super::{LockMode, ValBlk, LS_NAME_GL, LS_PREFIX};
use crate::config::RuntimeConfig;
use crate::error::LockError;

pub type LmResult<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LmType {
    None,
    Dlm,
    Sanlock,
    Idm,
}

impl LmType {
    pub fn as_str(self) -> &'static str {
        match self {
            LmType::None => "none",
            LmType::Dlm => "dlm",
            LmType::Sanlock => "sanlock",
            LmType::Idm => "idm",
        }
    }

    pub fn parse(s: &str) -> Option<LmType> {
        Some(match s {
            "none" => LmType::None,
            "dlm" => LmType::Dlm,
            "sanlock" => LmType::Sanlock,
            "idm" => LmType::Idm,
            _ => return None,
        })
    }

    /// Where the global lock preferentially lives: dlm beats sanlock
    /// beats idm.
    pub fn gl_rank(self) -> u32 {
        match self {
            LmType::Dlm => 3,
            LmType::Sanlock => 2,
            LmType::Idm => 1,
            LmType::None => 0,
        }
    }

    /// dlm and idm use one shared global lockspace; sanlock keeps the
    /// GL inside a VG lockspace.
    pub fn uses_global_lockspace(self) -> bool {
        matches!(self, LmType::Dlm | LmType::Idm)
    }
}

/// The backend-native lockspace name for a VG.
pub fn lockspace_name(lm_type: LmType, vg_name: &str) -> String {
    let _ = lm_type;
    format!("{}{}", LS_PREFIX, vg_name)
}

pub fn global_lockspace_name() -> String {
    LS_NAME_GL.to_string()
}

/// A lock left behind by a previous daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanLock {
    pub resource: String,
    pub mode: LockMode,
}

pub trait LockManager: Send {
    fn lm_type(&self) -> LmType;

    fn add_lockspace(&mut self, ls_name: &str, host_id: u32) -> LmResult<()>;
    fn rem_lockspace(&mut self, ls_name: &str, free_vg: bool) -> LmResult<()>;

    /// Locks left behind by a prior instance of this daemon.
    fn get_orphans(&mut self, ls_name: &str) -> LmResult<Vec<OrphanLock>>;

    /// Acquire `mode` on a resource; returns the transported value
    /// block, if the resource carries one.
    fn lock(
        &mut self,
        ls_name: &str,
        res_name: &str,
        mode: LockMode,
        nowait: bool,
        persistent: bool,
    ) -> LmResult<Option<ValBlk>>;

    /// Change the mode of a held lock.
    fn convert(
        &mut self,
        ls_name: &str,
        res_name: &str,
        mode: LockMode,
        nowait: bool,
    ) -> LmResult<Option<ValBlk>>;

    /// Release a held lock, writing the value block back first when the
    /// holder had it exclusively.
    fn unlock(&mut self, ls_name: &str, res_name: &str, vb: Option<ValBlk>) -> LmResult<()>;

    fn is_running(&self) -> bool;
}

/// Build the configured manager for one lockspace.
pub fn make_lock_manager(lm_type: LmType, config: &RuntimeConfig) -> Box<dyn LockManager> {
    if config.daemon_test {
        Box::new(MemoryLm::new(lm_type))
    } else {
        Box::new(FileLm::new(lm_type, config.lease_dir.clone()))
    }
}

/// In-memory manager: every request is granted; value blocks live in a
/// map. Used when the daemon runs without a live lock manager
/// (daemon-test mode); cross-host arbitration is the daemon's resource
/// table in that case.
pub struct MemoryLm {
    lm_type: LmType,
    lockspaces: HashMap<String, HashMap<String, Option<ValBlk>>>,
}

impl MemoryLm {
    pub fn new(lm_type: LmType) -> MemoryLm {
        MemoryLm {
            lm_type,
            lockspaces: HashMap::new(),
        }
    }
}

impl LockManager for MemoryLm {
    fn lm_type(&self) -> LmType {
        self.lm_type
    }

    fn add_lockspace(&mut self, ls_name: &str, _host_id: u32) -> LmResult<()> {
        self.lockspaces.entry(ls_name.to_string()).or_default();
        Ok(())
    }

    fn rem_lockspace(&mut self, ls_name: &str, free_vg: bool) -> LmResult<()> {
        if free_vg {
            self.lockspaces.remove(ls_name);
        }
        Ok(())
    }

    fn get_orphans(&mut self, _ls_name: &str) -> LmResult<Vec<OrphanLock>> {
        Ok(Vec::new())
    }

    fn lock(
        &mut self,
        ls_name: &str,
        res_name: &str,
        _mode: LockMode,
        _nowait: bool,
        _persistent: bool,
    ) -> LmResult<Option<ValBlk>> {
        let ls = self
            .lockspaces
            .get_mut(ls_name)
            .ok_or(LockError::NoLockspace)?;
        Ok(ls.entry(res_name.to_string()).or_insert(None).clone())
    }

    fn convert(
        &mut self,
        ls_name: &str,
        res_name: &str,
        _mode: LockMode,
        _nowait: bool,
    ) -> LmResult<Option<ValBlk>> {
        let ls = self
            .lockspaces
            .get_mut(ls_name)
            .ok_or(LockError::NoLockspace)?;
        Ok(ls.entry(res_name.to_string()).or_insert(None).clone())
    }

    fn unlock(&mut self, ls_name: &str, res_name: &str, vb: Option<ValBlk>) -> LmResult<()> {
        let ls = self
            .lockspaces
            .get_mut(ls_name)
            .ok_or(LockError::NoLockspace)?;
        if let Some(vb) = vb {
            ls.insert(res_name.to_string(), Some(vb));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }
}

/// flock-based lease manager. One directory per lockspace, one lease
/// file per resource carrying the 8-byte value block; persistent locks
/// are recorded in an orphans file so a restarted daemon can re-adopt
/// them.
pub struct FileLm {
    lm_type: LmType,
    base_dir: PathBuf,
    held: HashMap<(String, String), File>,
}

impl FileLm {
    pub fn new(lm_type: LmType, base_dir: PathBuf) -> FileLm {
        FileLm {
            lm_type,
            base_dir,
            held: HashMap::new(),
        }
    }

    fn ls_dir(&self, ls_name: &str) -> PathBuf {
        self.base_dir.join(ls_name)
    }

    fn lease_path(&self, ls_name: &str, res_name: &str) -> PathBuf {
        self.ls_dir(ls_name).join(format!("r_{}", res_name))
    }

    fn orphans_path(&self, ls_name: &str) -> PathBuf {
        self.ls_dir(ls_name).join("orphans")
    }

    fn flock_mode(mode: LockMode, nowait: bool) -> FlockArg {
        match (mode, nowait) {
            (LockMode::Ex, false) => FlockArg::LockExclusive,
            (LockMode::Ex, true) => FlockArg::LockExclusiveNonblock,
            (_, false) => FlockArg::LockShared,
            (_, true) => FlockArg::LockSharedNonblock,
        }
    }

    fn read_vb(file: &mut File) -> Option<ValBlk> {
        let mut buf = [0u8; 8];
        file.seek(SeekFrom::Start(0)).ok()?;
        match file.read_exact(&mut buf) {
            Ok(()) => ValBlk::from_bytes(&buf),
            Err(_) => None,
        }
    }

    fn write_vb(file: &mut File, vb: &ValBlk) -> LmResult<()> {
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&vb.to_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|_| LockError::LockIo)
    }

    fn record_orphan(&self, ls_name: &str, res_name: &str, mode: LockMode) -> LmResult<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.orphans_path(ls_name))
            .map_err(|_| LockError::LockIo)?;
        writeln!(f, "{} {}", res_name, mode.as_str()).map_err(|_| LockError::LockIo)
    }

    fn drop_orphan(&self, ls_name: &str, res_name: &str) {
        let path = self.orphans_path(ls_name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return,
        };
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| line.split_whitespace().next() != Some(res_name))
            .collect();
        let _ = fs::write(&path, kept.join("\n") + "\n");
    }
}

impl LockManager for FileLm {
    fn lm_type(&self) -> LmType {
        self.lm_type
    }

    fn add_lockspace(&mut self, ls_name: &str, _host_id: u32) -> LmResult<()> {
        fs::create_dir_all(self.ls_dir(ls_name)).map_err(|e| {
            warn!("cannot create lockspace dir {}: {}", ls_name, e);
            LockError::Prepare
        })
    }

    fn rem_lockspace(&mut self, ls_name: &str, free_vg: bool) -> LmResult<()> {
        self.held.retain(|(ls, _), _| ls != ls_name);
        if free_vg {
            let _ = fs::remove_dir_all(self.ls_dir(ls_name));
        }
        Ok(())
    }

    fn get_orphans(&mut self, ls_name: &str) -> LmResult<Vec<OrphanLock>> {
        let content = match fs::read_to_string(self.orphans_path(ls_name)) {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };
        let mut orphans = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(res), Some(mode)) = (fields.next(), fields.next()) {
                if let Some(mode) = LockMode::parse(mode) {
                    orphans.push(OrphanLock {
                        resource: res.to_string(),
                        mode,
                    });
                }
            }
        }
        Ok(orphans)
    }

    fn lock(
        &mut self,
        ls_name: &str,
        res_name: &str,
        mode: LockMode,
        nowait: bool,
        persistent: bool,
    ) -> LmResult<Option<ValBlk>> {
        let key = (ls_name.to_string(), res_name.to_string());
        if self.held.contains_key(&key) {
            return self.convert(ls_name, res_name, mode, nowait);
        }

        let path = self.lease_path(ls_name, res_name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|_| LockError::LockIo)?;

        match flock(file.as_raw_fd(), Self::flock_mode(mode, nowait)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => return Err(LockError::Again),
            Err(_) => return Err(LockError::LmErr),
        }

        let vb = Self::read_vb(&mut file);
        if persistent {
            self.record_orphan(ls_name, res_name, mode)?;
        }
        self.held.insert(key, file);
        debug!("{}: locked {} {}", ls_name, res_name, mode.as_str());
        Ok(vb)
    }

    fn convert(
        &mut self,
        ls_name: &str,
        res_name: &str,
        mode: LockMode,
        nowait: bool,
    ) -> LmResult<Option<ValBlk>> {
        let key = (ls_name.to_string(), res_name.to_string());
        let file = self.held.get_mut(&key).ok_or(LockError::LmErr)?;

        match flock(file.as_raw_fd(), Self::flock_mode(mode, nowait)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => return Err(LockError::Again),
            Err(_) => return Err(LockError::LmErr),
        }
        Ok(Self::read_vb(file))
    }

    fn unlock(&mut self, ls_name: &str, res_name: &str, vb: Option<ValBlk>) -> LmResult<()> {
        let key = (ls_name.to_string(), res_name.to_string());
        let mut file = match self.held.remove(&key) {
            Some(f) => f,
            None => return Ok(()),
        };
        if let Some(vb) = vb {
            Self::write_vb(&mut file, &vb)?;
        }
        self.drop_orphan(ls_name, res_name);
        // closing the file releases the flock
        drop(file);
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lm_type_round_trips() {
        for t in [LmType::None, LmType::Dlm, LmType::Sanlock, LmType::Idm] {
            assert_eq!(LmType::parse(t.as_str()), Some(t));
        }
        assert_eq!(LmType::parse("clvm"), None);
    }

    #[test]
    fn gl_preference_order() {
        assert!(LmType::Dlm.gl_rank() > LmType::Sanlock.gl_rank());
        assert!(LmType::Sanlock.gl_rank() > LmType::Idm.gl_rank());
    }

    #[test]
    fn file_lm_lock_and_vb_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = FileLm::new(LmType::Sanlock, dir.path().to_owned());
        lm.add_lockspace("lvm_vg0", 1).unwrap();

        let vb = lm.lock("lvm_vg0", "VGLK", LockMode::Ex, true, false).unwrap();
        assert_eq!(vb, None);
        lm.unlock("lvm_vg0", "VGLK", Some(ValBlk::new(8))).unwrap();

        let vb = lm.lock("lvm_vg0", "VGLK", LockMode::Sh, true, false).unwrap();
        assert_eq!(vb.map(|v| v.r_version), Some(8));
        lm.unlock("lvm_vg0", "VGLK", None).unwrap();
    }

    #[test]
    fn file_lm_orphans_survive_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = FileLm::new(LmType::Sanlock, dir.path().to_owned());
        lm.add_lockspace("lvm_vg0", 1).unwrap();
        lm.lock("lvm_vg0", "lv1", LockMode::Ex, true, true).unwrap();
        drop(lm);

        // a new instance (daemon restart) sees the orphan
        let mut lm = FileLm::new(LmType::Sanlock, dir.path().to_owned());
        lm.add_lockspace("lvm_vg0", 1).unwrap();
        let orphans = lm.get_orphans("lvm_vg0").unwrap();
        assert_eq!(
            orphans,
            vec![OrphanLock {
                resource: "lv1".to_string(),
                mode: LockMode::Ex,
            }]
        );

        // re-adopting and releasing clears the record
        lm.lock("lvm_vg0", "lv1", LockMode::Ex, true, true).unwrap();
        lm.unlock("lvm_vg0", "lv1", None).unwrap();
        assert!(lm.get_orphans("lvm_vg0").unwrap().is_empty());
    }

    #[test]
    fn memory_lm_keeps_vb() {
        let mut lm = MemoryLm::new(LmType::Dlm);
        lm.add_lockspace("lvm_vg0", 1).unwrap();
        assert_eq!(
            lm.lock("lvm_vg0", "VGLK", LockMode::Ex, false, false).unwrap(),
            None
        );
        lm.unlock("lvm_vg0", "VGLK", Some(ValBlk::new(3))).unwrap();
        assert_eq!(
            lm.lock("lvm_vg0", "VGLK", LockMode::Ex, false, false)
                .unwrap()
                .map(|v| v.r_version),
            Some(3)
        );
    }
}
