// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Runtime configuration.
//!
//! There is no process-wide mutable state: every component takes a
//! `RuntimeConfig` reference. The daemon carries one instance, each
//! command carries another. The config file uses the same text language
//! as the on-disk metadata and is parsed with `parser`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::parser::{buf_to_textmap, TextMapOps};
use crate::Result;

const DEFAULT_SYSTEM_DIR: &str = "/etc/lvm";
const DEFAULT_RUN_DIR: &str = "/run/lvm";
const DEFAULT_DEV_DIR: &str = "/dev";
const CONF_NAME: &str = "lvm.conf";

/// Default cap on concurrently outstanding scanner reads.
const DEFAULT_SCAN_EVENTS: usize = 16;

/// Times the client library repeats a lock request after EAGAIN.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the host's config tree ($LVM_SYSTEM_DIR).
    pub system_dir: PathBuf,
    /// Directory scanned for block devices.
    pub dev_dir: PathBuf,
    /// Lock daemon socket path ($LVMLOCKD_SOCKET).
    pub lockd_socket: PathBuf,
    /// Lock daemon pid file.
    pub lockd_pidfile: PathBuf,
    /// Adopt table written across daemon restarts.
    pub adopt_file: PathBuf,

    /// Outstanding-read budget for the scanner; 0 forces sequential reads.
    pub scan_events: usize,
    /// Lock request retries after EAGAIN.
    pub max_lock_retries: u32,
    /// This host's id for sanlock/idm lease ownership.
    pub host_id: u32,
    /// Run the lock daemon without a live lock manager backend.
    pub daemon_test: bool,
    /// Seconds of lease I/O tolerance for the sanlock lock type.
    pub sanlock_io_timeout: u32,
    /// Directory holding file-lease lockspaces for the built-in manager.
    pub lease_dir: PathBuf,
    /// Shell command run by the helper thread when a VG loses its
    /// leases; "%vg" expands to the VG name.
    pub fence_command: Option<String>,
    /// Command profile name ($LVM_COMMAND_PROFILE).
    pub command_profile: Option<String>,
    /// Log correlation epoch ($LVM_LOG_FILE_EPOCH).
    pub log_epoch: Option<String>,
    /// Set when invoked by the monitoring daemon.
    pub run_by_dmeventd: bool,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            system_dir: PathBuf::from(DEFAULT_SYSTEM_DIR),
            dev_dir: PathBuf::from(DEFAULT_DEV_DIR),
            lockd_socket: PathBuf::from(DEFAULT_RUN_DIR).join("lvmlockd.socket"),
            lockd_pidfile: PathBuf::from(DEFAULT_RUN_DIR).join("lvmlockd.pid"),
            adopt_file: PathBuf::from(DEFAULT_RUN_DIR).join("lvmlockd.adopt"),
            scan_events: DEFAULT_SCAN_EVENTS,
            max_lock_retries: DEFAULT_MAX_RETRIES,
            host_id: 0,
            daemon_test: false,
            sanlock_io_timeout: 10,
            lease_dir: PathBuf::from("/run/lock/lvm"),
            fence_command: None,
            command_profile: None,
            log_epoch: None,
            run_by_dmeventd: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, overridden by the config file, overridden by environment.
    pub fn load() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();

        if let Ok(dir) = env::var("LVM_SYSTEM_DIR") {
            config.system_dir = PathBuf::from(dir);
        }

        let conf_path = config.system_dir.join(CONF_NAME);
        if conf_path.exists() {
            if let Err(e) = config.apply_file(&conf_path) {
                warn!("ignoring unreadable {}: {}", conf_path.display(), e);
            }
        }

        if let Ok(sock) = env::var("LVMLOCKD_SOCKET") {
            config.lockd_socket = PathBuf::from(sock);
        }
        if let Ok(profile) = env::var("LVM_COMMAND_PROFILE") {
            config.command_profile = Some(profile);
        }
        if let Ok(epoch) = env::var("LVM_LOG_FILE_EPOCH") {
            config.log_epoch = Some(epoch);
        }
        if env::var_os("LVM_RUN_BY_DMEVENTD").is_some() {
            config.run_by_dmeventd = true;
        }

        config
    }

    /// Merge settings from an lvm.conf-style file.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let buf = fs::read(path)?;
        let map = buf_to_textmap(&buf)?;

        if let Some(devices) = map.textmap_from_textmap("devices") {
            if let Some(dir) = devices.string_from_textmap("dir") {
                self.dev_dir = PathBuf::from(dir);
            }
            if let Some(events) = devices.u64_from_textmap("scan_async_events") {
                self.scan_events = events as usize;
            }
        }

        if let Some(global) = map.textmap_from_textmap("global") {
            if let Some(retries) = global.u64_from_textmap("lvmlockd_lock_retries") {
                self.max_lock_retries = retries as u32;
            }
            if let Some(timeout) = global.u64_from_textmap("sanlock_io_timeout") {
                self.sanlock_io_timeout = timeout as u32;
            }
            if let Some(command) = global.string_from_textmap("fence_command") {
                self.fence_command = Some(command.to_string());
            }
        }

        if let Some(local) = map.textmap_from_textmap("local") {
            if let Some(host_id) = local.u64_from_textmap("host_id") {
                self.host_id = host_id as u32;
            }
        }

        debug!("applied config from {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lvm.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(
            b"devices {\ndir = \"/dev/other\"\nscan_async_events = 4\n}\nlocal {\nhost_id = 3\n}\n",
        )
        .unwrap();

        let mut config = RuntimeConfig::default();
        config.apply_file(&path).unwrap();
        assert_eq!(config.dev_dir, PathBuf::from("/dev/other"));
        assert_eq!(config.scan_events, 4);
        assert_eq!(config.host_id, 3);
    }
}
