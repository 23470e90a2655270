// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-tool lock client.
//!
//! Commands get a synchronous, typed API over the daemon socket; the
//! daemon ties lock state to the connection, so a client keeps its
//! stream open for the lifetime of the operation.

use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use log::debug;

use super::lm::LmType;
use super::{
    map_put_num, map_put_str, read_frame, request_map, write_frame, LockMode, AF_NOWAIT,
};
use crate::config::RuntimeConfig;
use crate::error::LockError;
use crate::parser::{LvmTextMap, TextMapOps};
use crate::{Error, Result};

const RETRY_DELAY_MS: u64 = 100;

/// Grant details returned with a successful lock request.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockResult {
    /// Value-block version; a change invalidates cached metadata.
    pub r_version: Option<u32>,
    pub result_flags: u32,
}

pub struct LockdClient {
    stream: UnixStream,
    max_retries: u32,
}

impl LockdClient {
    /// Connect and say hello.
    pub fn connect(config: &RuntimeConfig) -> Result<LockdClient> {
        let stream = UnixStream::connect(&config.lockd_socket)?;
        let mut client = LockdClient {
            stream,
            max_retries: config.max_lock_retries,
        };
        let reply = client.roundtrip(request_map("hello"))?;
        if reply.string_from_textmap("protocol") != Some(super::PROTOCOL) {
            return Err(Error::Parse("unexpected daemon protocol".into()));
        }
        Ok(client)
    }

    fn roundtrip(&mut self, mut request: LvmTextMap) -> Result<LvmTextMap> {
        map_put_num(&mut request, "pid", std::process::id() as i64);
        write_frame(&mut self.stream, &request)?;
        let reply = read_frame(&mut self.stream)?
            .ok_or_else(|| Error::Parse("daemon closed the connection".into()))?;

        let result = reply.i64_from_textmap("result").unwrap_or(0);
        if result < 0 {
            let err = LockError::from_code(-result as i32).unwrap_or(LockError::Lockd);
            return Err(Error::Lock(err));
        }
        Ok(reply)
    }

    fn lock_result(reply: &LvmTextMap) -> LockResult {
        LockResult {
            r_version: reply.u64_from_textmap("r_version").map(|v| v as u32),
            result_flags: reply.u64_from_textmap("result_flags").unwrap_or(0) as u32,
        }
    }

    // Lock requests retry on EAGAIN up to the configured bound, unless
    // the caller asked for NOWAIT.
    fn lock_request(&mut self, request: LvmTextMap, flags: u32) -> Result<LockResult> {
        let mut attempts = 0;
        loop {
            match self.roundtrip(request.clone()) {
                Ok(reply) => return Ok(Self::lock_result(&reply)),
                Err(Error::Lock(LockError::Again))
                    if flags & AF_NOWAIT == 0 && attempts < self.max_retries =>
                {
                    attempts += 1;
                    debug!("lock conflict, retry {}/{}", attempts, self.max_retries);
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn quit(mut self) {
        let _ = self.roundtrip(request_map("quit"));
    }

    /// Initialize lockspace backing storage for a VG. Returns the
    /// vg_args blob recorded in the VG metadata.
    pub fn init_vg(&mut self, vg_name: &str, vg_uuid: &str, lm_type: LmType, gl: bool) -> Result<String> {
        let mut request = request_map("init_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "vg_uuid", vg_uuid);
        let mut args = format!("{}:1.0.0", lm_type.as_str());
        if gl {
            args.push_str(":gl");
        }
        map_put_str(&mut request, "vg_args", &args);
        let reply = self.roundtrip(request)?;
        Ok(reply
            .string_from_textmap("vg_args")
            .unwrap_or(&args)
            .to_string())
    }

    pub fn free_vg(&mut self, vg_name: &str, vg_args: &str) -> Result<()> {
        let mut request = request_map("free_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "vg_args", vg_args);
        self.roundtrip(request).map(|_| ())
    }

    /// Join a VG's lockspace. The reply arrives when the join finishes
    /// (or immediately if the lockspace already runs).
    pub fn start_vg(
        &mut self,
        vg_name: &str,
        vg_uuid: &str,
        vg_args: &str,
        host_id: u32,
        flags: u32,
    ) -> Result<()> {
        let mut request = request_map("start_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "vg_uuid", vg_uuid);
        map_put_str(&mut request, "vg_args", vg_args);
        map_put_num(&mut request, "host_id", host_id as i64);
        map_put_num(&mut request, "flags", flags as i64);
        self.roundtrip(request).map(|_| ())
    }

    pub fn stop_vg(&mut self, vg_name: &str) -> Result<()> {
        let mut request = request_map("stop_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        self.roundtrip(request).map(|_| ())
    }

    /// Wait for a lockspace join, up to `timeout` seconds. `ETIMEDOUT`
    /// leaves the join running in the background.
    pub fn start_wait(&mut self, vg_name: &str, timeout: u64) -> Result<()> {
        let mut request = request_map("start_wait");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_num(&mut request, "version", timeout as i64);
        self.roundtrip(request).map(|_| ())
    }

    /// The global lock protecting the VG namespace.
    pub fn lock_gl(&mut self, mode: LockMode, flags: u32) -> Result<LockResult> {
        let mut request = request_map("lock_gl");
        map_put_str(&mut request, "mode", mode.as_str());
        map_put_num(&mut request, "flags", flags as i64);
        self.lock_request(request, flags)
    }

    /// The VG lock protecting metadata reads and writes.
    pub fn lock_vg(&mut self, vg_name: &str, mode: LockMode, flags: u32) -> Result<LockResult> {
        let mut request = request_map("lock_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "mode", mode.as_str());
        map_put_num(&mut request, "flags", flags as i64);
        self.lock_request(request, flags)
    }

    /// The LV lock protecting activation and content.
    pub fn lock_lv(
        &mut self,
        vg_name: &str,
        lv_name: &str,
        lv_uuid: &str,
        lv_args: &str,
        mode: LockMode,
        flags: u32,
    ) -> Result<LockResult> {
        let mut request = request_map("lock_lv");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "lv_name", lv_name);
        map_put_str(&mut request, "lv_uuid", lv_uuid);
        map_put_str(&mut request, "lv_args", lv_args);
        map_put_str(&mut request, "mode", mode.as_str());
        map_put_num(&mut request, "flags", flags as i64);
        self.lock_request(request, flags)
    }

    /// Tell the daemon the VG metadata was rewritten with `new_seqno`;
    /// the value propagates to other hosts through the value block.
    pub fn update_vg(&mut self, vg_name: &str, new_seqno: u32) -> Result<()> {
        let mut request = request_map("update_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_num(&mut request, "version", new_seqno as i64);
        self.roundtrip(request).map(|_| ())
    }

    /// Whether any holder has the VG or LV lock, and in which mode.
    pub fn query_lock(&mut self, vg_name: &str, lv_name: &str) -> Result<(LockMode, u32)> {
        let mut request = request_map("query_lock");
        map_put_str(&mut request, "vg_name", vg_name);
        map_put_str(&mut request, "lv_name", lv_name);
        let reply = self.roundtrip(request)?;
        let mode = reply
            .string_from_textmap("mode")
            .and_then(LockMode::parse)
            .unwrap_or(LockMode::Un);
        let sh_count = reply.u64_from_textmap("sh_count").unwrap_or(0) as u32;
        Ok((mode, sh_count))
    }

    pub fn kill_vg(&mut self, vg_name: &str) -> Result<()> {
        let mut request = request_map("kill_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        self.roundtrip(request).map(|_| ())
    }

    pub fn drop_vg(&mut self, vg_name: &str) -> Result<()> {
        let mut request = request_map("drop_vg");
        map_put_str(&mut request, "vg_name", vg_name);
        self.roundtrip(request).map(|_| ())
    }

    pub fn dump_info(&mut self) -> Result<LvmTextMap> {
        self.roundtrip(request_map("dump_info"))
    }

    pub fn dump_log(&mut self) -> Result<String> {
        let reply = self.roundtrip(request_map("dump_log"))?;
        Ok(reply.string_from_textmap("log").unwrap_or("").to_string())
    }
}
