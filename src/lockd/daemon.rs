// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The lock daemon.
//!
//! One process per host owns all live lockspaces. The main thread owns
//! the listening socket and a poll set over client connections plus a
//! self-pipe; lockspace workers never touch sockets and post results
//! through a completion channel. A helper thread runs forked
//! sub-processes (fencing commands).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write as IoWrite;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags};

use super::lm::{global_lockspace_name, lockspace_name, make_lock_manager, LmType};
use super::lockspace::{spawn_lockspace, Action, Completion, Lockspace, StartArgs};
use super::{
    map_put_num, map_put_str, read_frame, write_frame, LockMode, ResourceType, AF_WAIT_STARTING,
    PROTOCOL, RF_DUP_GL_LS, RF_NO_GL_LS, RF_NO_LOCKSPACES, RF_NO_LM,
};
use crate::config::RuntimeConfig;
use crate::error::LockError;
use crate::parser::{Entry, LvmTextMap, TextMapOps};
use crate::{Error, Result};

const LOG_RING_LINES: usize = 256;

struct Client {
    id: u32,
    pid: i64,
    name: String,
    // Only the main thread reads or writes the stream; the mutex keeps
    // a slow client from entangling anything else that might hold it.
    stream: Mutex<UnixStream>,
}

struct DaemonState {
    lockspaces: HashMap<String, Arc<Lockspace>>,
    /// Lockspace currently providing the global lock.
    gl_lsname: Option<String>,
    /// More than one sanlock VG advertises an enabled GL.
    sanlock_gl_dup: bool,
    /// The VG holding the GL was removed.
    gl_vg_removed: bool,
    /// VGs whose fencing action failed; clients may proceed with REPAIR.
    fence_failed: HashSet<String>,
    log_ring: VecDeque<String>,
}

impl DaemonState {
    fn log(&mut self, line: String) {
        debug!("{}", line);
        if self.log_ring.len() >= LOG_RING_LINES {
            self.log_ring.pop_front();
        }
        self.log_ring.push_back(line);
    }

    fn prune_stopped(&mut self) {
        self.lockspaces.retain(|_, ls| !ls.is_stopped());
    }
}

struct FenceJob {
    vg_name: String,
    command: String,
}

pub struct Daemon {
    config: RuntimeConfig,
    state: Mutex<DaemonState>,
    shutdown: AtomicBool,
}

impl Daemon {
    pub fn new(config: RuntimeConfig) -> Arc<Daemon> {
        Arc::new(Daemon {
            config,
            state: Mutex::new(DaemonState {
                lockspaces: HashMap::new(),
                gl_lsname: None,
                sanlock_gl_dup: false,
                gl_vg_removed: false,
                fence_failed: HashSet::new(),
                log_ring: VecDeque::new(),
            }),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Bind the socket, write the pid file, adopt prior state, and run
    /// the poll loop until shutdown.
    pub fn run(self: Arc<Daemon>) -> Result<()> {
        let socket_path = self.config.lockd_socket.clone();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        if let Some(parent) = self.config.lockd_pidfile.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut f) = fs::File::create(&self.config.lockd_pidfile) {
            let _ = writeln!(f, "{}", std::process::id());
        }

        let (completion_tx, completion_rx) = mpsc::channel::<Completion>();
        let (pipe_r, pipe_w) = nix::unistd::pipe()?;
        let waker: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let _ = nix::unistd::write(pipe_w, &[0u8]);
        });

        let (fence_tx, fence_rx) = mpsc::channel::<FenceJob>();
        // one helper thread forks sub-processes so workers never do
        let helper = Arc::clone(&self);
        let _ = thread::Builder::new()
            .name("lockd-helper".to_string())
            .spawn(move || {
                for job in fence_rx {
                    let status = Command::new("sh").arg("-c").arg(&job.command).status();
                    let ok = status.map(|s| s.success()).unwrap_or(false);
                    let mut state = helper.state.lock().expect("daemon mutex");
                    if ok {
                        state.log(format!("fence of {} succeeded", job.vg_name));
                    } else {
                        state.log(format!("fence of {} failed", job.vg_name));
                        state.fence_failed.insert(job.vg_name.clone());
                    }
                }
            });

        self.adopt_previous_lockspaces(&completion_tx, &waker);

        info!("lvmlockd listening on {}", socket_path.display());
        let result = self.poll_loop(&listener, completion_rx, pipe_r, completion_tx, waker, fence_tx);

        self.stop_all_lockspaces();
        self.write_adopt_file();
        let _ = fs::remove_file(&socket_path);
        let _ = fs::remove_file(&self.config.lockd_pidfile);
        result
    }

    fn adopt_previous_lockspaces(
        &self,
        completions: &Sender<Completion>,
        waker: &Arc<dyn Fn() + Send + Sync>,
    ) {
        let content = match fs::read_to_string(&self.config.adopt_file) {
            Ok(c) => c,
            Err(_) => return,
        };
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (ls_name, vg_name, lm_type) = match (fields.next(), fields.next(), fields.next()) {
                (Some(a), Some(b), Some(c)) => (a, b, c),
                _ => continue,
            };
            let lm_type = match LmType::parse(lm_type) {
                Some(t) => t,
                None => continue,
            };
            info!("adopting lockspace {} from previous instance", ls_name);
            let args = StartArgs {
                ls_name: ls_name.to_string(),
                vg_name: vg_name.to_string(),
                vg_uuid: String::new(),
                lm_type,
                host_id: self.config.host_id,
                adopt: true,
                adopt_only: false,
                client_id: 0,
            };
            let lm = make_lock_manager(lm_type, &self.config);
            let ls = spawn_lockspace(args, lm, completions.clone(), Arc::clone(waker));
            let mut state = self.state.lock().expect("daemon mutex");
            state.lockspaces.insert(ls_name.to_string(), ls);
        }
    }

    fn write_adopt_file(&self) {
        let state = self.state.lock().expect("daemon mutex");
        let mut out = String::new();
        for ls in state.lockspaces.values() {
            out.push_str(&format!(
                "{} {} {}\n",
                ls.name,
                ls.vg_name,
                ls.lm_type.as_str()
            ));
        }
        if let Err(e) = fs::write(&self.config.adopt_file, out) {
            warn!("cannot write adopt file: {}", e);
        }
    }

    fn stop_all_lockspaces(&self) {
        let state = self.state.lock().expect("daemon mutex");
        for ls in state.lockspaces.values() {
            ls.stop(false);
        }
    }

    fn poll_loop(
        &self,
        listener: &UnixListener,
        completion_rx: Receiver<Completion>,
        pipe_r: RawFd,
        completion_tx: Sender<Completion>,
        waker: Arc<dyn Fn() + Send + Sync>,
        fence_tx: Sender<FenceJob>,
    ) -> Result<()> {
        let mut clients: HashMap<u32, Client> = HashMap::new();
        let mut next_client_id: u32 = 1;

        while !self.shutdown.load(Ordering::Acquire) {
            let mut fds = Vec::with_capacity(clients.len() + 2);
            fds.push(PollFd::new(pipe_r, PollFlags::POLLIN));
            fds.push(PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN));
            let ids: Vec<u32> = clients.keys().copied().collect();
            for id in &ids {
                let client = &clients[id];
                let fd = client.stream.lock().expect("client mutex").as_raw_fd();
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }

            match poll(&mut fds, 500) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::Nix(e)),
            }

            let mut readable_clients = Vec::new();
            let mut pipe_ready = false;
            let mut listener_ready = false;
            for (i, fd) in fds.iter().enumerate() {
                let revents = fd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    continue;
                }
                match i {
                    0 => pipe_ready = true,
                    1 => listener_ready = true,
                    n => readable_clients.push(ids[n - 2]),
                }
            }

            if pipe_ready {
                let mut drain = [0u8; 64];
                let _ = nix::unistd::read(pipe_r, &mut drain);
            }

            // worker completions are written by the main thread only
            while let Ok(completion) = completion_rx.try_recv() {
                if let Some(client) = clients.get(&completion.client_id) {
                    let mut stream = client.stream.lock().expect("client mutex");
                    if let Err(e) = write_frame(&mut *stream, &completion.reply) {
                        warn!("client {}: reply failed: {}", completion.client_id, e);
                    }
                }
            }

            if listener_ready {
                while let Ok((stream, _addr)) = listener.accept() {
                    stream.set_nonblocking(false)?;
                    let id = next_client_id;
                    next_client_id += 1;
                    clients.insert(
                        id,
                        Client {
                            id,
                            pid: 0,
                            name: String::new(),
                            stream: Mutex::new(stream),
                        },
                    );
                    debug!("client {} connected", id);
                }
            }

            for id in readable_clients {
                let gone = self.service_client(
                    &mut clients,
                    id,
                    &completion_tx,
                    &waker,
                    &fence_tx,
                );
                if gone {
                    self.client_gone(&clients, id);
                    clients.remove(&id);
                }
            }
        }

        Ok(())
    }

    // Returns true when the client hung up.
    fn service_client(
        &self,
        clients: &mut HashMap<u32, Client>,
        id: u32,
        completions: &Sender<Completion>,
        waker: &Arc<dyn Fn() + Send + Sync>,
        fence_tx: &Sender<FenceJob>,
    ) -> bool {
        let request = {
            let client = match clients.get(&id) {
                Some(c) => c,
                None => return true,
            };
            let mut stream = client.stream.lock().expect("client mutex");
            match read_frame(&mut *stream) {
                Ok(Some(map)) => map,
                Ok(None) => return true,
                Err(e) => {
                    warn!("client {}: bad frame: {}", id, e);
                    return true;
                }
            }
        };

        let op = request
            .string_from_textmap("op")
            .unwrap_or("")
            .to_string();
        {
            let mut state = self.state.lock().expect("daemon mutex");
            state.log(format!("client {} op {}", id, op));
        }

        if request.string_from_textmap("request") != Some(PROTOCOL) {
            self.reply_now(clients, id, error_reply(&op, LockError::Args));
            return false;
        }

        if let Some(client) = clients.get_mut(&id) {
            if let Some(pid) = request.i64_from_textmap("pid") {
                client.pid = pid;
            }
            if let Some(name) = request.string_from_textmap("cmd") {
                client.name = name.to_string();
            }
        }

        let reply = match op.as_str() {
            "hello" => {
                let mut reply = ok_reply(&op);
                map_put_str(&mut reply, "protocol", PROTOCOL);
                map_put_num(&mut reply, "version", super::PROTOCOL_VERSION);
                Some(reply)
            }
            "quit" => {
                self.reply_now(clients, id, ok_reply(&op));
                return true;
            }
            "running_lm" => {
                let mut reply = ok_reply(&op);
                if self.config.daemon_test {
                    map_put_str(&mut reply, "lm", "test");
                } else {
                    map_put_str(&mut reply, "lm", "file");
                }
                Some(reply)
            }
            "init_vg" => Some(self.op_init_vg(&request, &op)),
            "free_vg" => Some(self.op_free_vg(&request, &op)),
            "start_vg" => self.op_start_vg(&request, &op, id, completions, waker),
            "stop_vg" => Some(self.op_stop_vg(&request, &op)),
            "start_wait" => {
                self.op_start_wait(&request, &op, id, completions, waker);
                None
            }
            "lock_gl" | "lock_vg" | "lock_lv" => self.op_lock(&request, &op, id),
            "update_vg" => self.op_update(&request, &op, id),
            "query_lock" => Some(self.op_query(&request, &op)),
            "kill_vg" => Some(self.op_kill_vg(&request, &op, fence_tx)),
            "drop_vg" => Some(self.op_drop_vg(&request, &op)),
            "dump_info" => Some(self.op_dump_info(&op)),
            "dump_log" => Some(self.op_dump_log(&op)),
            _ => Some(error_reply(&op, LockError::Args)),
        };

        if let Some(reply) = reply {
            self.reply_now(clients, id, reply);
        }
        false
    }

    fn reply_now(&self, clients: &HashMap<u32, Client>, id: u32, reply: LvmTextMap) {
        if let Some(client) = clients.get(&id) {
            let mut stream = client.stream.lock().expect("client mutex");
            if let Err(e) = write_frame(&mut *stream, &reply) {
                warn!("client {}: reply failed: {}", client.id, e);
            }
        }
    }

    fn client_gone(&self, _clients: &HashMap<u32, Client>, id: u32) {
        debug!("client {} disconnected", id);
        let state = self.state.lock().expect("daemon mutex");
        for ls in state.lockspaces.values() {
            ls.drop_client(id);
        }
    }

    // vg_args format: "<lm_type>:1.0.0[:gl]"
    fn op_init_vg(&self, request: &LvmTextMap, op: &str) -> LvmTextMap {
        let lm_type = match request
            .string_from_textmap("vg_args")
            .and_then(|args| args.split(':').next())
            .and_then(LmType::parse)
        {
            Some(t) if t != LmType::None => t,
            _ => return error_reply(op, LockError::Args),
        };
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        if vg_name.is_empty() {
            return error_reply(op, LockError::Args);
        }

        let gl = request
            .string_from_textmap("vg_args")
            .map(|args| args.split(':').any(|f| f == "gl"))
            .unwrap_or(false);

        let mut lm = make_lock_manager(lm_type, &self.config);
        let ls_name = lockspace_name(lm_type, vg_name);
        if let Err(e) = lm.add_lockspace(&ls_name, self.config.host_id) {
            return error_reply(op, e);
        }
        let _ = lm.rem_lockspace(&ls_name, false);

        let mut reply = ok_reply(op);
        map_put_str(
            &mut reply,
            "vg_args",
            &format!(
                "{}:1.0.0{}",
                lm_type.as_str(),
                if gl { ":gl" } else { "" }
            ),
        );
        reply
    }

    fn op_free_vg(&self, request: &LvmTextMap, op: &str) -> LvmTextMap {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let lm_type = request
            .string_from_textmap("vg_args")
            .and_then(|args| args.split(':').next())
            .and_then(LmType::parse)
            .unwrap_or(LmType::None);
        if vg_name.is_empty() || lm_type == LmType::None {
            return error_reply(op, LockError::Args);
        }
        let ls_name = lockspace_name(lm_type, vg_name);
        {
            let state = self.state.lock().expect("daemon mutex");
            if state.lockspaces.contains_key(&ls_name) {
                return error_reply(op, LockError::Lockd);
            }
        }
        let mut lm = make_lock_manager(lm_type, &self.config);
        let _ = lm.rem_lockspace(&ls_name, true);

        let mut state = self.state.lock().expect("daemon mutex");
        if state.gl_lsname.as_deref() == Some(ls_name.as_str()) {
            state.gl_lsname = None;
            state.gl_vg_removed = true;
        }
        ok_reply(op)
    }

    fn op_start_vg(
        &self,
        request: &LvmTextMap,
        op: &str,
        client_id: u32,
        completions: &Sender<Completion>,
        waker: &Arc<dyn Fn() + Send + Sync>,
    ) -> Option<LvmTextMap> {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("").to_string();
        let vg_uuid = request.string_from_textmap("vg_uuid").unwrap_or("").to_string();
        let vg_args = request.string_from_textmap("vg_args").unwrap_or("");
        let lm_type = match vg_args.split(':').next().and_then(LmType::parse) {
            Some(t) if t != LmType::None => t,
            _ => return Some(error_reply(op, LockError::Args)),
        };
        if vg_name.is_empty() {
            return Some(error_reply(op, LockError::Args));
        }
        let host_id = request
            .u64_from_textmap("host_id")
            .map(|h| h as u32)
            .unwrap_or(self.config.host_id);
        if lm_type == LmType::Sanlock && host_id == 0 {
            return Some(error_reply(op, LockError::HostId));
        }
        let flags = request.u64_from_textmap("flags").unwrap_or(0) as u32;
        let adopt = flags & super::AF_ADOPT != 0;
        let adopt_only = flags & super::AF_ADOPT_ONLY != 0;
        let gl_enabled = vg_args.split(':').any(|f| f == "gl");

        let ls_name = lockspace_name(lm_type, &vg_name);

        let mut state = self.state.lock().expect("daemon mutex");
        state.prune_stopped();
        if state.lockspaces.contains_key(&ls_name) {
            return Some(ok_reply(op));
        }

        let args = StartArgs {
            ls_name: ls_name.clone(),
            vg_name: vg_name.clone(),
            vg_uuid,
            lm_type,
            host_id,
            adopt,
            adopt_only,
            client_id,
        };
        let lm = make_lock_manager(lm_type, &self.config);
        let ls = spawn_lockspace(args, lm, completions.clone(), Arc::clone(waker));
        state.lockspaces.insert(ls_name.clone(), ls);

        // the global lock: dlm and idm share one global lockspace;
        // for sanlock the first VG with an enabled GL provides it
        if lm_type.uses_global_lockspace() {
            let gl_name = global_lockspace_name();
            if !state.lockspaces.contains_key(&gl_name) {
                let gl_args = StartArgs {
                    ls_name: gl_name.clone(),
                    vg_name: String::new(),
                    vg_uuid: String::new(),
                    lm_type,
                    host_id,
                    adopt,
                    adopt_only: false,
                    client_id: 0,
                };
                let gl_lm = make_lock_manager(lm_type, &self.config);
                let gl_ls = spawn_lockspace(gl_args, gl_lm, completions.clone(), Arc::clone(waker));
                state.lockspaces.insert(gl_name.clone(), gl_ls);
            }
            state.gl_lsname = Some(gl_name);
        } else if gl_enabled {
            match &state.gl_lsname {
                None => {
                    state.gl_lsname = Some(ls_name.clone());
                    state.gl_vg_removed = false;
                }
                Some(existing) if *existing != ls_name => {
                    // first lockspace joined with an enabled GL wins;
                    // later ones flag the duplicate
                    state.sanlock_gl_dup = true;
                }
                _ => {}
            }
        }

        drop(state);
        self.write_adopt_file();
        // the worker replies when the join finishes
        None
    }

    fn op_stop_vg(&self, request: &LvmTextMap, op: &str) -> LvmTextMap {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let ls_name = lockspace_name(LmType::None, vg_name);
        let mut state = self.state.lock().expect("daemon mutex");
        match state.lockspaces.remove(&ls_name) {
            Some(ls) => {
                ls.stop(false);
                if state.gl_lsname.as_deref() == Some(ls_name.as_str()) {
                    state.gl_lsname = None;
                }
                drop(state);
                self.write_adopt_file();
                ok_reply(op)
            }
            None => error_reply(op, LockError::NoLockspace),
        }
    }

    fn op_start_wait(
        &self,
        request: &LvmTextMap,
        op: &str,
        client_id: u32,
        completions: &Sender<Completion>,
        waker: &Arc<dyn Fn() + Send + Sync>,
    ) {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("").to_string();
        let timeout_s = request.u64_from_textmap("version").unwrap_or(10);
        let ls_name = lockspace_name(LmType::None, &vg_name);
        let ls = {
            let state = self.state.lock().expect("daemon mutex");
            state.lockspaces.get(&ls_name).cloned()
        };
        let op = op.to_string();
        let completions = completions.clone();
        let waker = Arc::clone(waker);

        // waiting must not block the main thread; a tiny monitor thread
        // polls the join state until the deadline
        let _ = thread::Builder::new()
            .name("lockd-startwait".to_string())
            .spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(timeout_s);
                let result = loop {
                    let ls = match &ls {
                        Some(ls) => ls,
                        None => break -(LockError::NoLockspace.code()),
                    };
                    let (done, fail) = ls.start_state();
                    if done {
                        break if fail { -(LockError::Manager.code()) } else { 0 };
                    }
                    if Instant::now() >= deadline {
                        // the join continues in the background
                        break -(LockError::TimedOut.code());
                    }
                    thread::sleep(Duration::from_millis(50));
                };
                let mut reply = LvmTextMap::new();
                map_put_str(&mut reply, "op", &op);
                map_put_num(&mut reply, "result", result as i64);
                map_put_num(&mut reply, "lm_rv", 0);
                map_put_num(&mut reply, "result_flags", 0);
                if completions
                    .send(Completion {
                        client_id,
                        reply,
                    })
                    .is_ok()
                {
                    (*waker)();
                }
            });
    }

    fn op_lock(&self, request: &LvmTextMap, op: &str, client_id: u32) -> Option<LvmTextMap> {
        let rt = match op {
            "lock_gl" => ResourceType::Gl,
            "lock_vg" => ResourceType::Vg,
            _ => ResourceType::Lv,
        };
        let mode = match request
            .string_from_textmap("mode")
            .and_then(LockMode::parse)
        {
            Some(m) => m,
            None => return Some(error_reply(op, LockError::Args)),
        };
        let flags = request.u64_from_textmap("flags").unwrap_or(0) as u32;

        let state = self.state.lock().expect("daemon mutex");
        let ls = match rt {
            ResourceType::Gl => match &state.gl_lsname {
                Some(name) => state.lockspaces.get(name).cloned(),
                None => {
                    let mut reply = error_reply(op, LockError::NoLockspace);
                    let mut rf = RF_NO_GL_LS as i64;
                    if state.lockspaces.is_empty() {
                        rf |= RF_NO_LOCKSPACES as i64;
                        rf |= RF_NO_LM as i64;
                    }
                    if state.gl_vg_removed {
                        rf |= super::RF_WARN_GL_REMOVED as i64;
                    }
                    reply.insert("result_flags".to_string(), Entry::Number(rf));
                    return Some(reply);
                }
            },
            _ => {
                let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
                state
                    .lockspaces
                    .get(&lockspace_name(LmType::None, vg_name))
                    .cloned()
            }
        };
        let sanlock_gl_dup = state.sanlock_gl_dup;

        // a VG whose fencing action failed needs an explicit REPAIR
        // acknowledgement before locks are handed out again
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("").to_string();
        if state.fence_failed.contains(&vg_name) {
            if flags & super::AF_REPAIR == 0 {
                return Some(error_reply(op, LockError::LockRepair));
            }
        }
        drop(state);
        if flags & super::AF_REPAIR != 0 {
            let mut state = self.state.lock().expect("daemon mutex");
            state.fence_failed.remove(&vg_name);
            drop(state);
        }

        let ls = match ls {
            Some(ls) => ls,
            None => return Some(error_reply(op, LockError::NoLockspace)),
        };

        let (done, fail) = ls.start_state();
        if fail {
            return Some(error_reply(op, LockError::Manager));
        }
        if !done && flags & AF_WAIT_STARTING == 0 {
            return Some(error_reply(op, LockError::Starting));
        }

        ls.add_action(Action {
            client_id,
            op: op.to_string(),
            rt,
            mode,
            flags,
            name: request.string_from_textmap("lv_name").unwrap_or("").to_string(),
            lv_uuid: request.string_from_textmap("lv_uuid").unwrap_or("").to_string(),
            version: 0,
        });

        if rt == ResourceType::Gl && sanlock_gl_dup {
            // the grant still arrives from the worker; warn via log
            let mut state = self.state.lock().expect("daemon mutex");
            state.log(format!("duplicate GL lockspaces exist ({})", RF_DUP_GL_LS));
        }
        None
    }

    fn op_update(&self, request: &LvmTextMap, op: &str, client_id: u32) -> Option<LvmTextMap> {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let version = request.u64_from_textmap("version").unwrap_or(0) as u32;
        let state = self.state.lock().expect("daemon mutex");
        let ls = state
            .lockspaces
            .get(&lockspace_name(LmType::None, vg_name))
            .cloned();
        drop(state);

        match ls {
            Some(ls) => {
                ls.add_action(Action {
                    client_id,
                    op: op.to_string(),
                    rt: ResourceType::Vg,
                    mode: LockMode::Un,
                    flags: 0,
                    name: String::new(),
                    lv_uuid: String::new(),
                    version,
                });
                None
            }
            None => Some(error_reply(op, LockError::NoLockspace)),
        }
    }

    fn op_query(&self, request: &LvmTextMap, op: &str) -> LvmTextMap {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let lv_name = request.string_from_textmap("lv_name").unwrap_or("");
        let state = self.state.lock().expect("daemon mutex");
        let ls = state
            .lockspaces
            .get(&lockspace_name(LmType::None, vg_name))
            .cloned();
        drop(state);

        match ls {
            Some(ls) => {
                let res_name = if lv_name.is_empty() {
                    super::R_NAME_VG.to_string()
                } else {
                    lv_name.to_string()
                };
                let (mode, sh_count) = ls.query(&res_name);
                let mut reply = ok_reply(op);
                map_put_str(&mut reply, "mode", mode.as_str());
                map_put_num(&mut reply, "sh_count", sh_count as i64);
                reply
            }
            None => error_reply(op, LockError::NoLockspace),
        }
    }

    fn op_kill_vg(&self, request: &LvmTextMap, op: &str, fence_tx: &Sender<FenceJob>) -> LvmTextMap {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let state = self.state.lock().expect("daemon mutex");
        let ls = state
            .lockspaces
            .get(&lockspace_name(LmType::None, vg_name))
            .cloned();
        drop(state);

        match ls {
            Some(ls) => {
                warn!("vg {} killed: leases lost", vg_name);
                ls.set_kill_vg();
                if let Some(ref command) = self.config.fence_command {
                    let _ = fence_tx.send(FenceJob {
                        vg_name: vg_name.to_string(),
                        command: command.replace("%vg", vg_name),
                    });
                }
                ok_reply(op)
            }
            None => error_reply(op, LockError::NoLockspace),
        }
    }

    fn op_drop_vg(&self, request: &LvmTextMap, op: &str) -> LvmTextMap {
        let vg_name = request.string_from_textmap("vg_name").unwrap_or("");
        let ls_name = lockspace_name(LmType::None, vg_name);
        let mut state = self.state.lock().expect("daemon mutex");
        match state.lockspaces.remove(&ls_name) {
            Some(ls) => {
                ls.stop(false);
                ok_reply(op)
            }
            None => error_reply(op, LockError::NoLockspace),
        }
    }

    fn op_dump_info(&self, op: &str) -> LvmTextMap {
        let state = self.state.lock().expect("daemon mutex");
        let mut reply = ok_reply(op);
        let mut spaces = LvmTextMap::new();
        for (name, ls) in &state.lockspaces {
            let mut entry = LvmTextMap::new();
            map_put_str(&mut entry, "vg_name", &ls.vg_name);
            map_put_str(&mut entry, "lm_type", ls.lm_type.as_str());
            let (done, fail) = ls.start_state();
            map_put_num(&mut entry, "started", done as i64);
            map_put_num(&mut entry, "failed", fail as i64);
            map_put_num(&mut entry, "killed", ls.is_killed() as i64);
            let mut resources = LvmTextMap::new();
            for (i, (res, rt, mode, persistent)) in ls.dump_resources().into_iter().enumerate() {
                let mut r = LvmTextMap::new();
                map_put_str(&mut r, "name", &res);
                map_put_str(&mut r, "rt", &rt);
                map_put_str(&mut r, "mode", mode.as_str());
                map_put_num(&mut r, "persistent", persistent as i64);
                resources.insert(format!("lock{}", i), Entry::TextMap(Box::new(r)));
            }
            entry.insert("locks".to_string(), Entry::TextMap(Box::new(resources)));
            spaces.insert(name.clone(), Entry::TextMap(Box::new(entry)));
        }
        reply.insert("lockspaces".to_string(), Entry::TextMap(Box::new(spaces)));
        if let Some(ref gl) = state.gl_lsname {
            map_put_str(&mut reply, "gl_lockspace", gl);
        }
        reply
    }

    fn op_dump_log(&self, op: &str) -> LvmTextMap {
        let state = self.state.lock().expect("daemon mutex");
        let mut reply = ok_reply(op);
        let joined: Vec<String> = state.log_ring.iter().cloned().collect();
        map_put_str(&mut reply, "log", &joined.join("; "));
        reply
    }
}

fn ok_reply(op: &str) -> LvmTextMap {
    let mut map = LvmTextMap::new();
    map_put_str(&mut map, "op", op);
    map_put_num(&mut map, "result", 0);
    map_put_num(&mut map, "lm_rv", 0);
    map_put_num(&mut map, "result_flags", 0);
    map
}

fn error_reply(op: &str, err: LockError) -> LvmTextMap {
    let mut map = LvmTextMap::new();
    map_put_str(&mut map, "op", op);
    map_put_num(&mut map, "result", -(err.code()) as i64);
    map_put_num(&mut map, "lm_rv", -(err.code()) as i64);
    map_put_num(&mut map, "result_flags", 0);
    map
}

/// Run a daemon in a background thread; returns the handle used to
/// stop it. The caller owns the socket path through `config`.
pub fn spawn(config: RuntimeConfig) -> Result<Arc<Daemon>> {
    let daemon = Daemon::new(config);
    let runner = Arc::clone(&daemon);
    thread::Builder::new()
        .name("lvmlockd-main".to_string())
        .spawn(move || {
            if let Err(e) = runner.run() {
                warn!("lvmlockd exited with error: {}", e);
            }
        })
        .map_err(Error::Io)?;
    Ok(daemon)
}

/// Wait until the daemon socket accepts connections.
pub fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if UnixStream::connect(path).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}
