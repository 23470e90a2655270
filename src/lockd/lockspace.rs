// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lockspaces and their worker threads.
//!
//! The daemon's main thread appends actions to a lockspace's queue and
//! signals its condition variable; the worker drains the queue, calls
//! the backend synchronously, and posts results back through the
//! completion channel for the main thread to write to client sockets.
//! Workers never touch sockets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, info, warn};

use super::lm::{LockManager, LmType};
use super::{
    map_put_num, map_put_str, LockMode, ResourceType, ValBlk, AF_ADOPT, AF_ADOPT_ONLY,
    AF_NOWAIT, AF_PERSISTENT, AF_SH_EXISTS_OK, AF_UNLOCK_CANCEL, RF_SH_EXISTS, VBF_REMOVED,
};
use crate::error::LockError;
use crate::parser::LvmTextMap;

/// Internal client id for locks owned by no client (persistent locks
/// and adopted orphans).
pub const NO_CLIENT_ID: u32 = 0;

/// One queued request against a lockspace.
#[derive(Debug, Clone)]
pub struct Action {
    pub client_id: u32,
    /// Echoed into the reply.
    pub op: String,
    pub rt: ResourceType,
    /// Target mode; `Un` requests an unlock.
    pub mode: LockMode,
    pub flags: u32,
    /// Resource name; empty selects GLLK/VGLK by `rt`.
    pub name: String,
    pub lv_uuid: String,
    /// New r_version for update actions.
    pub version: u32,
}

impl Action {
    pub fn resource_name(&self) -> String {
        match self.rt {
            ResourceType::Gl => super::R_NAME_GL.to_string(),
            ResourceType::Vg => super::R_NAME_VG.to_string(),
            ResourceType::Lv => self.name.clone(),
        }
    }
}

/// A finished action ready to be written to its client.
#[derive(Debug)]
pub struct Completion {
    pub client_id: u32,
    pub reply: LvmTextMap,
}

#[derive(Debug, Clone)]
struct LockHolder {
    client_id: u32,
    mode: LockMode,
    persistent: bool,
}

struct Resource {
    name: String,
    rt: ResourceType,
    /// Mode held from the backend; `Un` when not held.
    mode: LockMode,
    sh_count: u32,
    holders: Vec<LockHolder>,
    vb: Option<ValBlk>,
    /// Pending r_version to write back on the next EX release.
    next_version: Option<u32>,
    /// Actions blocked behind a conflicting holder.
    waiting: VecDeque<Action>,
    /// Orphan mode recorded by a prior daemon instance.
    adopt_mode: Option<LockMode>,
}

impl Resource {
    fn new(name: String, rt: ResourceType) -> Resource {
        Resource {
            name,
            rt,
            mode: LockMode::Un,
            sh_count: 0,
            holders: Vec::new(),
            vb: None,
            next_version: None,
            waiting: VecDeque::new(),
            adopt_mode: None,
        }
    }

    fn uses_vb(&self) -> bool {
        !matches!(self.rt, ResourceType::Lv)
    }

    fn holder_index(&self, client_id: u32) -> Option<usize> {
        self.holders.iter().position(|h| h.client_id == client_id)
    }
}

struct LsState {
    resources: HashMap<String, Resource>,
    actions: VecDeque<Action>,
    thread_work: bool,
    thread_stop: bool,
    thread_done: bool,
    create_done: bool,
    create_fail: bool,
    kill_vg: bool,
    free_vg: bool,
}

pub struct Lockspace {
    pub name: String,
    pub vg_name: String,
    pub vg_uuid: String,
    pub lm_type: LmType,
    pub host_id: u32,
    state: Mutex<LsState>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl Lockspace {
    /// Queue an action and wake the worker.
    pub fn add_action(&self, action: Action) {
        let mut state = self.state.lock().expect("lockspace mutex");
        state.actions.push_back(action);
        state.thread_work = true;
        self.cond.notify_one();
    }

    /// Ask the worker to exit; it releases client locks first. Orphan
    /// records for persistent locks survive when `drop_locks` is false.
    pub fn stop(&self, free_vg: bool) {
        let mut state = self.state.lock().expect("lockspace mutex");
        state.thread_stop = true;
        state.free_vg = free_vg;
        state.thread_work = true;
        self.cond.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns (create_done, create_fail) for the backend join.
    pub fn start_state(&self) -> (bool, bool) {
        let state = self.state.lock().expect("lockspace mutex");
        (state.create_done, state.create_fail)
    }

    pub fn set_kill_vg(&self) {
        let mut state = self.state.lock().expect("lockspace mutex");
        state.kill_vg = true;
        state.thread_work = true;
        self.cond.notify_one();
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().expect("lockspace mutex").kill_vg
    }

    /// Lock modes currently held on a resource, for query_lock.
    pub fn query(&self, res_name: &str) -> (LockMode, u32) {
        let state = self.state.lock().expect("lockspace mutex");
        match state.resources.get(res_name) {
            Some(r) => (r.mode, r.sh_count),
            None => (LockMode::Un, 0),
        }
    }

    /// Release every non-persistent lock a vanished client held.
    pub fn drop_client(&self, client_id: u32) {
        self.add_action(Action {
            client_id,
            op: "drop_client".to_string(),
            rt: ResourceType::Lv,
            mode: LockMode::Un,
            flags: 0,
            name: String::new(),
            lv_uuid: String::new(),
            version: 0,
        });
    }

    /// Snapshot of held resources, for dump_info and the adopt file.
    pub fn dump_resources(&self) -> Vec<(String, String, LockMode, bool)> {
        let state = self.state.lock().expect("lockspace mutex");
        let mut out = Vec::new();
        for r in state.resources.values() {
            for h in &r.holders {
                out.push((
                    r.name.clone(),
                    r.rt.as_str().to_string(),
                    h.mode,
                    h.persistent,
                ));
            }
        }
        out
    }
}

/// Arguments for starting one lockspace.
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub ls_name: String,
    pub vg_name: String,
    pub vg_uuid: String,
    pub lm_type: LmType,
    pub host_id: u32,
    pub adopt: bool,
    pub adopt_only: bool,
    /// Client waiting for the start result; 0 when none.
    pub client_id: u32,
}

/// Spawn the worker thread for a lockspace. The worker owns the
/// backend; all backend calls happen on it so arbitrary lock-manager
/// delays never block the main thread.
pub fn spawn_lockspace(
    args: StartArgs,
    mut lm: Box<dyn LockManager>,
    completions: Sender<Completion>,
    waker: Arc<dyn Fn() + Send + Sync>,
) -> Arc<Lockspace> {
    let ls = Arc::new(Lockspace {
        name: args.ls_name.clone(),
        vg_name: args.vg_name.clone(),
        vg_uuid: args.vg_uuid.clone(),
        lm_type: args.lm_type,
        host_id: args.host_id,
        state: Mutex::new(LsState {
            resources: HashMap::new(),
            actions: VecDeque::new(),
            thread_work: false,
            thread_stop: false,
            thread_done: false,
            create_done: false,
            create_fail: false,
            kill_vg: false,
            free_vg: false,
        }),
        cond: Condvar::new(),
        stopped: AtomicBool::new(false),
    });

    let worker_ls = Arc::clone(&ls);
    let spawned = thread::Builder::new()
        .name(format!("ls-{}", args.ls_name))
        .spawn(move || worker_main(args, worker_ls, &mut *lm, completions, waker));
    if let Err(e) = spawned {
        warn!("cannot spawn lockspace thread: {}", e);
        let mut state = ls.state.lock().expect("lockspace mutex");
        state.create_done = true;
        state.create_fail = true;
        ls.stopped.store(true, Ordering::Release);
    }
    ls
}

fn reply_base(op: &str, result: i32, lm_rv: i32) -> LvmTextMap {
    let mut map = LvmTextMap::new();
    map_put_str(&mut map, "op", op);
    map_put_num(&mut map, "result", result as i64);
    map_put_num(&mut map, "lm_rv", lm_rv as i64);
    map_put_num(&mut map, "result_flags", 0);
    map
}

fn send_completion(
    completions: &Sender<Completion>,
    waker: &Arc<dyn Fn() + Send + Sync>,
    client_id: u32,
    reply: LvmTextMap,
) {
    if client_id == NO_CLIENT_ID || reply.is_empty() {
        // internal actions and deferred (queued) requests reply later
        return;
    }
    if completions.send(Completion { client_id, reply }).is_ok() {
        (**waker)();
    }
}

fn worker_main(
    args: StartArgs,
    ls: Arc<Lockspace>,
    lm: &mut dyn LockManager,
    completions: Sender<Completion>,
    waker: Arc<dyn Fn() + Send + Sync>,
) {
    // Joining the lockspace may take many seconds; clients asking in
    // the meantime get ESTARTING.
    let join = lm.add_lockspace(&ls.name, args.host_id);

    let mut adopt_result = Ok(Vec::new());
    if join.is_ok() && (args.adopt || args.adopt_only) {
        adopt_result = lm.get_orphans(&ls.name);
    }

    {
        let mut state = ls.state.lock().expect("lockspace mutex");
        state.create_done = true;
        match &join {
            Ok(()) => {
                info!("lockspace {} started", ls.name);
                if let Ok(orphans) = &adopt_result {
                    for orphan in orphans {
                        let mut r = Resource::new(
                            orphan.resource.clone(),
                            if orphan.resource == super::R_NAME_GL {
                                ResourceType::Gl
                            } else if orphan.resource == super::R_NAME_VG {
                                ResourceType::Vg
                            } else {
                                ResourceType::Lv
                            },
                        );
                        r.adopt_mode = Some(orphan.mode);
                        state.resources.insert(orphan.resource.clone(), r);
                    }
                }
            }
            Err(e) => {
                warn!("lockspace {} failed to start: {}", ls.name, e);
                state.create_fail = true;
            }
        }
    }

    // answer the start_vg that created us
    let start_result = match (&join, args.adopt_only) {
        (Err(e), _) => -(e.code()),
        (Ok(()), true) if adopt_result.as_ref().map(|o| o.is_empty()).unwrap_or(true) => {
            -(LockError::AdoptNone.code())
        }
        (Ok(()), _) => 0,
    };
    send_completion(
        &completions,
        &waker,
        args.client_id,
        reply_base("start_vg", start_result, 0),
    );

    if join.is_err() {
        ls.stopped.store(true, Ordering::Release);
        return;
    }

    loop {
        let (action, stop, free_vg) = {
            let mut state = ls.state.lock().expect("lockspace mutex");
            while !state.thread_work && !state.thread_stop {
                state = ls.cond.wait(state).expect("lockspace cond");
            }
            if state.thread_stop && state.actions.is_empty() {
                (None, true, state.free_vg)
            } else {
                let action = state.actions.pop_front();
                if state.actions.is_empty() {
                    state.thread_work = false;
                }
                (action, false, false)
            }
        };

        if stop {
            shutdown(&ls, lm, free_vg);
            break;
        }

        let action = match action {
            Some(a) => a,
            None => continue,
        };

        if action.op == "drop_client" {
            drop_client_locks(&ls, lm, action.client_id, &completions, &waker);
            continue;
        }

        let (reply, followups) = process_action(&ls, lm, &action);
        send_completion(&completions, &waker, action.client_id, reply);

        // an unlock may unblock queued waiters
        for waiter in followups {
            let (reply, more) = process_action(&ls, lm, &waiter);
            debug_assert!(more.is_empty());
            send_completion(&completions, &waker, waiter.client_id, reply);
        }
    }

    {
        let mut state = ls.state.lock().expect("lockspace mutex");
        state.thread_done = true;
    }
    ls.stopped.store(true, Ordering::Release);
    info!("lockspace {} stopped", ls.name);
}

fn shutdown(ls: &Arc<Lockspace>, lm: &mut dyn LockManager, free_vg: bool) {
    let names: Vec<String> = {
        let state = ls.state.lock().expect("lockspace mutex");
        state.resources.keys().cloned().collect()
    };
    for name in names {
        let mut state = ls.state.lock().expect("lockspace mutex");
        if let Some(r) = state.resources.get_mut(&name) {
            let persistent = r.holders.iter().any(|h| h.persistent);
            if r.mode != LockMode::Un && !persistent {
                let vb = pending_vb(r);
                drop(state);
                let _ = lm.unlock(&ls.name, &name, vb);
                continue;
            }
            // persistent locks stay with the lockspace membership and
            // are recovered by adopt on restart
        }
    }
    let _ = lm.rem_lockspace(&ls.name, free_vg);
}

fn drop_client_locks(
    ls: &Arc<Lockspace>,
    lm: &mut dyn LockManager,
    client_id: u32,
    completions: &Sender<Completion>,
    waker: &Arc<dyn Fn() + Send + Sync>,
) {
    let names: Vec<String> = {
        let state = ls.state.lock().expect("lockspace mutex");
        state
            .resources
            .iter()
            .filter(|(_, r)| {
                r.holders
                    .iter()
                    .any(|h| h.client_id == client_id && !h.persistent)
            })
            .map(|(name, _)| name.clone())
            .collect()
    };
    for name in names {
        let action = Action {
            client_id,
            op: "unlock".to_string(),
            rt: ResourceType::Lv,
            mode: LockMode::Un,
            flags: 0,
            name: name.clone(),
            lv_uuid: String::new(),
            version: 0,
        };
        // rt in the action only matters for naming; the resource
        // already exists under `name`
        let (_, followups) = process_unlock(ls, lm, &action, &name);
        for waiter in followups {
            let (reply, _) = process_action(ls, lm, &waiter);
            send_completion(completions, waker, waiter.client_id, reply);
        }
    }
    debug!("{}: dropped locks of client {}", ls.name, client_id);
}

fn pending_vb(r: &mut Resource) -> Option<ValBlk> {
    if !r.uses_vb() {
        return None;
    }
    match r.next_version.take() {
        Some(version) => {
            let mut vb = r.vb.unwrap_or_else(|| ValBlk::new(0));
            if vb.version == 0 {
                vb.version = super::VAL_BLK_VERSION;
            }
            vb.r_version = version;
            r.vb = Some(vb);
            Some(vb)
        }
        None => None,
    }
}

// One lock/convert/unlock/update against the resource table plus the
// backend. Returns the reply and any unblocked waiters to re-process.
fn process_action(
    ls: &Arc<Lockspace>,
    lm: &mut dyn LockManager,
    action: &Action,
) -> (LvmTextMap, Vec<Action>) {
    let res_name = action.resource_name();

    if ls.is_killed() && action.op != "unlock" && action.mode != LockMode::Un {
        return (
            reply_base(&action.op, -(LockError::VgKilled.code()), 0),
            Vec::new(),
        );
    }

    match action.op.as_str() {
        "lock_gl" | "lock_vg" | "lock_lv" | "lock" => {
            if action.mode == LockMode::Un {
                process_unlock(ls, lm, action, &res_name)
            } else {
                (process_lock(ls, lm, action, &res_name), Vec::new())
            }
        }
        "unlock" => process_unlock(ls, lm, action, &res_name),
        "update_vg" | "update" => (process_update(ls, action, &res_name), Vec::new()),
        other => (
            reply_base(other, -(LockError::Args.code()), 0),
            Vec::new(),
        ),
    }
}

fn process_lock(
    ls: &Arc<Lockspace>,
    lm: &mut dyn LockManager,
    action: &Action,
    res_name: &str,
) -> LvmTextMap {
    let mut state = ls.state.lock().expect("lockspace mutex");
    let resource = state
        .resources
        .entry(res_name.to_string())
        .or_insert_with(|| Resource::new(res_name.to_string(), action.rt));

    if let Some(vb) = resource.vb {
        if vb.flags & VBF_REMOVED != 0 {
            return reply_base(&action.op, -(LockError::Removed.code()), 0);
        }
    }

    let nowait = action.flags & AF_NOWAIT != 0;
    let persistent = action.flags & AF_PERSISTENT != 0;
    let holder_id = if action.flags & AF_PERSISTENT != 0 && action.flags & super::AF_NO_CLIENT != 0
    {
        NO_CLIENT_ID
    } else {
        action.client_id
    };

    // adopt: take over an orphan left by the previous instance
    if action.flags & (AF_ADOPT | AF_ADOPT_ONLY) != 0 {
        if let Some(orphan_mode) = resource.adopt_mode {
            if orphan_mode != action.mode && action.flags & AF_ADOPT_ONLY != 0 {
                return reply_base(&action.op, -(LockError::AdoptRetry.code()), 0);
            }
        } else if action.flags & AF_ADOPT_ONLY != 0 {
            return reply_base(&action.op, -(LockError::AdoptNone.code()), 0);
        }
    }

    // repeat request from the same holder
    if let Some(i) = resource.holder_index(action.client_id) {
        let held = resource.holders[i].mode;
        if held == action.mode {
            let mut reply = reply_base(&action.op, 0, 0);
            if let Some(vb) = resource.vb {
                map_put_num(&mut reply, "r_version", vb.r_version as i64);
            }
            return reply;
        }
        // downgrades never block; upgrades may conflict with other holders
        let others_block = resource
            .holders
            .iter()
            .enumerate()
            .any(|(j, h)| j != i && !h.mode.compatible(action.mode));
        if action.mode > held && others_block {
            return reply_base(&action.op, -(LockError::Again.code()), 0);
        }
        let vb_to_write = if held == LockMode::Ex && action.mode < held {
            pending_vb(resource)
        } else {
            None
        };
        let resource_name = resource.name.clone();
        drop(state);
        let lm_result = if let Some(vb) = vb_to_write {
            // write the VB through a release/reacquire on backends
            // without convert-time VB writes
            lm.unlock(&ls.name, &resource_name, Some(vb))
                .and_then(|_| lm.lock(&ls.name, &resource_name, action.mode, nowait, persistent))
        } else {
            lm.convert(&ls.name, &resource_name, action.mode, nowait)
        };
        let mut state = ls.state.lock().expect("lockspace mutex");
        let resource = state.resources.get_mut(res_name).expect("resource exists");
        return match lm_result {
            Ok(vb) => {
                if resource.uses_vb() {
                    if let Some(vb) = vb {
                        resource.vb = Some(vb);
                    }
                }
                if resource.holders[i].mode == LockMode::Sh {
                    resource.sh_count = resource.sh_count.saturating_sub(1);
                }
                if action.mode == LockMode::Sh {
                    resource.sh_count += 1;
                }
                resource.holders[i].mode = action.mode;
                resource.mode = resource
                    .holders
                    .iter()
                    .map(|h| h.mode)
                    .max()
                    .unwrap_or(LockMode::Un);
                let mut reply = reply_base(&action.op, 0, 0);
                if let Some(vb) = resource.vb {
                    map_put_num(&mut reply, "r_version", vb.r_version as i64);
                }
                reply
            }
            Err(e) => reply_base(&action.op, -(e.code()), 0),
        };
    }

    // shared-mode coalescing: no backend call when the daemon already
    // holds SH for another client
    if action.mode == LockMode::Sh && resource.mode == LockMode::Sh {
        resource.sh_count += 1;
        resource.holders.push(LockHolder {
            client_id: holder_id,
            mode: LockMode::Sh,
            persistent,
        });
        let mut reply = reply_base(&action.op, 0, 0);
        reply.insert(
            "result_flags".to_string(),
            crate::parser::Entry::Number(if action.flags & AF_SH_EXISTS_OK != 0 {
                RF_SH_EXISTS as i64
            } else {
                0
            }),
        );
        if let Some(vb) = resource.vb {
            map_put_num(&mut reply, "r_version", vb.r_version as i64);
        }
        return reply;
    }

    // conflicting holder within this daemon
    if resource.mode != LockMode::Un && !resource.mode.compatible(action.mode) {
        if nowait {
            return reply_base(&action.op, -(LockError::Again.code()), 0);
        }
        resource.waiting.push_back(action.clone());
        // the reply is deferred until the holder releases
        return LvmTextMap::new();
    }

    let resource_name = resource.name.clone();
    drop(state);
    let lm_result = lm.lock(&ls.name, &resource_name, action.mode, nowait, persistent);
    let mut state = ls.state.lock().expect("lockspace mutex");
    let resource = state.resources.get_mut(res_name).expect("resource exists");

    match lm_result {
        Ok(vb) => {
            // a VB flagged removed means the VG was deleted under us
            if let Some(vb) = vb {
                if resource.uses_vb() && vb.flags & VBF_REMOVED != 0 {
                    resource.vb = Some(vb);
                    let resource_name = resource.name.clone();
                    drop(state);
                    let _ = lm.unlock(&ls.name, &resource_name, None);
                    return reply_base(&action.op, -(LockError::Removed.code()), 0);
                }
            }

            if resource.uses_vb() {
                resource.vb = vb.or(resource.vb);
            }
            if action.mode == LockMode::Sh {
                resource.sh_count += 1;
            }
            resource.holders.push(LockHolder {
                client_id: holder_id,
                mode: action.mode,
                persistent,
            });
            resource.mode = resource
                .holders
                .iter()
                .map(|h| h.mode)
                .max()
                .unwrap_or(LockMode::Un);
            resource.adopt_mode = None;

            let mut reply = reply_base(&action.op, 0, 0);
            if let Some(vb) = resource.vb {
                map_put_num(&mut reply, "r_version", vb.r_version as i64);
            }
            reply
        }
        Err(e) => reply_base(&action.op, -(e.code()), 0),
    }
}

fn process_unlock(
    ls: &Arc<Lockspace>,
    lm: &mut dyn LockManager,
    action: &Action,
    res_name: &str,
) -> (LvmTextMap, Vec<Action>) {
    let mut state = ls.state.lock().expect("lockspace mutex");

    let resource = match state.resources.get_mut(res_name) {
        Some(r) => r,
        None => {
            return (
                reply_base(&action.op, -(LockError::Lockd.code()), 0),
                Vec::new(),
            )
        }
    };

    if action.flags & AF_UNLOCK_CANCEL != 0 {
        // cancel this client's queued request instead of a held lock
        let before = resource.waiting.len();
        resource.waiting.retain(|w| w.client_id != action.client_id);
        let cancelled = before != resource.waiting.len();
        return (
            reply_base(
                &action.op,
                if cancelled {
                    0
                } else {
                    -(LockError::Lockd.code())
                },
                0,
            ),
            Vec::new(),
        );
    }

    let i = match resource.holder_index(action.client_id) {
        Some(i) => i,
        None => {
            return (
                reply_base(&action.op, -(LockError::Lockd.code()), 0),
                Vec::new(),
            )
        }
    };

    let holder = resource.holders.remove(i);
    if holder.mode == LockMode::Sh {
        resource.sh_count = resource.sh_count.saturating_sub(1);
    }

    let release_backend = resource.holders.is_empty();
    let vb = if holder.mode == LockMode::Ex {
        pending_vb(resource)
    } else {
        None
    };
    resource.mode = resource
        .holders
        .iter()
        .map(|h| h.mode)
        .max()
        .unwrap_or(LockMode::Un);

    let mut followups = Vec::new();
    if release_backend {
        let resource_name = resource.name.clone();
        // wake every waiter that is now grantable; they re-enter
        // process_action one by one
        while let Some(w) = resource.waiting.pop_front() {
            followups.push(w);
        }
        drop(state);
        if let Err(e) = lm.unlock(&ls.name, &resource_name, vb) {
            warn!("{}: backend unlock of {} failed: {}", ls.name, resource_name, e);
            return (
                reply_base(&action.op, -(e.code()), 0),
                followups,
            );
        }
    }

    (reply_base(&action.op, 0, 0), followups)
}

fn process_update(ls: &Arc<Lockspace>, action: &Action, res_name: &str) -> LvmTextMap {
    let mut state = ls.state.lock().expect("lockspace mutex");
    let resource = state
        .resources
        .entry(res_name.to_string())
        .or_insert_with(|| Resource::new(res_name.to_string(), action.rt));

    // written back on the next EX release so the next acquirer on any
    // host observes it
    let next = resource.next_version.unwrap_or(0).max(action.version);
    resource.next_version = Some(next);
    debug!("{}: {} r_version staged to {}", ls.name, res_name, next);
    reply_base(&action.op, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockd::lm::MemoryLm;
    use std::sync::mpsc;

    fn start_test_ls() -> (Arc<Lockspace>, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let waker: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let args = StartArgs {
            ls_name: "lvm_vg0".to_string(),
            vg_name: "vg0".to_string(),
            vg_uuid: "vg0-uuid".to_string(),
            lm_type: LmType::Dlm,
            host_id: 1,
            adopt: false,
            adopt_only: false,
            client_id: 9,
        };
        let ls = spawn_lockspace(args, Box::new(MemoryLm::new(LmType::Dlm)), tx, waker);
        // the start reply for client 9
        let started = rx.recv().unwrap();
        assert_eq!(started.client_id, 9);
        (ls, rx)
    }

    fn lock_action(client: u32, mode: LockMode, flags: u32) -> Action {
        Action {
            client_id: client,
            op: "lock_vg".to_string(),
            rt: ResourceType::Vg,
            mode,
            flags,
            name: String::new(),
            lv_uuid: String::new(),
            version: 0,
        }
    }

    fn result_of(c: &Completion) -> i64 {
        use crate::parser::TextMapOps;
        c.reply.i64_from_textmap("result").unwrap()
    }

    #[test]
    fn ex_conflict_nowait_gets_eagain() {
        let (ls, rx) = start_test_ls();

        ls.add_action(lock_action(1, LockMode::Ex, 0));
        let granted = rx.recv().unwrap();
        assert_eq!(granted.client_id, 1);
        assert_eq!(result_of(&granted), 0);

        ls.add_action(lock_action(2, LockMode::Ex, AF_NOWAIT));
        let denied = rx.recv().unwrap();
        assert_eq!(denied.client_id, 2);
        assert_eq!(result_of(&denied), -(LockError::Again.code()) as i64);

        ls.stop(false);
    }

    #[test]
    fn waiter_is_granted_after_release() {
        let (ls, rx) = start_test_ls();

        ls.add_action(lock_action(1, LockMode::Ex, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        // client 2 waits
        ls.add_action(lock_action(2, LockMode::Ex, 0));

        // client 1 releases; client 2's deferred grant arrives
        ls.add_action(lock_action(1, LockMode::Un, 0));
        let mut replies = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        replies.sort_by_key(|c| c.client_id);
        assert_eq!(replies[0].client_id, 1);
        assert_eq!(result_of(&replies[0]), 0);
        assert_eq!(replies[1].client_id, 2);
        assert_eq!(result_of(&replies[1]), 0);

        ls.stop(false);
    }

    #[test]
    fn shared_locks_coalesce() {
        let (ls, rx) = start_test_ls();

        ls.add_action(lock_action(1, LockMode::Sh, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);
        ls.add_action(lock_action(2, LockMode::Sh, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        assert_eq!(ls.query(super::super::R_NAME_VG), (LockMode::Sh, 2));

        // an EX request conflicts with both
        ls.add_action(lock_action(3, LockMode::Ex, AF_NOWAIT));
        assert_eq!(
            result_of(&rx.recv().unwrap()),
            -(LockError::Again.code()) as i64
        );

        ls.stop(false);
    }

    #[test]
    fn update_vg_propagates_r_version() {
        use crate::parser::TextMapOps;
        let (ls, rx) = start_test_ls();

        ls.add_action(lock_action(1, LockMode::Ex, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        let mut update = lock_action(1, LockMode::Un, 0);
        update.op = "update_vg".to_string();
        update.version = 8;
        ls.add_action(update);
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        ls.add_action(lock_action(1, LockMode::Un, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        // the next acquirer observes r_version 8
        ls.add_action(lock_action(2, LockMode::Ex, 0));
        let granted = rx.recv().unwrap();
        assert_eq!(result_of(&granted), 0);
        assert_eq!(granted.reply.i64_from_textmap("r_version"), Some(8));

        ls.stop(false);
    }

    #[test]
    fn killed_lockspace_fails_lock_requests() {
        let (ls, rx) = start_test_ls();
        ls.set_kill_vg();

        ls.add_action(lock_action(1, LockMode::Ex, 0));
        assert_eq!(
            result_of(&rx.recv().unwrap()),
            -(LockError::VgKilled.code()) as i64
        );
        ls.stop(false);
    }

    #[test]
    fn client_death_releases_non_persistent_locks() {
        let (ls, rx) = start_test_ls();

        ls.add_action(lock_action(1, LockMode::Ex, 0));
        assert_eq!(result_of(&rx.recv().unwrap()), 0);

        ls.drop_client(1);
        // no reply for internal actions; the next lock succeeds
        ls.add_action(lock_action(2, LockMode::Ex, AF_NOWAIT));
        let granted = rx.recv().unwrap();
        assert_eq!(granted.client_id, 2);
        assert_eq!(result_of(&granted), 0);

        ls.stop(false);
    }
}
