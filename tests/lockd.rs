// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock daemon scenarios against an in-process daemon on a temp socket.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use malvin::config::RuntimeConfig;
use malvin::lockd::client::LockdClient;
use malvin::lockd::daemon::{spawn, wait_for_socket, Daemon};
use malvin::lockd::lm::LmType;
use malvin::lockd::{LockMode, AF_ADOPT_ONLY, AF_NOWAIT, AF_PERSISTENT};
use malvin::{Error, LockError};

struct DaemonFixture {
    _dir: tempfile::TempDir,
    config: RuntimeConfig,
    daemon: Arc<Daemon>,
}

impl DaemonFixture {
    fn start() -> DaemonFixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.lockd_socket = dir.path().join("lvmlockd.socket");
        config.lockd_pidfile = dir.path().join("lvmlockd.pid");
        config.adopt_file = dir.path().join("lvmlockd.adopt");
        config.lease_dir = dir.path().join("leases");
        config.host_id = 1;

        let daemon = spawn(config.clone()).unwrap();
        assert!(wait_for_socket(
            &config.lockd_socket,
            Duration::from_secs(5)
        ));
        DaemonFixture {
            _dir: dir,
            config,
            daemon,
        }
    }

    fn restart(&mut self) {
        self.daemon.request_shutdown();
        thread::sleep(Duration::from_millis(700));
        self.daemon = spawn(self.config.clone()).unwrap();
        assert!(wait_for_socket(
            &self.config.lockd_socket,
            Duration::from_secs(5)
        ));
    }

    fn client(&self) -> LockdClient {
        LockdClient::connect(&self.config).unwrap()
    }

    fn started_vg(&self, client: &mut LockdClient, vg_name: &str) -> String {
        let vg_args = client
            .init_vg(vg_name, &format!("{}-uuid", vg_name), LmType::Sanlock, true)
            .unwrap();
        client
            .start_vg(vg_name, &format!("{}-uuid", vg_name), &vg_args, 1, 0)
            .unwrap();
        client.start_wait(vg_name, 5).unwrap();
        vg_args
    }

    fn stop(self) {
        self.daemon.request_shutdown();
        thread::sleep(Duration::from_millis(700));
    }
}

#[test]
fn hello_and_dump() {
    let fx = DaemonFixture::start();
    let mut client = fx.client();
    client.dump_info().unwrap();
    let log = client.dump_log().unwrap();
    assert!(log.contains("hello"));
    client.quit();
    fx.stop();
}

#[test]
fn ex_conflict_then_vb_propagation() {
    let fx = DaemonFixture::start();

    let mut h1 = fx.client();
    fx.started_vg(&mut h1, "vg0");

    // H1 takes the VG lock EX and holds it
    h1.lock_vg("vg0", LockMode::Ex, 0).unwrap();

    // H2 with NOWAIT gets EAGAIN immediately
    let mut h2 = fx.client();
    match h2.lock_vg("vg0", LockMode::Ex, AF_NOWAIT) {
        Err(Error::Lock(LockError::Again)) => {}
        other => panic!("expected EAGAIN, got {:?}", other),
    }

    // H2 retries without NOWAIT in the background and blocks
    let config = fx.config.clone();
    let waiter = thread::spawn(move || {
        let mut h2 = LockdClient::connect(&config).unwrap();
        h2.lock_vg("vg0", LockMode::Ex, 0).unwrap()
    });
    thread::sleep(Duration::from_millis(200));

    // H1 commits seqno 8 and releases
    h1.update_vg("vg0", 8).unwrap();
    h1.lock_vg("vg0", LockMode::Un, 0).unwrap();

    // H2's grant carries the new r_version, forcing a re-read
    let grant = waiter.join().unwrap();
    assert_eq!(grant.r_version, Some(8));

    h1.quit();
    h2.quit();
    fx.stop();
}

#[test]
fn shared_locks_coexist_and_block_ex() {
    let fx = DaemonFixture::start();

    let mut h1 = fx.client();
    fx.started_vg(&mut h1, "vg0");

    let mut h2 = fx.client();
    h1.lock_vg("vg0", LockMode::Sh, 0).unwrap();
    h2.lock_vg("vg0", LockMode::Sh, 0).unwrap();

    let (mode, sh_count) = h1.query_lock("vg0", "").unwrap();
    assert_eq!(mode, LockMode::Sh);
    assert_eq!(sh_count, 2);

    let mut h3 = fx.client();
    match h3.lock_vg("vg0", LockMode::Ex, AF_NOWAIT) {
        Err(Error::Lock(LockError::Again)) => {}
        other => panic!("expected EAGAIN, got {:?}", other),
    }

    h1.quit();
    h2.quit();
    h3.quit();
    fx.stop();
}

#[test]
fn lock_vg_without_lockspace_is_enols() {
    let fx = DaemonFixture::start();
    let mut client = fx.client();
    match client.lock_vg("vg9", LockMode::Ex, 0) {
        Err(Error::Lock(LockError::NoLockspace)) => {}
        other => panic!("expected ENOLS, got {:?}", other),
    }
    match client.lock_gl(LockMode::Ex, 0) {
        Err(Error::Lock(LockError::NoLockspace)) => {}
        other => panic!("expected ENOLS for GL, got {:?}", other),
    }
    client.quit();
    fx.stop();
}

#[test]
fn gl_follows_first_sanlock_lockspace() {
    let fx = DaemonFixture::start();
    let mut client = fx.client();
    fx.started_vg(&mut client, "vg0");

    client.lock_gl(LockMode::Ex, 0).unwrap();
    client.lock_gl(LockMode::Un, 0).unwrap();
    client.quit();
    fx.stop();
}

#[test]
fn client_death_releases_locks() {
    let fx = DaemonFixture::start();

    let mut h1 = fx.client();
    fx.started_vg(&mut h1, "vg0");
    h1.lock_vg("vg0", LockMode::Ex, 0).unwrap();

    // death without unlock
    drop(h1);
    thread::sleep(Duration::from_millis(700));

    let mut h2 = fx.client();
    h2.lock_vg("vg0", LockMode::Ex, AF_NOWAIT).unwrap();
    h2.quit();
    fx.stop();
}

#[test]
fn persistent_lock_survives_daemon_restart_via_adopt() {
    let mut fx = DaemonFixture::start();

    let mut h1 = fx.client();
    fx.started_vg(&mut h1, "vg0");
    h1.lock_lv(
        "vg0",
        "lv1",
        "lv1-uuid",
        "",
        LockMode::Ex,
        AF_PERSISTENT,
    )
    .unwrap();
    drop(h1);

    fx.restart();

    // the restarted daemon adopted the lockspace; the orphan lock is
    // re-acquired with ADOPT_ONLY
    let mut h2 = fx.client();
    h2.lock_lv(
        "vg0",
        "lv1",
        "lv1-uuid",
        "",
        LockMode::Ex,
        AF_ADOPT_ONLY,
    )
    .unwrap();

    // a resource with no orphan fails ADOPT_ONLY
    match h2.lock_lv("vg0", "lv2", "lv2-uuid", "", LockMode::Ex, AF_ADOPT_ONLY) {
        Err(Error::Lock(LockError::AdoptNone)) => {}
        other => panic!("expected EADOPT_NONE, got {:?}", other),
    }

    h2.quit();
    fx.stop();
}

#[test]
fn killed_vg_fails_requests() {
    let fx = DaemonFixture::start();
    let mut client = fx.client();
    fx.started_vg(&mut client, "vg0");

    client.kill_vg("vg0").unwrap();
    match client.lock_vg("vg0", LockMode::Ex, 0) {
        Err(Error::Lock(LockError::VgKilled)) => {}
        other => panic!("expected EVGKILLED, got {:?}", other),
    }

    client.drop_vg("vg0").unwrap();
    client.quit();
    fx.stop();
}

#[test]
fn stop_vg_then_lock_is_enols() {
    let fx = DaemonFixture::start();
    let mut client = fx.client();
    fx.started_vg(&mut client, "vg0");

    client.lock_vg("vg0", LockMode::Ex, 0).unwrap();
    client.lock_vg("vg0", LockMode::Un, 0).unwrap();
    client.stop_vg("vg0").unwrap();

    match client.lock_vg("vg0", LockMode::Ex, AF_NOWAIT) {
        Err(Error::Lock(LockError::NoLockspace)) => {}
        other => panic!("expected ENOLS, got {:?}", other),
    }
    client.quit();
    fx.stop();
}
