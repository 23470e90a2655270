// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `malvinlockd`: the lock daemon binary.

use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use malvin::config::RuntimeConfig;
use malvin::lockd::daemon::Daemon;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

#[derive(Parser)]
#[command(name = "malvinlockd", about = "LVM lock daemon", version)]
struct Cli {
    /// Socket path override.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// This host's id for lease ownership.
    #[arg(long)]
    host_id: Option<u32>,

    /// Directory for file-lease lockspaces.
    #[arg(long)]
    lease_dir: Option<PathBuf>,

    /// Adopt table path override.
    #[arg(long)]
    adopt_file: Option<PathBuf>,

    /// Run without a live lock manager backend.
    #[arg(long)]
    test: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = RuntimeConfig::load();
    if let Some(socket) = cli.socket {
        config.lockd_socket = socket;
    }
    if let Some(host_id) = cli.host_id {
        config.host_id = host_id;
    }
    if let Some(lease_dir) = cli.lease_dir {
        config.lease_dir = lease_dir;
    }
    if let Some(adopt_file) = cli.adopt_file {
        config.adopt_file = adopt_file;
    }
    config.daemon_test = cli.test;

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            eprintln!("malvinlockd: cannot install signal handler: {}", e);
            exit(5);
        }
    }

    let daemon = Daemon::new(config);

    // the handler only flips the flag; this thread relays it into the
    // daemon's poll loop
    let watcher = Arc::clone(&daemon);
    let _ = thread::Builder::new()
        .name("lockd-signal".to_string())
        .spawn(move || loop {
            if SHUTDOWN.load(Ordering::Acquire) {
                watcher.request_shutdown();
                break;
            }
            thread::sleep(Duration::from_millis(200));
        });

    info!("malvinlockd starting");
    if let Err(e) = daemon.run() {
        eprintln!("malvinlockd: {}", e);
        exit(5);
    }
}
