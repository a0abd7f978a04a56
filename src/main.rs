//! PID-1 entry point: bootstrap, load the service repository, start the boot target, drive the
//! event loop, then shut down. Grounded in the original program's `init.c` `main()`/
//! `tinit_loop`, following the teacher's own `main.rs` top-level orchestration shape.

use std::path::PathBuf;

use nix::unistd::Gid;
use tinit::{bootstrap, control, eventloop, log, mount, repository, shutdown, signal_channel, target};

const SERVICES_DIR: &str = "/etc/tinit/services";
const TARGETS_ROOT: &str = "/etc/tinit";
const RUN_DIR: &str = "/run";
const DEFAULT_TARGET: &str = "current";

fn cmdline() -> Vec<String> {
    std::fs::read_to_string("/proc/cmdline")
        .unwrap_or_default()
        .trim()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

fn cmdline_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .find_map(|a| a.strip_prefix(&format!("{key}=")))
}

/// GID whose members may issue control-plane requests (§4.6); resolved once at startup rather
/// than hardcoded so the boot image can configure it without a rebuild.
fn admin_gid() -> Gid {
    match std::env::var("TINIT_ADMIN_GID").ok().and_then(|s| s.parse().ok()) {
        Some(gid) => Gid::from_raw(gid),
        None => Gid::from_raw(0),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cmdline = cmdline();
    log::init(&cmdline);

    if let Err(err) = bootstrap::require_pid1() {
        tracing::error!("{err}");
        std::process::exit(1);
    }
    if let Err(err) = mount::mount_pseudo_filesystems() {
        tracing::error!("failed to mount pseudo-filesystems: {err}");
    }
    bootstrap::reset_environment();
    if let Err(err) = bootstrap::setup_stdio() {
        tracing::error!("failed to set up stdio: {err}");
    }
    if let Err(err) = bootstrap::block_all_signals() {
        tracing::error!("failed to block signals: {err}");
        std::process::exit(1);
    }

    let services_dir = PathBuf::from(SERVICES_DIR);
    let (mut repo, errors) = match repository::Repository::load(&services_dir) {
        Ok(v) => v,
        Err(err) => {
            tracing::error!("failed to load service repository: {err}");
            std::process::exit(1);
        }
    };
    for err in &errors {
        tracing::warn!("{err}");
    }
    tracing::info!("loaded {} services", repo.len());

    let mut sigchan = match signal_channel::SignalChannel::new() {
        Ok(s) => s,
        Err(err) => {
            tracing::error!("failed to open signal channel: {err}");
            std::process::exit(1);
        }
    };

    let control = match control::ControlServer::bind(&PathBuf::from(RUN_DIR), admin_gid()) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("failed to bind control socket: {err}");
            std::process::exit(1);
        }
    };

    let root = PathBuf::from(TARGETS_ROOT);
    let target_name = cmdline_value(&cmdline, "target").unwrap_or(DEFAULT_TARGET);
    if let Err(err) = target::start(&mut repo, &root, &services_dir, target_name, &mut sigchan) {
        tracing::error!("failed to start target '{target_name}': {err}");
    }

    let mut event_loop = eventloop::EventLoop {
        repo,
        sigchan,
        control,
        root,
        services_dir,
    };
    let signal = event_loop.run().await;

    tracing::info!("drain complete, proceeding to shutdown");
    shutdown::kill_residual_processes();
    shutdown::unmount_all();
    shutdown::sync_and_reboot(shutdown::mode_for_signal(signal));
}
