//! Final teardown sequence, grounded in the teacher's own `shutdown.rs` (broadcast-kill,
//! iterative unmount rounds, `sync`+`reboot`) and the original program's `tinit_shutdown`, which
//! additionally forks before calling `reboot(2)` so PID 1 itself never races its own exit.

use std::time::Duration;

use nix::mount::{umount2, MntFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};

/// Cap on unmount retry rounds before giving up and rebooting anyway — busy mounts that never
/// clear would otherwise hang shutdown forever.
const UNMOUNT_ROUND_LIMIT: usize = 10;
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which `reboot(2)` mode to request, selected by the first shutdown-class signal PID 1 received
/// (§6: SIGTERM→reboot, SIGUSR1→halt, SIGUSR2 or SIGPWR→power-off).
pub fn mode_for_signal(signal: Signal) -> RebootMode {
    match signal {
        Signal::SIGUSR1 => RebootMode::RB_HALT_SYSTEM,
        Signal::SIGUSR2 | Signal::SIGPWR => RebootMode::RB_POWER_OFF,
        _ => RebootMode::RB_AUTOBOOT,
    }
}

/// SIGKILLs every process but PID 1 and reaps whatever is waitable within `KILL_REAP_TIMEOUT`,
/// matching the stop-drain's own hard stop once the supervisor gives up waiting on SIGTERM.
pub fn kill_residual_processes() {
    if let Err(err) = kill(Pid::from_raw(-1), Signal::SIGKILL) {
        tracing::warn!("broadcast SIGKILL failed: {err}");
    }
    let deadline = std::time::Instant::now() + KILL_REAP_TIMEOUT;
    while std::time::Instant::now() < deadline {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(50)),
            Err(nix::Error::ECHILD) => break,
            Err(_) => break,
            _ => continue,
        }
    }
}

/// Repeatedly unmounts everything under `/proc/mounts` except the pseudo-filesystems PID 1
/// itself depends on, stopping once a round makes no further progress or the round limit is hit.
pub fn unmount_all() {
    for round in 0..UNMOUNT_ROUND_LIMIT {
        match unmount_round() {
            Ok(true) => continue,
            Ok(false) => return,
            Err(err) => {
                tracing::warn!("unmount round {round}: {err}");
                return;
            }
        }
    }
    tracing::warn!("giving up unmounting after {UNMOUNT_ROUND_LIMIT} rounds");
}

const KEEP_MOUNTED: &[&str] = &["/", "/proc", "/sys", "/dev"];

fn unmount_round() -> std::io::Result<bool> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    let mut made_progress = false;
    for line in mounts.lines().rev() {
        let target = match line.split_whitespace().nth(1) {
            Some(t) => t,
            None => continue,
        };
        if KEEP_MOUNTED.contains(&target) {
            continue;
        }
        match umount2(target, MntFlags::MNT_FORCE) {
            Ok(()) => made_progress = true,
            Err(err) => tracing::debug!("{target}: unmount deferred: {err}"),
        }
    }
    Ok(made_progress)
}

/// Final step: `sync(2)`, then `reboot(mode)` from a forked child so PID 1 never returns from the
/// call that ends it — the parent just parks forever, since init exiting is itself fatal to the
/// kernel.
pub fn sync_and_reboot(mode: RebootMode) -> ! {
    nix::unistd::sync();
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = reboot(mode);
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { .. }) => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
        Err(err) => {
            tracing::error!("fork before reboot failed: {err}; rebooting directly");
            let _ = reboot(mode);
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
    }
}
