//! Process-wide, run-once initialization performed before the event loop starts: the PID-1
//! guard, environment reset, and stdio verification. Grounded in the original program's
//! `init.c` (`tinit_bootstrap`) and the teacher's own `set_basic_env`/rlimit setup in `main.rs`.

use std::ffi::CString;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;

/// Thin wrapper around the raw syscall rather than `nix::unistd::dup2` — nix has moved that
/// wrapper's signature between `AsFd`/`OwnedFd` forms across recent releases, and PID 1's stdio
/// setup only ever deals in bare fd numbers (0/1/2 and whatever `open` just returned).
fn dup2(oldfd: RawFd, newfd: RawFd) -> nix::Result<()> {
    Errno::result(unsafe { libc::dup2(oldfd, newfd) }).map(drop)
}

/// Refuses to run unless we actually are PID 1 — this process assumes kernel-level guarantees
/// (no controlling terminal inherited, no parent to reap us) that only hold for PID 1.
pub fn require_pid1() -> Result<(), crate::error::Error> {
    if nix::unistd::getpid() != Pid::from_raw(1) {
        return Err(anyhow::anyhow!("refusing to run: not PID 1").into());
    }
    Ok(())
}

/// Blocks every signal the supervisor doesn't explicitly handle through `SignalChannel`, so
/// nothing can interrupt the single-threaded event loop outside of `signalfd` reads. `SIGKILL`
/// and `SIGSTOP` are not blockable and are omitted from the request to keep `sigprocmask` from
/// erroring. The crash signals are left unblocked at default disposition so a genuine PID-1
/// crash still produces the usual kernel behavior instead of being silently swallowed.
pub fn block_all_signals() -> nix::Result<()> {
    let mut set = SigSet::all();
    for sig in [
        Signal::SIGKILL,
        Signal::SIGSTOP,
        Signal::SIGILL,
        Signal::SIGABRT,
        Signal::SIGFPE,
        Signal::SIGSEGV,
        Signal::SIGBUS,
    ] {
        set.remove(sig);
    }
    nix::sys::signal::sigprocmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&set), None)
}

/// Verifies/establishes fd 0/1/2 pointing at `/dev/console`, and detaches any controlling
/// terminal the kernel may have handed PID 1 by default.
pub fn setup_stdio() -> std::io::Result<()> {
    let fd = open(
        "/dev/console",
        OFlag::O_RDWR,
        Mode::empty(),
    )?;
    let meta = std::fs::metadata("/dev/console")?;
    if !meta.file_type().is_char_device() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "/dev/console is not a character device",
        ));
    }
    dup2(fd, 0)?;
    dup2(fd, 1)?;
    dup2(fd, 2)?;

    unsafe {
        let path = CString::new("/dev/tty").unwrap();
        let tty = libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
        if tty >= 0 {
            libc::ioctl(tty, libc::TIOCNOTTY as _);
            libc::close(tty);
        }
    }
    Ok(())
}

/// Resets the environment to the minimal set PID 1 and its children need, discarding whatever
/// the kernel passed through `/proc/cmdline`-derived variables.
pub fn reset_environment() {
    for (key, _) in std::env::vars() {
        std::env::remove_var(key);
    }
    std::env::set_var("HOME", "/");
    std::env::set_var("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
    std::env::set_var("TERM", "linux");
}
