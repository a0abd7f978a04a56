//! Post-fork child spawning pipeline.
//!
//! Grounded in the original program's `svc_spawn`/`svc_exec` in `svc.c`. The post-fork, pre-exec
//! path is restricted to the documented async-signal-safe subset: `setsid`, stdio redirection,
//! unblocking the signal mask, then `execve` with an environment built from `conf_get_env`'s
//! equivalent below. Rust can't express the original's `vfork` share-address-space optimization
//! safely, so this uses plain `fork`; the parent still only blocks until the child reaches
//! `exec`/`_exit`, matching §5's concurrency note.

use std::ffi::CString;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{execve, fork, setsid, ForkResult, Pid};

use crate::descriptor::ServiceDescriptor;

/// Thin wrapper around the raw syscall rather than `nix::unistd::dup2` — nix has moved that
/// wrapper's signature between `AsFd`/`OwnedFd` forms across recent releases, and the post-fork
/// path only ever deals in bare fd numbers, which must stay async-signal-safe regardless.
fn dup2(oldfd: RawFd, newfd: RawFd) -> nix::Result<()> {
    Errno::result(unsafe { libc::dup2(oldfd, newfd) }).map(drop)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    Fork,
}

/// Spawns `argv` as a child of `descriptor`'s service. Returns the child PID on success; the
/// caller is responsible for arming the service timer (see `Repository::spawn_start_cmd`).
///
/// Failures are logged here (mirroring `svc_spawn`'s own `tinit_err` call) since the parent side
/// has nothing more specific to add.
pub fn spawn_child(descriptor: &ServiceDescriptor, argv: &[String]) -> Result<Pid, SpawnError> {
    debug_assert!(!argv.is_empty());

    // Safety: the child path below only performs the documented async-signal-safe operations
    // (setsid, open/dup2 on fresh fds, sigprocmask via nix, execve) before either exec'ing or
    // calling `std::process::exit`, never returning into arbitrary Rust runtime state.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!("{}: {}[{child}]: spawned.", descriptor.name, argv[0]);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            child_exec(descriptor, argv);
            unreachable!("child_exec never returns");
        }
        Err(errno) => {
            tracing::error!(
                "{}: {}: cannot spawn: {} ({errno}).",
                descriptor.name,
                argv[0],
                errno.desc(),
            );
            Err(SpawnError::Fork)
        }
    }
}

/// Child-side body. Never returns: either `execve` replaces the process image, or we `_exit`
/// with an OS-error status on failure.
fn child_exec(descriptor: &ServiceDescriptor, argv: &[String]) -> ! {
    // New session so the child is not handed init's controlling terminal.
    let _ = setsid();

    if let Some(path) = &descriptor.stdin {
        if reopen_stdin(path).is_err() {
            std::process::exit(exitcode::OSERR);
        }
    }
    if let Some(path) = &descriptor.stdout {
        if reopen_stdout(path).is_err() {
            std::process::exit(exitcode::OSERR);
        }
        let _ = dup2(1, 2);
    }

    // Signal dispositions reset to default across execve for handled signals; the mask itself
    // is inherited unless we clear it here, so unblock everything to restore default behavior.
    let _ = nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_UNBLOCK,
        Some(&nix::sys::signal::SigSet::all()),
        None,
    );

    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_default())
        .collect();
    let c_env = build_env(descriptor);
    let path = &c_argv[0];
    match execve(path, &c_argv, &c_env) {
        Ok(_) => unreachable!(),
        Err(errno) => {
            tracing::error!("{}: cannot execute: {} ({errno}).", argv[0], errno.desc());
            std::process::exit(exitcode::OSERR);
        }
    }
}

/// Builds the child's full environment — the original's `conf_get_env` replaces the environment
/// outright rather than layering onto whatever the parent happened to have, so this starts from
/// the same minimal baseline `bootstrap::reset_environment` establishes for PID 1 itself and then
/// adds `descriptor.environ`, which is free to override any of the baseline names.
fn build_env(descriptor: &ServiceDescriptor) -> Vec<CString> {
    let mut vars: Vec<(String, String)> = vec![
        ("HOME".to_owned(), "/".to_owned()),
        (
            "PATH".to_owned(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
        ),
        ("TERM".to_owned(), "linux".to_owned()),
    ];
    for (name, value) in &descriptor.environ {
        match vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.clone(),
            None => vars.push((name.clone(), value.clone())),
        }
    }
    vars.into_iter()
        .map(|(name, value)| CString::new(format!("{name}={value}")).unwrap_or_default())
        .collect()
}

fn reopen_stdin(path: &str) -> Result<(), ()> {
    let fd = open(
        path,
        OFlag::O_RDWR | OFlag::O_NOATIME | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )
    .map_err(|_| ())?;
    dup2(fd, 0).map_err(|_| ())?;
    let meta = std::fs::metadata("/proc/self/fd/0").map_err(|_| ())?;
    if !meta.file_type().is_char_device() {
        tracing::error!("{path}: pathname not suitable for standard input.");
        return Err(());
    }
    Ok(())
}

fn reopen_stdout(path: &str) -> Result<(), ()> {
    let fd = open(
        path,
        OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CREAT | OFlag::O_NOATIME | OFlag::O_NOFOLLOW,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|_| ())?;
    dup2(fd, 1).map_err(|_| ())?;
    Ok(())
}

/// Small local stand-in for the `sysexits.h` `EX_OSERR` constant the original uses on spawn
/// failure; not worth a dependency for one constant.
mod exitcode {
    pub const OSERR: i32 = 71;
}
