//! Minimal boot-time mount helpers for the pseudo-filesystems PID 1 needs before it can read its
//! own configuration. Grounded in the teacher's `mount`/`bind_mount` helpers in `main.rs`; this
//! crate only needs the plain (non-overlay, non-VM) subset.

use nix::mount::{mount, MsFlags};

struct Pseudo {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
}

const PSEUDO_FILESYSTEMS: &[Pseudo] = &[
    Pseudo {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: MsFlags::MS_NOSUID,
    },
    Pseudo {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: MsFlags::MS_NOSUID,
    },
    Pseudo {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        flags: MsFlags::MS_NOSUID,
    },
    Pseudo {
        source: "tmpfs",
        target: "/run",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    },
];

/// Mounts `/proc`, `/sys`, `/dev`, `/run`, skipping any that are already mounted (idempotent
/// across a restart-without-reboot during development).
pub fn mount_pseudo_filesystems() -> std::io::Result<()> {
    for fs in PSEUDO_FILESYSTEMS {
        match mount(
            Some(fs.source),
            fs.target,
            Some(fs.fstype),
            fs.flags,
            None::<&str>,
        ) {
            Ok(()) => {}
            Err(nix::Error::EBUSY) => tracing::debug!("{}: already mounted", fs.target),
            Err(err) => {
                return Err(std::io::Error::from(err));
            }
        }
    }
    Ok(())
}
