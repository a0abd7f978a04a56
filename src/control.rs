//! Control-plane datagram server, grounded in the original program's `ctl.c`: credential
//! checking, pattern dispatch, and the bounded outbound queue.

use std::collections::VecDeque;
use std::io::IoSliceMut;
use std::os::unix::fs::PermissionsExt;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    recvmsg, setsockopt, sockopt::PassCred, ControlMessageOwned, MsgFlags, UnixAddr,
    UnixCredentials,
};
use nix::unistd::{Gid, Uid};
use tokio::net::UnixDatagram;

use crate::config;
use crate::error::SupervisorError;
use crate::glob::Pattern;
use crate::protocol::{MsgType, Reply, Request, StatusRecord};
use crate::repository::Repository;
use crate::service::ServiceId;
use crate::target;

/// Outbound reply queue depth; once full the server stops reading new requests until a send
/// succeeds, matching the original's fixed free/busy buffer pool.
const OUTBOUND_QUEUE_DEPTH: usize = 16;

pub struct ControlServer {
    socket: UnixDatagram,
    admin_gid: Gid,
    outbound: VecDeque<(PathBuf, Vec<u8>)>,
}

impl ControlServer {
    /// Binds the datagram endpoint at `<run_dir>/tinit.sock` with mode `rw-rw----`, removing any
    /// stale socket file left behind by a previous run. `SO_PASSCRED` is enabled so every
    /// received datagram carries its sender's credentials as an `SCM_CREDENTIALS` ancillary
    /// message — `SO_PEERCRED` only reports the socket's own creator on an unconnected
    /// `SOCK_DGRAM` endpoint, which is useless for authorizing individual senders.
    pub fn bind(run_dir: &Path, admin_gid: Gid) -> std::io::Result<Self> {
        let path = run_dir.join(crate::protocol::SOCK_NAME);
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))?;
        setsockopt(&socket, PassCred, &true)?;
        Ok(ControlServer {
            socket,
            admin_gid,
            outbound: VecDeque::with_capacity(OUTBOUND_QUEUE_DEPTH),
        })
    }

    pub fn socket(&self) -> &UnixDatagram {
        &self.socket
    }

    /// Reads one datagram (if any is pending), checks the sender's credentials (via the
    /// `SCM_CREDENTIALS` ancillary message attached to this specific datagram, not the socket's
    /// own `SO_PEERCRED`), decodes it, dispatches against `repo`, and queues the reply for
    /// sending. Malformed or unauthorized datagrams are dropped with a log entry rather than
    /// propagated, per §7's TransportError/CredentialRejected/ProtocolError policy.
    pub async fn service_one(
        &mut self,
        repo: &mut Repository,
        root: &Path,
        services_dir: &Path,
    ) {
        let (bytes, credentials, addr) = loop {
            if let Err(err) = self.socket.readable().await {
                tracing::warn!("control socket not readable: {err}");
                return;
            }
            match self.recv_with_credentials() {
                Ok(v) => break v,
                Err(nix::Error::EWOULDBLOCK) => continue,
                Err(err) => {
                    tracing::warn!("control socket recv failed: {err}");
                    return;
                }
            }
        };

        let addr = match addr {
            Some(a) => a,
            None => {
                tracing::warn!("control request had no sender address, dropping");
                return;
            }
        };

        if let Err(err) = self.authorize(credentials) {
            tracing::warn!("control request rejected: {err}");
            return;
        }

        let request = match Request::decode(&bytes) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!("malformed control request: {err}");
                return;
            }
        };

        let reply = dispatch(repo, root, services_dir, &request);
        match reply.encode() {
            Ok(bytes) => self.enqueue_reply(addr, bytes),
            Err(err) => tracing::warn!("{}: reply not sent: {err}", request.seq),
        }
    }

    /// One non-blocking `recvmsg(2)`, parsing the `SCM_CREDENTIALS` control message into a
    /// `UnixCredentials` alongside the payload and the sender's path.
    fn recv_with_credentials(
        &self,
    ) -> nix::Result<(Vec<u8>, UnixCredentials, Option<PathBuf>)> {
        let mut buf = vec![0u8; crate::protocol::MSG_SIZE_MAX];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!(UnixCredentials);
        let msg = recvmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_DONTWAIT,
        )?;

        let mut credentials = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                credentials = Some(creds);
            }
        }
        let credentials = credentials.ok_or(nix::Error::ENOMSG)?;
        let n = msg.bytes;
        let path = msg.address.as_ref().and_then(UnixAddr::path).map(Path::to_path_buf);
        buf.truncate(n);
        Ok((buf, credentials, path))
    }

    fn authorize(&self, credentials: UnixCredentials) -> Result<(), SupervisorError> {
        let uid = Uid::from_raw(credentials.uid());
        let gid = Gid::from_raw(credentials.gid());
        if uid.is_root() || gid == self.admin_gid {
            Ok(())
        } else {
            Err(SupervisorError::CredentialRejected)
        }
    }

    fn enqueue_reply(&mut self, addr: PathBuf, bytes: Vec<u8>) {
        if self.outbound.len() >= OUTBOUND_QUEUE_DEPTH {
            tracing::warn!("outbound control queue full, dropping oldest reply");
            self.outbound.pop_front();
        }
        self.outbound.push_back((addr, bytes));
    }

    /// Drains as much of the outbound queue as the socket will currently accept; a reply that
    /// would block stays at the front of the queue for the next writable wakeup.
    pub async fn flush(&mut self) {
        while let Some((addr, bytes)) = self.outbound.front() {
            match self.socket.send_to(bytes, addr).await {
                Ok(_) => {
                    self.outbound.pop_front();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!("control reply send failed: {err}");
                    self.outbound.pop_front();
                }
            }
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }
}

fn dispatch(repo: &mut Repository, root: &Path, services_dir: &Path, request: &Request) -> Reply {
    let ret = match request.kind {
        MsgType::Status => return status_reply(repo, request),
        MsgType::Start => apply(repo, &request.pattern, |repo, id| {
            repo.start(id);
            Ok(())
        }),
        MsgType::Stop => apply(repo, &request.pattern, |repo, id| {
            repo.stop(id);
            Ok(())
        }),
        MsgType::Reload => apply(repo, &request.pattern, |repo, id| {
            repo.reload(id).map_err(|()| SupervisorError::NotFound)
        }),
        MsgType::Restart => Ok(()), // reserved — see DESIGN.md's open-question log.
        MsgType::Switch => target::switch(repo, root, services_dir, &request.pattern)
            .map(|_| ())
            .map_err(|_| SupervisorError::NotFound),
    };
    let code = ret.err().map(|e| e.to_errno()).unwrap_or(0);
    Reply::Named {
        seq: request.seq,
        kind: request.kind,
        ret: code,
    }
}

fn apply(
    repo: &mut Repository,
    pattern: &str,
    f: impl FnOnce(&mut Repository, ServiceId) -> Result<(), SupervisorError>,
) -> Result<(), SupervisorError> {
    if !config::is_valid_name(pattern) {
        return Err(SupervisorError::NotFound);
    }
    let id = repo.find_by_name(pattern).ok_or(SupervisorError::NotFound)?;
    f(repo, id)
}

fn status_reply(repo: &Repository, request: &Request) -> Reply {
    let pattern = match Pattern::compile(&request.pattern) {
        Ok(p) => p,
        Err(()) => {
            return Reply::Named {
                seq: request.seq,
                kind: MsgType::Status,
                ret: SupervisorError::BadPattern.to_errno(),
            }
        }
    };

    let mut records = Vec::new();
    for id in repo.ids() {
        let svc = repo.service(id);
        if pattern.is_match(svc.name()) {
            records.push(StatusRecord {
                pid: svc.child.map(|p| p.as_raw() as u32).unwrap_or(0),
                admin_on: svc.admin_on,
                run_state: svc.state.as_u8(),
                origin: svc.descriptor.origin.clone(),
            });
        }
    }

    if records.is_empty() {
        return Reply::Named {
            seq: request.seq,
            kind: MsgType::Status,
            ret: SupervisorError::NotFound.to_errno(),
        };
    }

    let reply = Reply::Status {
        seq: request.seq,
        ret: 0,
        records,
    };
    match reply.encode() {
        Ok(_) => reply,
        Err(err) => Reply::Named {
            seq: request.seq,
            kind: MsgType::Status,
            ret: err.to_errno(),
        },
    }
}
