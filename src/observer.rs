//! Dependency edge registration and cycle rejection.
//!
//! Grounded in the original program's `notif.c` (the fixed-capacity notifier poll) and the
//! `svc_has_starton_notifier`/`svc_has_stopon_notifier` DFS guards in `svc.c`. Edges are modeled
//! as plain `ServiceId` back-references rather than the original's linked `notif` nodes, which
//! removes the ownership-cycle problem a pointer-based observer list would otherwise have in
//! Rust (REDESIGN FLAGS / §9).
//!
//! The notifier poll's `cnt` in the original is a registration-time tally that is never mutated
//! by the dispatch path; "readiness" is instead recomputed by scanning the poll's current
//! sources on every check (see [`crate::repository::Repository::may_start`]). This module only
//! owns the edge *registration* step, i.e. building `starton_notifiers`/`starton_observers`
//! (and the `stopon` counterparts) once at repository load time.

use crate::repository::Repository;
use crate::service::{EdgeKind, ServiceId};

/// True if `current` is `target`, or `target` is reachable from `current` by following
/// `current`'s own notifier sources (the services `current` itself depends on) transitively.
///
/// Registering a new edge `src -> sink` (src notifies sink) would close a cycle exactly when
/// `sink` is already an upstream dependency of `src` — i.e. when `has_notifier(src, sink)` is
/// true here, called before the edge is inserted.
fn has_notifier(repo: &Repository, current: ServiceId, target: ServiceId, kind: EdgeKind) -> bool {
    if current == target {
        return true;
    }
    let sources = repo.service(current).notifiers(kind);
    sources
        .iter()
        .any(|&source| has_notifier(repo, source, target, kind))
}

/// Registers `src -> sink` (src's entry into the given state notifies sink) unless doing so
/// would close a dependency cycle, in which case the edge is dropped and a diagnostic logged —
/// matching `svc_register_starton_obsrv`/`svc_register_stopon_obsrv`.
///
/// Returns `true` if the edge was registered.
pub fn register_edge(repo: &mut Repository, src: ServiceId, sink: ServiceId, kind: EdgeKind) -> bool {
    if has_notifier(repo, src, sink, kind) {
        tracing::error!(
            "{}: {:?} observer service {}: notifier loop detected.",
            repo.service(src).name(),
            kind,
            repo.service(sink).name(),
        );
        return false;
    }

    match kind {
        EdgeKind::Starton => {
            repo.service_mut(sink).starton_notifiers.push(src);
            repo.service_mut(src).starton_observers.push(sink);
        }
        EdgeKind::Stopon => {
            repo.service_mut(sink).stopon_notifiers.push(src);
            repo.service_mut(src).stopon_observers.push(sink);
        }
    }

    tracing::debug!(
        "{}: {:?} observer service {} registered.",
        repo.service(src).name(),
        kind,
        repo.service(sink).name(),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ServiceDescriptor;
    use nix::sys::signal::Signal;

    fn stub(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_owned(),
            origin: format!("{name}.conf"),
            description: None,
            stdin: None,
            stdout: None,
            environ: Vec::new(),
            start_cmds: Vec::new(),
            daemon: Some(vec!["/bin/true".to_owned()]),
            stop_cmds: Vec::new(),
            stop_sig: Signal::SIGTERM,
            reload_sig: Signal::SIGTERM,
            starton: Vec::new(),
            stopon: Vec::new(),
        }
    }

    #[test]
    fn rejects_direct_cycle() {
        let mut repo = Repository::new();
        let a = repo.insert(stub("a"));
        let b = repo.insert(stub("b"));
        assert!(register_edge(&mut repo, a, b, EdgeKind::Starton));
        // b already (transitively) depends on a; registering b -> a would close the loop.
        assert!(!register_edge(&mut repo, b, a, EdgeKind::Starton));
        assert_eq!(repo.service(a).starton_notifiers, Vec::<ServiceId>::new());
    }

    #[test]
    fn rejects_self_edge() {
        let mut repo = Repository::new();
        let a = repo.insert(stub("a"));
        assert!(!register_edge(&mut repo, a, a, EdgeKind::Starton));
    }

    #[test]
    fn allows_chain() {
        let mut repo = Repository::new();
        let a = repo.insert(stub("a"));
        let b = repo.insert(stub("b"));
        let c = repo.insert(stub("c"));
        assert!(register_edge(&mut repo, a, b, EdgeKind::Starton));
        assert!(register_edge(&mut repo, b, c, EdgeKind::Starton));
        assert!(repo.service(c).starton_notifiers.contains(&b));
    }
}
