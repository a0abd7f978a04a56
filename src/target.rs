//! Target resolution and whole-target start/stop/switch, grounded in the original program's
//! `target.c` symlink-directory walk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::is_valid_name;
use crate::repository::Repository;
use crate::service::{RunState, ServiceId};
use crate::signal_channel::SignalChannel;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid target name")]
    InvalidName,
    #[error("target directory not found: {0}")]
    NotFound(std::io::Error),
}

/// Resolves `<root>/<target_name>/` into the set of `ServiceId`s its symlinks point at, matching
/// each symlink's target against a service's *origin filename* (e.g. `echo.conf`), not its
/// declared `name` — a service's `name` setting is free to differ from the file it was loaded
/// from. Entries that are not symlinks, that resolve outside `services_dir`, or that name an
/// unknown origin are warned about and skipped rather than failing the whole walk.
fn resolve(
    repo: &Repository,
    root: &Path,
    services_dir: &Path,
    target_name: &str,
) -> Result<Vec<ServiceId>, TargetError> {
    if !is_valid_name(target_name) {
        return Err(TargetError::InvalidName);
    }
    let target_dir = root.join(target_name);
    let entries = std::fs::read_dir(&target_dir).map_err(TargetError::NotFound)?;

    let services_dir = services_dir
        .canonicalize()
        .unwrap_or_else(|_| services_dir.to_path_buf());

    let mut ids = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.file_type().is_symlink() {
            tracing::warn!("{}: not a symlink, skipping.", path.display());
            continue;
        }
        let resolved = match std::fs::canonicalize(&path) {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!("{}: dangling symlink, skipping.", path.display());
                continue;
            }
        };
        if !resolved.starts_with(&services_dir) {
            tracing::warn!("{}: resolves outside the services directory, skipping.", path.display());
            continue;
        }
        let origin = match resolved.file_name().and_then(|s| s.to_str()) {
            Some(n) => n,
            None => continue,
        };
        match repo.find_by_origin(origin) {
            Some(id) => ids.push(id),
            None => tracing::warn!("{target_name}: unknown service '{origin}', skipping."),
        }
    }
    Ok(ids)
}

/// Starts every service named by `<root>/<target_name>/`'s symlinks, in directory-enumeration
/// order, and puts `sigchan` into RUNNING mode. Dependency ordering among the collected services
/// is enforced at runtime by the observer graph, not by this walk.
pub fn start(
    repo: &mut Repository,
    root: &Path,
    services_dir: &Path,
    target_name: &str,
    sigchan: &mut SignalChannel,
) -> Result<PathBuf, TargetError> {
    let ids = resolve(repo, root, services_dir, target_name)?;
    sigchan.begin_running();
    for id in ids {
        repo.start(id);
    }
    Ok(root.join(target_name))
}

/// Stops every active (STARTING or READY) service in the whole repository and arms the
/// SignalChannel's drain counter with however many are not already STOPPED once `stop()`
/// returns.
pub fn stop(repo: &mut Repository, sigchan: &mut SignalChannel) {
    let mut remaining = 0u32;
    for id in repo.ids() {
        let state = repo.service(id).state;
        if matches!(state, RunState::Starting | RunState::Ready) {
            repo.stop(id);
        }
        if repo.service(id).state != RunState::Stopped {
            remaining += 1;
        }
    }
    sigchan.begin_draining(remaining);
}

/// Computes the new target's service set; stops services that leave the set, starts services
/// that join it, and leaves the overlap untouched.
pub fn switch(
    repo: &mut Repository,
    root: &Path,
    services_dir: &Path,
    target_name: &str,
) -> Result<PathBuf, TargetError> {
    let new_set: HashSet<ServiceId> = resolve(repo, root, services_dir, target_name)?
        .into_iter()
        .collect();

    for id in repo.ids() {
        let active = matches!(
            repo.service(id).state,
            RunState::Starting | RunState::Ready
        );
        let stopped_or_stopping = matches!(
            repo.service(id).state,
            RunState::Stopped | RunState::Stopping
        );
        if !new_set.contains(&id) && active {
            repo.stop(id);
        } else if new_set.contains(&id) && stopped_or_stopping {
            repo.start(id);
        }
    }
    Ok(root.join(target_name))
}
