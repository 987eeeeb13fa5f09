//! Disposition of local store files that diverged from the cluster history.
//!
//! Quarantine directories live inside the store directory and are named
//! `branched-<millis>`; they are never treated as store files themselves, so
//! running a policy repeatedly never nests quarantines.

use crate::config::ConfigError;
use crate::storage::MESSAGES_LOG_NAME;
use log::{info, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub const BRANCH_PREFIX: &str = "branched-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchedDataPolicy {
    #[default]
    KeepAll,
    KeepLast,
    KeepNone,
    Shutdown,
}

/// What the node must do after a policy ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Files were moved into this quarantine directory; copy a fresh store.
    Quarantined(PathBuf),
    /// Files were deleted; copy a fresh store.
    Deleted,
    /// Stop the node instead of recovering.
    ShutdownNode,
}

impl BranchedDataPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchedDataPolicy::KeepAll => "keep_all",
            BranchedDataPolicy::KeepLast => "keep_last",
            BranchedDataPolicy::KeepNone => "keep_none",
            BranchedDataPolicy::Shutdown => "shutdown",
        }
    }

    pub fn handle(&self, store_dir: &Path) -> io::Result<PolicyOutcome> {
        match self {
            BranchedDataPolicy::KeepAll => keep_all(store_dir),
            BranchedDataPolicy::KeepLast => keep_last(store_dir),
            BranchedDataPolicy::KeepNone => keep_none(store_dir),
            BranchedDataPolicy::Shutdown => Ok(PolicyOutcome::ShutdownNode),
        }
    }
}

impl FromStr for BranchedDataPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "keep_all" => Ok(BranchedDataPolicy::KeepAll),
            "keep_last" => Ok(BranchedDataPolicy::KeepLast),
            "keep_none" => Ok(BranchedDataPolicy::KeepNone),
            "shutdown" => Ok(BranchedDataPolicy::Shutdown),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for BranchedDataPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn keep_all(store_dir: &Path) -> io::Result<PolicyOutcome> {
    let quarantine = create_branched_data_dir(store_dir)?;
    move_away(store_dir, &quarantine)?;
    Ok(PolicyOutcome::Quarantined(quarantine))
}

fn keep_last(store_dir: &Path) -> io::Result<PolicyOutcome> {
    let quarantine = create_branched_data_dir(store_dir)?;
    move_away(store_dir, &quarantine)?;
    for entry in fs::read_dir(store_dir)? {
        let path = entry?.path();
        if is_branched_data_dir(&path) && path != quarantine {
            if let Err(err) = fs::remove_dir_all(&path) {
                warn!(
                    "event=branched_data_cleanup_failed path={} error={err}",
                    path.display()
                );
            }
        }
    }
    Ok(PolicyOutcome::Quarantined(quarantine))
}

fn keep_none(store_dir: &Path) -> io::Result<PolicyOutcome> {
    for path in relevant_store_files(store_dir)? {
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = removed {
            warn!("event=branched_data_delete_failed path={} error={err}", path.display());
        }
    }
    info!("event=branched_data_deleted store_dir={}", store_dir.display());
    Ok(PolicyOutcome::Deleted)
}

fn move_away(store_dir: &Path, quarantine: &Path) -> io::Result<()> {
    for path in relevant_store_files(store_dir)? {
        let Some(name) = path.file_name() else {
            continue;
        };
        if let Err(err) = fs::rename(&path, quarantine.join(name)) {
            warn!("event=branched_data_move_failed path={} error={err}", path.display());
        }
    }
    info!(
        "event=branched_data_quarantined store_dir={} quarantine={}",
        store_dir.display(),
        quarantine.display()
    );
    Ok(())
}

/// Creates a fresh `branched-<millis>` directory, suffixing it if one already exists.
pub fn create_branched_data_dir(store_dir: &Path) -> io::Result<PathBuf> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let base = format!("{BRANCH_PREFIX}{millis}");
    let mut candidate = store_dir.join(&base);
    let mut suffix = 0u32;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                suffix += 1;
                candidate = store_dir.join(format!("{base}-{suffix}"));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Store entries a policy acts on: everything but the diagnostic log and quarantines.
pub fn relevant_store_files(store_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(store_dir)? {
        let path = entry?.path();
        let is_messages_log = path
            .file_name()
            .map(|name| name == MESSAGES_LOG_NAME)
            .unwrap_or(false);
        if !is_messages_log && !is_branched_data_dir(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn is_branched_data_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(BRANCH_PREFIX))
            .unwrap_or(false)
}

/// Quarantine directories currently present in `store_dir`.
pub fn branched_data_dirs(store_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(store_dir)? {
        let path = entry?.path();
        if is_branched_data_dir(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
