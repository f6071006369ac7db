//! Staging of verified backups and the single-slot handoff to the promoter.
//!
//! A restore request verifies the archive, extracts it into a fresh
//! quarantine directory and parks it in the [`RestoreCoordinator`]. The
//! serving process notices the parked restore, shuts down, and only then
//! promotes the staged files into place.

use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Notify;
use zip::ZipArchive;

use crate::backup::{BackupEngine, CONTENT_PREFIX};
use crate::error::RestoreError;

/// Top-level tree carried by archives from before the content split.
pub const LEGACY_DOCS_PREFIX: &str = "docs";

#[derive(Clone, Debug, Default, Serialize)]
pub struct StageReport {
    pub extracted: usize,
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Extract `archive` into the empty directory `quarantine`.
///
/// Entries whose names are absolute, empty or climb out of the quarantine are
/// skipped. The result must contain a `content/` or `docs/` tree or the
/// database file, otherwise the archive is rejected.
pub fn stage_backup_zip(
    archive: &Path,
    quarantine: &Path,
    database_file_name: &str,
) -> Result<StageReport, RestoreError> {
    let root = quarantine.canonicalize()?;
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut report = StageReport::default();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let raw_name = entry.name().to_string();
        let Some(rel) = clean_entry_name(&raw_name) else {
            tracing::warn!("Skipping unsafe archive entry {:?}", raw_name);
            report.skipped.push(raw_name);
            continue;
        };

        let dest = root.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            if !dest.canonicalize()?.starts_with(&root) {
                tracing::warn!("Archive directory {:?} escapes the staging area", raw_name);
                report.skipped.push(raw_name);
            }
            continue;
        }

        let (Some(parent), Some(file_name)) = (dest.parent(), dest.file_name()) else {
            report.skipped.push(raw_name);
            continue;
        };
        std::fs::create_dir_all(parent)?;
        let parent = parent.canonicalize()?;
        if !parent.starts_with(&root) {
            tracing::warn!("Archive entry {:?} escapes the staging area", raw_name);
            report.skipped.push(raw_name);
            continue;
        }
        let mut out = File::create(parent.join(file_name))?;
        io::copy(&mut entry, &mut out)?;
        report.extracted += 1;
    }

    let compatible = root.join(CONTENT_PREFIX).is_dir()
        || root.join(LEGACY_DOCS_PREFIX).is_dir()
        || root.join(database_file_name).is_file();
    if !compatible {
        return Err(RestoreError::Incompatible);
    }
    tracing::info!(
        "Staged {} entries from {} ({} skipped)",
        report.extracted,
        archive.display(),
        report.skipped.len()
    );
    Ok(report)
}

/// Normalize an archive entry name into a relative path, or `None` when it
/// is empty, absolute, or would climb above the extraction root.
fn clean_entry_name(raw: &str) -> Option<PathBuf> {
    let name = raw.replace('\\', "/");
    if name.starts_with('/') || name.as_bytes().get(1) == Some(&b':') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

// ---------------------------------------------------------------------------
// RestoreCoordinator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    /// A verified backup is staged and waiting for the server to stop.
    Staged(PathBuf),
    Promoting(PathBuf),
}

/// At most one restore may be pending. A second request while one is staged
/// or being promoted is refused with [`RestoreError::Conflict`].
pub struct RestoreCoordinator {
    state: Mutex<RestoreState>,
    notify: Notify,
}

impl Default for RestoreCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RestoreCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RestoreState::Idle),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == RestoreState::Idle
    }

    /// Park a staged directory. Fails if the slot is taken.
    pub fn submit(&self, staging: PathBuf) -> Result<(), RestoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != RestoreState::Idle {
            return Err(RestoreError::Conflict);
        }
        tracing::info!("Restore staged at {}", staging.display());
        *state = RestoreState::Staged(staging);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Verify, stage and park a backup from the backups directory.
    ///
    /// Conflicts are detected before anything is written, and again when
    /// claiming the slot; a losing request removes only its own staging
    /// directory.
    pub fn request_restore(
        &self,
        engine: &BackupEngine,
        backup_name: &str,
    ) -> Result<PathBuf, RestoreError> {
        if !self.is_idle() {
            return Err(RestoreError::Conflict);
        }
        let archive = engine.resolve_backup_file(backup_name)?;
        if !engine.verify_backup(&archive)? {
            return Err(RestoreError::Verification(backup_name.to_string()));
        }

        let staging = engine.new_staging_dir()?;
        let staged = stage_backup_zip(&archive, &staging, engine.paths().database_file_name())
            .and_then(|_| self.submit(staging.clone()));
        if let Err(e) = staged {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                tracing::warn!("Failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }
        Ok(staging)
    }

    /// Resolves once a restore is staged. Does not change the state.
    pub async fn wait_for_staged(&self) -> PathBuf {
        loop {
            if let RestoreState::Staged(path) = self.state() {
                return path;
            }
            self.notify.notified().await;
        }
    }

    /// Staged → Promoting. Returns the staging directory to promote.
    pub fn begin_promotion(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            RestoreState::Staged(path) => {
                let path = path.clone();
                *state = RestoreState::Promoting(path.clone());
                Some(path)
            }
            _ => None,
        }
    }

    pub fn finish(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RestoreState::Idle;
    }

    /// Drop a staged restore that will not be promoted: remove its staging
    /// directory and return to Idle. Returns the directory that was dropped.
    pub fn abandon(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let RestoreState::Staged(path) = &*state else {
            return None;
        };
        let path = path.clone();
        *state = RestoreState::Idle;
        drop(state);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::info!("Abandoned staged restore at {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
        }
        Some(path)
    }
}
