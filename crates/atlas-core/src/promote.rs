//! Moves a staged restore into the live locations after shutdown.
//!
//! Each unit (legacy docs tree, content tree, database, history) is promoted
//! on its own. A unit that fails is rolled back from its `.old.<stamp>` copy
//! and the remaining units still run; there is no rollback across units.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::backup::{CONTENT_PREFIX, HISTORY_PREFIX};
use crate::paths::{ContentClass, ContentPaths};
use crate::restore::LEGACY_DOCS_PREFIX;

/// SQLite companions that must not outlive the database they belong to.
const DATABASE_SIDECARS: [&str; 2] = ["-wal", "-shm"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: &'static str,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Done,
    PartiallyPromoted { failures: Vec<UnitFailure> },
}

pub struct FinalizePromoter {
    paths: ContentPaths,
}

impl FinalizePromoter {
    pub fn new(paths: ContentPaths) -> Self {
        Self { paths }
    }

    /// Promote everything found in `stage`. The staging directory is removed
    /// afterwards whatever the outcome.
    ///
    /// Must only run once the server has stopped and the index store is
    /// closed.
    pub fn promote(&self, stage: &Path) -> PromotionOutcome {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let mut failures = Vec::new();
        let mut run = |unit: &'static str, result: io::Result<bool>| match result {
            Ok(true) => tracing::info!("Promoted {}", unit),
            Ok(false) => tracing::debug!("Nothing staged for {}", unit),
            Err(e) => {
                tracing::error!("Failed to promote {}: {}", unit, e);
                failures.push(UnitFailure {
                    unit,
                    error: e.to_string(),
                });
            }
        };

        run("docs", self.promote_legacy_docs(stage, &stamp));
        run("content", self.promote_content(stage));
        run("database", self.promote_database(stage, &stamp));
        run("history", self.promote_history(stage, &stamp));

        if let Err(e) = fs::remove_dir_all(stage) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove staging dir {}: {}", stage.display(), e);
            }
        }

        if failures.is_empty() {
            PromotionOutcome::Done
        } else {
            PromotionOutcome::PartiallyPromoted { failures }
        }
    }

    fn promote_legacy_docs(&self, stage: &Path, stamp: &str) -> io::Result<bool> {
        let staged = stage.join(LEGACY_DOCS_PREFIX);
        if !staged.is_dir() {
            return Ok(false);
        }
        swap_into_place(&staged, &self.paths.published_root, stamp)?;
        Ok(true)
    }

    /// Copies staged content over the live roots. Files absent from the
    /// backup are left alone.
    fn promote_content(&self, stage: &Path) -> io::Result<bool> {
        let content = stage.join(CONTENT_PREFIX);
        if !content.is_dir() {
            return Ok(false);
        }
        let published = self.paths.class_root(ContentClass::Published);
        let targets = [
            (content.join(ContentClass::Published.dir_name()), published),
            (content.join(LEGACY_DOCS_PREFIX), published),
            (
                content.join(ContentClass::Unlisted.dir_name()),
                self.paths.class_root(ContentClass::Unlisted),
            ),
            (
                content.join(ContentClass::Drafts.dir_name()),
                self.paths.class_root(ContentClass::Drafts),
            ),
        ];
        fs::create_dir_all(published)?;
        for (source, target) in targets {
            if source.is_dir() {
                let copied = copy_tree(&source, target)?;
                tracing::debug!("Copied {} files into {}", copied, target.display());
            }
        }
        Ok(true)
    }

    fn promote_database(&self, stage: &Path, stamp: &str) -> io::Result<bool> {
        let staged = stage.join(self.paths.database_file_name());
        if !staged.is_file() {
            return Ok(false);
        }
        let live = &self.paths.database;

        let mut moved = Vec::new();
        for suffix in DATABASE_SIDECARS {
            let sidecar = with_suffix(live, suffix);
            if sidecar.exists() {
                let aside = aside_path(&sidecar, stamp)?;
                if let Err(e) = fs::rename(&sidecar, &aside) {
                    restore_all(&moved);
                    return Err(e);
                }
                moved.push((sidecar, aside));
            }
        }

        if let Err(e) = swap_into_place(&staged, live, stamp) {
            restore_all(&moved);
            return Err(e);
        }
        for (_, aside) in moved {
            remove_path(&aside);
        }
        Ok(true)
    }

    fn promote_history(&self, stage: &Path, stamp: &str) -> io::Result<bool> {
        let staged = stage.join(HISTORY_PREFIX);
        if !staged.is_dir() {
            return Ok(false);
        }
        swap_into_place(&staged, &self.paths.history_dir, stamp)?;
        Ok(true)
    }
}

/// Rename `live` aside, move `staged` into its place, then drop the aside
/// copy. If the move fails the aside copy is renamed back.
fn swap_into_place(staged: &Path, live: &Path, stamp: &str) -> io::Result<()> {
    let aside = aside_path(live, stamp)?;
    let had_live = live.symlink_metadata().is_ok();
    if had_live {
        fs::rename(live, &aside)?;
    }

    let moved = live
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|_| move_path(staged, live));
    if let Err(e) = moved {
        remove_path(live);
        if had_live {
            if let Err(restore) = fs::rename(&aside, live) {
                tracing::error!(
                    "Could not restore {} from {}: {}",
                    live.display(),
                    aside.display(),
                    restore
                );
            }
        }
        return Err(e);
    }

    if had_live {
        remove_path(&aside);
    }
    Ok(())
}

/// Rename, falling back to a copy when the staging area sits on another
/// filesystem.
fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "Rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            if from.is_dir() {
                copy_tree(from, to).map(|_| ())
            } else {
                fs::copy(from, to).map(|_| ())
            }
        }
    }
}

/// Copy every file under `from` into `to`, overwriting same-named files.
fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn aside_path(live: &Path, stamp: &str) -> io::Result<PathBuf> {
    let name = live.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", live.display()),
        )
    })?;
    let mut aside = name.to_owned();
    aside.push(format!(".old.{stamp}"));
    Ok(live.with_file_name(aside))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn restore_all(moved: &[(PathBuf, PathBuf)]) {
    for (original, aside) in moved {
        if let Err(e) = fs::rename(aside, original) {
            tracing::error!("Could not restore {}: {}", original.display(), e);
        }
    }
}

fn remove_path(path: &Path) {
    let result = match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}
