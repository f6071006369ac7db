//! Point-in-time copies of documents, written on every save.

use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::error::DocumentError;
use crate::store::IndexStore;

#[derive(Clone, Debug)]
pub struct HistoryRecorder {
    root: PathBuf,
}

impl HistoryRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `data` under `<root>/<timestamp>/<flattened slug>.md` and record
    /// the snapshot in the index.
    pub fn record(
        &self,
        store: &IndexStore,
        slug: &str,
        note: Option<&str>,
        data: &[u8],
    ) -> Result<PathBuf, DocumentError> {
        let dir = self
            .root
            .join(Utc::now().format("%Y%m%d_%H%M%S%.9f").to_string());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(snapshot_file_name(slug));
        if !path.starts_with(&dir) {
            return Err(DocumentError::Metadata(format!("invalid history path for {slug}")));
        }
        std::fs::write(&path, data)?;
        store.record_history(slug, &path, note)?;
        tracing::debug!("Recorded history for {} at {}", slug, path.display());
        Ok(path)
    }
}

/// Single-segment file name for a slug's snapshot.
pub fn snapshot_file_name(slug: &str) -> String {
    let clean = slug
        .trim()
        .trim_start_matches('/')
        .replace("..", "_")
        .replace(['/', '\\'], "_");
    let name = if clean.is_empty() { "entry".to_string() } else { clean };
    if name.to_ascii_lowercase().ends_with(".md") {
        name
    } else {
        format!("{name}.md")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::open_store;

    #[test]
    fn snapshot_names_are_flat() {
        assert_eq!(snapshot_file_name("guides/setup"), "guides_setup.md");
        assert_eq!(snapshot_file_name("../../etc/passwd"), "____etc_passwd.md");
        assert_eq!(snapshot_file_name(""), "entry.md");
        assert_eq!(snapshot_file_name("notes.MD"), "notes.MD");
    }

    #[test]
    fn record_writes_file_and_row() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let recorder = HistoryRecorder::new(tmp.path().join("history"));

        let path = recorder.record(&store, "a/b", Some("edit"), b"old text").unwrap();
        assert!(path.starts_with(recorder.root()));
        assert_eq!(std::fs::read(&path).unwrap(), b"old text");

        let entries = store.history_for("a/b").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].note.as_deref(), Some("edit"));
        assert_eq!(entries[0].file_path, path.to_string_lossy());
    }
}
