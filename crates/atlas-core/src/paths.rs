//! Filesystem layout shared by every component.
//!
//! A [`ContentPaths`] is built once at startup and handed to constructors;
//! nothing reads these locations from process-global state.

use std::io;
use std::path::{Path, PathBuf};

pub const DATABASE_FILE_NAME: &str = "app.db";
pub const SECRET_FILE_NAME: &str = "secret.key";

/// The three content classes, in sync priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentClass {
    Published,
    Unlisted,
    Drafts,
}

impl ContentClass {
    pub const ALL: [ContentClass; 3] = [
        ContentClass::Published,
        ContentClass::Unlisted,
        ContentClass::Drafts,
    ];

    /// Directory name used both on disk and inside backup archives.
    pub fn dir_name(self) -> &'static str {
        match self {
            ContentClass::Published => "published",
            ContentClass::Unlisted => "unlisted",
            ContentClass::Drafts => "drafts",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<ContentClass> {
        ContentClass::ALL.into_iter().find(|class| class.dir_name() == name)
    }
}

#[derive(Clone, Debug)]
pub struct ContentPaths {
    pub content_root: PathBuf,
    pub published_root: PathBuf,
    pub unlisted_root: PathBuf,
    pub drafts_root: PathBuf,
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub history_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub secret_file: PathBuf,
}

impl ContentPaths {
    pub fn new(content_root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let content_root = content_root.into();
        let data_dir = data_dir.into();
        Self {
            published_root: content_root.join(ContentClass::Published.dir_name()),
            unlisted_root: content_root.join(ContentClass::Unlisted.dir_name()),
            drafts_root: content_root.join(ContentClass::Drafts.dir_name()),
            database: data_dir.join(DATABASE_FILE_NAME),
            history_dir: data_dir.join("history"),
            backups_dir: data_dir.join("backups"),
            secret_file: data_dir.join(SECRET_FILE_NAME),
            content_root,
            data_dir,
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.published_root,
            &self.unlisted_root,
            &self.drafts_root,
            &self.data_dir,
            &self.history_dir,
            &self.backups_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn class_root(&self, class: ContentClass) -> &Path {
        match class {
            ContentClass::Published => &self.published_root,
            ContentClass::Unlisted => &self.unlisted_root,
            ContentClass::Drafts => &self.drafts_root,
        }
    }

    /// Per-user draft root: `drafts/<sanitized user name>`.
    pub fn draft_root_for(&self, username: &str) -> PathBuf {
        self.drafts_root.join(draft_owner_dir(username))
    }

    /// File name of the database, as stored inside backup archives.
    pub fn database_file_name(&self) -> &str {
        self.database
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(DATABASE_FILE_NAME)
    }
}

/// Collapse a user name into a single safe directory segment.
pub fn draft_owner_dir(username: &str) -> String {
    let cleaned = username
        .trim()
        .replace(['\\', '/'], "_")
        .replace("..", "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Index key of a draft: drafts share one namespace with the other classes,
/// so each user's drafts are keyed under their owner directory.
pub fn draft_index_slug(owner_dir: &str, slug: &str) -> String {
    format!("{owner_dir}/{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_derived_from_two_roots() {
        let paths = ContentPaths::new("/srv/content", "/srv/data");
        assert_eq!(paths.published_root, PathBuf::from("/srv/content/published"));
        assert_eq!(paths.unlisted_root, PathBuf::from("/srv/content/unlisted"));
        assert_eq!(paths.drafts_root, PathBuf::from("/srv/content/drafts"));
        assert_eq!(paths.database, PathBuf::from("/srv/data/app.db"));
        assert_eq!(paths.secret_file, PathBuf::from("/srv/data/secret.key"));
        assert_eq!(paths.database_file_name(), "app.db");
    }

    #[test]
    fn draft_owner_dir_flattens_separators() {
        assert_eq!(draft_owner_dir("alice"), "alice");
        assert_eq!(draft_owner_dir("a/b\\c"), "a_b_c");
        assert_eq!(draft_owner_dir("../etc"), "__etc");
        assert_eq!(draft_owner_dir("..."), "_");
        assert_eq!(draft_owner_dir("  "), "unknown");
        assert_eq!(draft_owner_dir(".hidden."), "hidden");
    }

    #[test]
    fn class_names_round_trip_and_drafts_are_keyed_by_owner() {
        for class in ContentClass::ALL {
            assert_eq!(ContentClass::from_dir_name(class.dir_name()), Some(class));
        }
        assert_eq!(ContentClass::from_dir_name("trash"), None);
        assert_eq!(draft_index_slug("alice", "notes/idea"), "alice/notes/idea");
    }

    #[test]
    fn ensure_dirs_creates_every_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ContentPaths::new(tmp.path().join("content"), tmp.path().join("data"));
        paths.ensure_dirs().unwrap();
        assert!(paths.published_root.is_dir());
        assert!(paths.unlisted_root.is_dir());
        assert!(paths.drafts_root.is_dir());
        assert!(paths.history_dir.is_dir());
        assert!(paths.backups_dir.is_dir());
    }
}
