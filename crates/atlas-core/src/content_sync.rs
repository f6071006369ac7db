use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

use crate::document::{extract_title, format_timestamp, mint_doc_id, parent_slug, DocStatus, IndexedDocument};
use crate::error::StoreError;
use crate::front_matter;
use crate::link_parser::{extract_link_tokens, resolve_link_ids, LinkToken};
use crate::paths::{draft_index_slug, ContentPaths};
use crate::slug_resolver::SlugResolver;
use crate::store::{IndexStore, SyncWrite};

// ---------------------------------------------------------------------------
// Scan results
// ---------------------------------------------------------------------------

/// One content root and what it implies for the files under it.
#[derive(Clone, Debug)]
struct ScanRoot {
    root: PathBuf,
    status: DocStatus,
    default_owner: String,
    /// Set for draft roots: slugs are indexed as `<owner dir>/<slug>`.
    key_prefix: Option<String>,
}

impl ScanRoot {
    fn index_slug(&self, slug: String) -> String {
        match &self.key_prefix {
            Some(prefix) => draft_index_slug(prefix, &slug),
            None => slug,
        }
    }
}

/// A markdown file read during a scan, with its id already persisted.
#[derive(Clone, Debug)]
struct ScannedFile {
    slug: String,
    path: PathBuf,
    doc_id: String,
    status: DocStatus,
    owner: String,
    updated_at: String,
    tokens: Vec<LinkToken>,
    raw: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub ids_minted: usize,
    /// Files skipped because a higher-priority root already claimed the slug.
    pub duplicates: Vec<String>,
    /// Files that could not be read or rewritten.
    pub unreadable: Vec<String>,
    #[serde(flatten)]
    pub write: SyncWrite,
}

// ---------------------------------------------------------------------------
// ContentSynchronizer
// ---------------------------------------------------------------------------

/// Rebuilds the derived index from the markdown files.
///
/// Roots are scanned in priority order (published, unlisted, then each
/// user's draft directory). Drafts are keyed under their owner directory, so
/// two users' drafts never collide with each other. The first file to claim a
/// slug wins. Files
/// without an id get one minted and written back before they are indexed, so
/// a second pass over unchanged files writes nothing and produces the same
/// rows.
pub struct ContentSynchronizer {
    paths: ContentPaths,
    store: Arc<IndexStore>,
}

impl ContentSynchronizer {
    pub fn new(paths: ContentPaths, store: Arc<IndexStore>) -> Self {
        Self { paths, store }
    }

    pub fn sync_all(&self) -> Result<SyncReport, StoreError> {
        tracing::info!("Synchronizing content index from {}", self.paths.content_root.display());
        let mut report = SyncReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut files: Vec<ScannedFile> = Vec::new();

        for scan_root in self.scan_roots() {
            let resolver = SlugResolver::new(&scan_root.root);
            for path in markdown_files(&scan_root.root) {
                report.scanned += 1;
                let Some(slug) = resolver.slug_for_file(&path) else {
                    tracing::debug!("No slug for {}, skipping", path.display());
                    continue;
                };
                let slug = scan_root.index_slug(slug);
                if seen.contains(&slug) {
                    tracing::warn!(
                        "Slug {} from {} already claimed by a higher-priority root, skipping",
                        slug,
                        path.display()
                    );
                    report.duplicates.push(path.display().to_string());
                    continue;
                }
                match read_and_stamp(&path, &scan_root) {
                    Ok((mut file, minted)) => {
                        if minted {
                            report.ids_minted += 1;
                        }
                        file.slug = slug.clone();
                        seen.insert(slug);
                        files.push(file);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read {}: {}", path.display(), e);
                        report.unreadable.push(path.display().to_string());
                    }
                }
            }
        }

        let slug_to_id: HashMap<String, String> = files
            .iter()
            .map(|f| (f.slug.clone(), f.doc_id.clone()))
            .collect();
        let docs: Vec<IndexedDocument> = files
            .into_iter()
            .map(|file| {
                let links = resolve_link_ids(&file.tokens, &slug_to_id, &file.doc_id);
                IndexedDocument {
                    title: extract_title(&file.raw, &file.slug),
                    parent_slug: parent_slug(&file.slug).to_string(),
                    doc_id: file.doc_id,
                    slug: file.slug,
                    path: file.path,
                    status: file.status,
                    owner: file.owner,
                    updated_at: file.updated_at,
                    links,
                    body: file.raw,
                }
            })
            .collect();

        report.write = self.store.apply_sync(&docs)?;
        tracing::info!(
            "Content sync complete: {} files scanned, {} indexed, {} ids minted, {} duplicates, {} removed",
            report.scanned,
            report.write.upserted,
            report.ids_minted,
            report.duplicates.len(),
            report.write.removed
        );
        Ok(report)
    }

    fn scan_roots(&self) -> Vec<ScanRoot> {
        let mut roots = vec![
            ScanRoot {
                root: self.paths.published_root.clone(),
                status: DocStatus::Published,
                default_owner: String::new(),
                key_prefix: None,
            },
            ScanRoot {
                root: self.paths.unlisted_root.clone(),
                status: DocStatus::Unlisted,
                default_owner: String::new(),
                key_prefix: None,
            },
        ];
        let mut user_dirs: Vec<(String, PathBuf)> = std::fs::read_dir(&self.paths.drafts_root)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| {
                        let name = e.file_name().to_str()?.to_string();
                        (!name.starts_with('.')).then(|| (name, e.path()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        user_dirs.sort();
        roots.extend(user_dirs.into_iter().map(|(owner, root)| ScanRoot {
            root,
            status: DocStatus::Draft,
            key_prefix: Some(owner.clone()),
            default_owner: owner,
        }));
        roots
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Markdown files under `root`, sorted by path, skipping dot-entries.
fn markdown_files(root: &Path) -> Vec<PathBuf> {
    if !root.is_dir() {
        tracing::debug!("Content root {} does not exist, skipping", root.display());
        return Vec::new();
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Error walking {}: {}", root.display(), e);
                None
            }
        })
        .filter(|e| e.file_type().is_file() && has_md_extension(e.path()))
        .map(DirEntry::into_path)
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

fn has_md_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// Read a file, minting and writing back an id when it has none.
/// Returns the scanned file (slug left empty) and whether an id was minted.
fn read_and_stamp(path: &Path, scan_root: &ScanRoot) -> std::io::Result<(ScannedFile, bool)> {
    let mut raw = std::fs::read_to_string(path)?;
    let (meta, _) = front_matter::parse(&raw);
    let mut minted = false;
    let doc_id = match meta.id.clone() {
        Some(id) => id,
        None => {
            let id = mint_doc_id();
            if let Some(updated) = front_matter::ensure_id(&raw, &id) {
                std::fs::write(path, &updated)?;
                raw = updated;
            }
            tracing::info!("Assigned id {} to {}", id, path.display());
            minted = true;
            id
        }
    };

    let status = match scan_root.status {
        DocStatus::Draft => DocStatus::Draft,
        implied => meta
            .status
            .as_deref()
            .and_then(DocStatus::from_front_matter)
            .unwrap_or(implied),
    };
    let owner = meta
        .owner
        .clone()
        .unwrap_or_else(|| scan_root.default_owner.clone());
    let modified = std::fs::metadata(path)?.modified()?;
    let tokens = extract_link_tokens(front_matter::strip(&raw));

    Ok((
        ScannedFile {
            slug: String::new(),
            path: path.to_path_buf(),
            doc_id,
            status,
            owner,
            updated_at: format_timestamp(modified),
            tokens,
            raw,
        },
        minted,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
