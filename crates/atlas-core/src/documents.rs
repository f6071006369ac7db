//! Write path for single documents: the same normalization a full sync
//! applies, followed by a targeted upsert of just the touched row.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::document::{extract_title, format_timestamp, mint_doc_id, parent_slug, DocStatus, DocumentRow, IndexedDocument};
use crate::error::{DocumentError, SlugError};
use crate::front_matter::{self, FrontMatter};
use crate::history::HistoryRecorder;
use crate::link_parser::{extract_link_tokens, referenced_slugs, resolve_link_ids};
use crate::paths::{draft_index_slug, draft_owner_dir, ContentClass, ContentPaths};
use crate::slug_resolver::{parse_slug_param, SlugResolver};
use crate::store::IndexStore;

const DEFAULT_OWNER: &str = "owner";

/// The authenticated caller, passed explicitly to every write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: String,
}

impl CurrentUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SavedDocument {
    /// Slug relative to the class root.
    pub slug: String,
    /// Key of the index row; differs from `slug` for drafts.
    pub index_slug: String,
    pub doc_id: String,
    pub path: PathBuf,
    pub created: bool,
    /// False when a higher-priority file already owns `index_slug`.
    pub indexed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadedDocument {
    pub slug: String,
    pub index_slug: String,
    pub path: PathBuf,
    pub is_hub: bool,
    pub meta: FrontMatter,
    pub body: String,
    pub raw: String,
    pub row: Option<DocumentRow>,
}

pub struct DocumentService {
    paths: ContentPaths,
    store: Arc<IndexStore>,
    history: HistoryRecorder,
}

impl DocumentService {
    pub fn new(paths: ContentPaths, store: Arc<IndexStore>) -> Self {
        let history = HistoryRecorder::new(paths.history_dir.clone());
        Self {
            paths,
            store,
            history,
        }
    }

    fn index_slug(class: ContentClass, user: &CurrentUser, slug: &str) -> String {
        match class {
            ContentClass::Drafts => draft_index_slug(&draft_owner_dir(&user.username), slug),
            _ => slug.to_string(),
        }
    }

    /// Sync priority of the root holding `path`; lower wins.
    fn root_tier(&self, path: &Path) -> usize {
        ContentClass::ALL
            .iter()
            .position(|class| path.starts_with(self.paths.class_root(*class)))
            .unwrap_or(ContentClass::ALL.len())
    }

    /// The index row for `index_slug` when it belongs to some other file
    /// that still exists.
    fn foreign_row(
        &self,
        index_slug: &str,
        path: &Path,
    ) -> Result<Option<DocumentRow>, DocumentError> {
        Ok(self.store.document_by_slug(index_slug)?.filter(|row| {
            let other = Path::new(&row.path);
            other != path && other.is_file()
        }))
    }

    fn resolver(&self, class: ContentClass, user: &CurrentUser) -> SlugResolver {
        match class {
            ContentClass::Drafts => SlugResolver::new(self.paths.draft_root_for(&user.username)),
            other => SlugResolver::new(self.paths.class_root(other)),
        }
    }

    /// Create or update a document.
    ///
    /// `hub` forces the plain (`false`) or hub (`true`) layout; `None` keeps
    /// the current layout of an existing document and uses a plain file for a
    /// new one. A trailing `/_index` on the slug always means hub.
    pub fn save(
        &self,
        class: ContentClass,
        user: &CurrentUser,
        raw_slug: &str,
        content: &str,
        hub: Option<bool>,
    ) -> Result<SavedDocument, DocumentError> {
        let param = parse_slug_param(raw_slug);
        let resolver = self.resolver(class, user);
        resolver.resolve_for_create(raw_slug, hub.unwrap_or(false))?;

        let (plain, hub_path) = resolver.candidates(&param.slug)?;
        let existing = if plain.is_file() {
            Some((plain.clone(), false))
        } else if hub_path.is_file() {
            Some((hub_path.clone(), true))
        } else {
            None
        };
        let want_hub = param.explicit_hub
            || hub.unwrap_or_else(|| existing.as_ref().is_some_and(|(_, is_hub)| *is_hub));
        let target = if want_hub { hub_path } else { plain };

        let previous = match &existing {
            Some((path, _)) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        let previous_id = previous.as_deref().and_then(|raw| front_matter::parse(raw).0.id);
        let (content, doc_id, status) = self.normalize(class, user, content, previous_id)?;

        // Move between plain and hub layout before writing.
        if let Some((current, _)) = &existing {
            if *current != target {
                if target.exists() {
                    return Err(DocumentError::SlugTaken(param.slug.clone()));
                }
                create_parent(&target)?;
                std::fs::rename(current, &target)?;
                tracing::info!("Moved {} to {}", current.display(), target.display());
            }
        }

        let slug = resolver
            .slug_for_file(&target)
            .ok_or_else(|| SlugError::Escape(target.clone()))?;
        let index_slug = Self::index_slug(class, user, &slug);

        // Same rule as a full sync: the higher-priority root owns the key.
        let shadowed = match self.foreign_row(&index_slug, &target)? {
            Some(row) if self.root_tier(Path::new(&row.path)) <= self.root_tier(&target) => {
                if existing.is_none() {
                    return Err(DocumentError::SlugTaken(index_slug));
                }
                true
            }
            _ => false,
        };

        let (snapshot, note) = match &previous {
            Some(old) => (old.as_bytes(), "edit"),
            None => (content.as_bytes(), "create"),
        };
        if let Err(e) = self.history.record(&self.store, &index_slug, Some(note), snapshot) {
            tracing::warn!("Failed to record history for {}: {}", index_slug, e);
        }

        create_parent(&target)?;
        std::fs::write(&target, &content)?;
        if shadowed {
            tracing::warn!(
                "Saved {} but left the index alone: {} belongs to a higher-priority document",
                target.display(),
                index_slug
            );
        } else {
            self.index_file(&index_slug, &target, &doc_id, status, &content)?;
            if class == ContentClass::Published {
                self.store.ensure_start_page(&index_slug)?;
            }
        }
        tracing::info!("Saved document {} ({})", index_slug, doc_id);
        Ok(SavedDocument {
            slug,
            index_slug,
            doc_id,
            path: target,
            created: existing.is_none(),
            indexed: !shadowed,
        })
    }

    pub fn read(
        &self,
        class: ContentClass,
        user: &CurrentUser,
        raw_slug: &str,
    ) -> Result<LoadedDocument, DocumentError> {
        let resolver = self.resolver(class, user);
        let resolved = resolver.resolve(raw_slug, false)?;
        if !resolved.exists {
            return Err(DocumentError::NotFound(resolved.slug));
        }
        let raw = std::fs::read_to_string(&resolved.path)?;
        let slug = resolver
            .slug_for_file(&resolved.path)
            .unwrap_or_else(|| resolved.slug.clone());
        let (meta, body) = front_matter::parse(&raw);
        let body = body.to_string();
        let index_slug = Self::index_slug(class, user, &slug);
        let row = self
            .store
            .document_by_slug(&index_slug)?
            .filter(|row| Path::new(&row.path) == resolved.path);
        Ok(LoadedDocument {
            slug,
            index_slug,
            path: resolved.path,
            is_hub: resolved.is_hub,
            meta,
            body,
            raw,
            row,
        })
    }

    /// Remove the file and, when this file owns it, its index/search pair.
    /// Empty directories left behind inside a draft root are pruned.
    pub fn delete(
        &self,
        class: ContentClass,
        user: &CurrentUser,
        raw_slug: &str,
    ) -> Result<(), DocumentError> {
        let resolver = self.resolver(class, user);
        let resolved = resolver.resolve(raw_slug, false)?;
        if !resolved.exists {
            return Err(DocumentError::NotFound(resolved.slug));
        }
        let slug = resolver
            .slug_for_file(&resolved.path)
            .unwrap_or_else(|| resolved.slug.clone());
        let index_slug = Self::index_slug(class, user, &slug);
        let raw = std::fs::read(&resolved.path)?;
        if let Err(e) = self.history.record(&self.store, &index_slug, Some("delete"), &raw) {
            tracing::warn!("Failed to record history for {}: {}", index_slug, e);
        }
        std::fs::remove_file(&resolved.path)?;
        if class == ContentClass::Drafts {
            prune_empty_dirs(&resolved.path, resolver.root());
        }
        let owns_row = self
            .store
            .document_by_slug(&index_slug)?
            .is_some_and(|row| Path::new(&row.path) == resolved.path);
        if owns_row {
            self.store.delete_document_by_slug(&index_slug)?;
        }
        tracing::info!("Deleted document {}", index_slug);
        Ok(())
    }

    /// Apply id, status and owner defaults to incoming content.
    fn normalize(
        &self,
        class: ContentClass,
        user: &CurrentUser,
        content: &str,
        previous_id: Option<String>,
    ) -> Result<(String, String, DocStatus), DocumentError> {
        let (meta, _) = front_matter::parse(content);
        let doc_id = meta.id.clone().or(previous_id).unwrap_or_else(mint_doc_id);
        let mut content = front_matter::ensure_id(content, &doc_id).unwrap_or_else(|| content.to_string());

        let status = match class {
            ContentClass::Drafts => DocStatus::Draft,
            other => {
                let implied = if other == ContentClass::Unlisted {
                    DocStatus::Unlisted
                } else {
                    DocStatus::Published
                };
                match meta.status.as_deref() {
                    Some(raw) => DocStatus::from_front_matter(raw).ok_or_else(|| {
                        DocumentError::Metadata(format!("unsupported status {raw:?}"))
                    })?,
                    None if front_matter::has_key(&content, "status") => {
                        return Err(DocumentError::Metadata("empty status".to_string()));
                    }
                    None => {
                        if let Some(updated) = front_matter::set_field(&content, "status", implied.as_str()) {
                            content = updated;
                        }
                        implied
                    }
                }
            }
        };

        if meta.owner.is_none() {
            let owner = if user.username.trim().is_empty() {
                DEFAULT_OWNER
            } else {
                user.username.trim()
            };
            if let Some(updated) = front_matter::set_field(&content, "owner", owner) {
                content = updated;
            }
        }
        Ok((content, doc_id, status))
    }

    fn index_file(
        &self,
        slug: &str,
        path: &Path,
        doc_id: &str,
        status: DocStatus,
        content: &str,
    ) -> Result<(), DocumentError> {
        let (meta, body) = front_matter::parse(content);
        let tokens = extract_link_tokens(body);
        let mut slug_to_id: HashMap<String, String> =
            self.store.slug_map_for(&referenced_slugs(&tokens))?;
        slug_to_id.insert(slug.to_string(), doc_id.to_string());
        let modified = std::fs::metadata(path)?.modified()?;

        self.store.upsert_document(&IndexedDocument {
            doc_id: doc_id.to_string(),
            slug: slug.to_string(),
            title: extract_title(content, slug),
            path: path.to_path_buf(),
            parent_slug: parent_slug(slug).to_string(),
            status,
            owner: meta.owner.unwrap_or_default(),
            updated_at: format_timestamp(modified),
            links: resolve_link_ids(&tokens, &slug_to_id, doc_id),
            body: content.to_string(),
        })?;
        Ok(())
    }
}

fn create_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Remove empty directories from `path`'s parent up to (not including) `root`.
fn prune_empty_dirs(path: &Path, root: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}
