//! SQLite-backed derived index.
//!
//! Markdown files are authoritative; everything here can be rebuilt by a
//! full sync. Each `documents` row is paired with a `documents_fts` row that
//! shares its rowid, and every write path keeps the pair together inside one
//! transaction or savepoint.

use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::document::{now_timestamp, DocStatus, DocumentRow, IndexedDocument};
use crate::error::StoreError;

pub const START_PAGE_KEY: &str = "start_page";
pub const LAST_SYNC_KEY: &str = "content_index_last_sync";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT UNIQUE,
    slug TEXT UNIQUE NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    path TEXT NOT NULL,
    parent_slug TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'published',
    owner TEXT,
    created_at TEXT,
    updated_at TEXT,
    is_start_page INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_home INTEGER NOT NULL DEFAULT 0,
    links TEXT
);
CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent_slug);
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(slug, title, body);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_slug TEXT NOT NULL,
    file_path TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    note TEXT
);
"#;

const DOCUMENT_COLUMNS: &str = "id, doc_id, slug, title, path, parent_slug, status, owner, \
     created_at, updated_at, is_start_page, is_pinned, links";

#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// How long a caller may wait for the connection (and SQLite for its locks).
    pub busy_timeout: Duration,
    /// Upper bound for navigation reads.
    pub nav_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            nav_timeout: Duration::from_secs(3),
        }
    }
}

/// Result of writing one full sync pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncWrite {
    pub upserted: usize,
    pub failed: Vec<String>,
    pub removed: usize,
    pub orphans_removed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub page_slug: String,
    pub file_path: String,
    pub saved_at: String,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NavNode {
    pub slug: String,
    pub title: String,
    pub status: DocStatus,
    pub is_start_page: bool,
    pub is_pinned: bool,
    pub children: Vec<NavNode>,
}

/// The single logical connection to the derived index.
pub struct IndexStore {
    conn: Mutex<Option<Connection>>,
    options: StoreOptions,
}

impl IndexStore {
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Opened index store at {} (journal_mode={})", path.display(), mode);
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            options,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Close the connection. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock_within(self.options.busy_timeout)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            tracing::info!("Index store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or_else(|e| e.into_inner().is_none())
    }

    /// Flush the write-ahead log into the main database file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Insert or update one document and replace its search row.
    /// Returns the shared rowid.
    pub fn upsert_document(&self, doc: &IndexedDocument) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = upsert_pair(&tx, doc, Rekey::IfFileGone)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Remove a document's index row and search row. Returns whether a row existed.
    pub fn delete_document_by_slug(&self, slug: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id: Option<i64> = tx
                .query_row("SELECT id FROM documents WHERE slug = ?1", [slug], |row| row.get(0))
                .optional()?;
            if let Some(id) = id {
                delete_pair(&tx, id)?;
            }
            tx.commit()?;
            Ok(id.is_some())
        })
    }

    /// Write a complete sync pass in one transaction: drop rows whose slug is
    /// no longer present, upsert every document (each in its own savepoint so a
    /// bad file cannot split a pair), purge orphaned search rows and realign
    /// the start-page flag.
    pub fn apply_sync(&self, docs: &[IndexedDocument]) -> Result<SyncWrite, StoreError> {
        self.with_conn(|conn| {
            let mut tx = conn.transaction()?;
            let mut report = SyncWrite::default();

            let seen: HashSet<&str> = docs.iter().map(|d| d.slug.as_str()).collect();
            let existing: Vec<(i64, String, Option<String>)> = {
                let mut stmt = tx.prepare("SELECT id, slug, doc_id FROM documents")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut indexed_at: HashMap<String, String> = HashMap::new();
            for (id, slug, doc_id) in existing {
                if !seen.contains(slug.as_str()) {
                    tracing::debug!("Removing index row for vanished slug {}", slug);
                    delete_pair(&tx, id)?;
                    report.removed += 1;
                } else if let Some(doc_id) = doc_id {
                    indexed_at.insert(doc_id, slug);
                }
            }

            // Documents whose slug changed go first, so their rows are
            // re-keyed before another document can claim the old slug.
            let (moved, unmoved): (Vec<&IndexedDocument>, Vec<&IndexedDocument>) =
                docs.iter().partition(|doc| {
                    indexed_at
                        .get(&doc.doc_id)
                        .is_some_and(|slug| *slug != doc.slug)
                });

            let mut claimed: HashSet<&str> = HashSet::new();
            for doc in moved.into_iter().chain(unmoved) {
                if !claimed.insert(doc.doc_id.as_str()) {
                    tracing::warn!(
                        "{} reuses id {} already indexed in this pass, skipping",
                        doc.path.display(),
                        doc.doc_id
                    );
                    report.failed.push(doc.slug.clone());
                    continue;
                }
                let sp = tx.savepoint()?;
                match upsert_pair(&sp, doc, Rekey::Always) {
                    Ok(_) => {
                        sp.commit()?;
                        report.upserted += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to index {}: {}", doc.path.display(), e);
                        report.failed.push(doc.slug.clone());
                    }
                }
            }

            report.orphans_removed = tx.execute(
                "DELETE FROM documents_fts WHERE rowid NOT IN (SELECT id FROM documents)",
                [],
            )?;
            align_start_page(&tx)?;
            set_setting_in(&tx, LAST_SYNC_KEY, &now_timestamp())?;
            tx.commit()?;
            Ok(report)
        })
    }

    pub fn set_pinned(&self, slug: &str, pinned: bool) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE documents SET is_pinned = ?2 WHERE slug = ?1",
                params![slug, pinned],
            )?;
            Ok(changed > 0)
        })
    }

    // ---------------------------------------------------------------------
    // Settings and start page
    // ---------------------------------------------------------------------

    pub fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| Ok(setting_in(conn, key)?))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(set_setting_in(conn, key, value)?))
    }

    pub fn start_page_slug(&self) -> Result<Option<String>, StoreError> {
        Ok(self.setting(START_PAGE_KEY)?.filter(|s| !s.is_empty()))
    }

    /// Configure the start page and update the per-row flag to match.
    pub fn set_start_page_slug(&self, slug: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            set_setting_in(&tx, START_PAGE_KEY, slug)?;
            align_start_page(&tx)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Make `slug` the start page when none is configured yet.
    pub fn ensure_start_page(&self, slug: &str) -> Result<bool, StoreError> {
        if self.start_page_slug()?.is_some() {
            return Ok(false);
        }
        self.set_start_page_slug(slug)?;
        tracing::info!("Start page set to {}", slug);
        Ok(true)
    }

    pub fn align_start_page_flag(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| Ok(align_start_page(conn)?))
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn document_by_slug(&self, slug: &str) -> Result<Option<DocumentRow>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE slug = ?1");
            Ok(conn.query_row(&sql, [slug], document_row).optional()?)
        })
    }

    pub fn document_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// slug → doc id for the given slugs that are indexed with an id.
    pub fn slug_map_for(&self, slugs: &[&str]) -> Result<HashMap<String, String>, StoreError> {
        if slugs.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT slug, doc_id FROM documents WHERE doc_id IS NOT NULL AND slug IN ({})",
                placeholders(slugs.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(slugs.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn list_documents(&self, statuses: &[DocStatus]) -> Result<Vec<DocumentRow>, StoreError> {
        self.with_conn(|conn| Ok(query_by_status(conn, statuses)?))
    }

    /// Documents whose link set contains `doc_id`.
    pub fn backlinks(&self, doc_id: &str) -> Result<Vec<DocumentRow>, StoreError> {
        let needle = serde_json::to_string(doc_id)?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents \
                 WHERE links IS NOT NULL AND instr(links, ?1) > 0 ORDER BY slug"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([needle], document_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Navigation tree for the given statuses, bounded by the navigation
    /// timeout. Exceeding it yields [`StoreError::IndexUnavailable`] rather
    /// than blocking the caller.
    pub fn nav_tree(&self, statuses: &[DocStatus]) -> Result<Vec<NavNode>, StoreError> {
        let limit = self.options.nav_timeout;
        let deadline = Instant::now() + limit;
        let mut guard = self.lock_within(limit).map_err(|e| match e {
            StoreError::Busy => StoreError::IndexUnavailable(limit),
            other => other,
        })?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        conn.progress_handler(1_000, Some(move || Instant::now() >= deadline));
        let rows = query_by_status(conn, statuses);
        conn.progress_handler(0, None::<fn() -> bool>);

        match rows {
            Ok(rows) => Ok(build_nav_tree(rows)),
            Err(e) if is_interrupted(&e) => {
                tracing::warn!("Navigation query exceeded {:?}", limit);
                Err(StoreError::IndexUnavailable(limit))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // History
    // ---------------------------------------------------------------------

    pub fn record_history(
        &self,
        slug: &str,
        file_path: &Path,
        note: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history(page_slug, file_path, saved_at, note) VALUES (?1, ?2, ?3, ?4)",
                params![slug, file_path.to_string_lossy(), now_timestamp(), note],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn history_for(&self, slug: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_slug, file_path, saved_at, note FROM history \
                 WHERE page_slug = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map([slug], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    page_slug: row.get(1)?,
                    file_path: row.get(2)?,
                    saved_at: row.get(3)?,
                    note: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    // ---------------------------------------------------------------------
    // Connection access
    // ---------------------------------------------------------------------

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock_within(self.options.busy_timeout)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// Wait up to `limit` for the connection. Callers queue here instead of
    /// opening a second connection.
    fn lock_within(
        &self,
        limit: Duration,
    ) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        let deadline = Instant::now() + limit;
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Busy);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }
}

/// When a row holding the document's id may be moved to its new slug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rekey {
    /// Full sync: ids are already unique within the pass.
    Always,
    /// Single write: only when the old row's file is gone or is this file.
    IfFileGone,
}

fn upsert_pair(conn: &Connection, doc: &IndexedDocument, rekey: Rekey) -> Result<i64, StoreError> {
    let links = if doc.links.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&doc.links)?)
    };
    let owner = (!doc.owner.is_empty()).then_some(doc.owner.as_str());
    rekey_moved_document(conn, doc, rekey)?;
    let id: i64 = conn.query_row(
        "INSERT INTO documents(doc_id, slug, title, path, parent_slug, status, owner, created_at, updated_at, links)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)
         ON CONFLICT(slug) DO UPDATE SET
             doc_id = excluded.doc_id,
             title = excluded.title,
             path = excluded.path,
             parent_slug = excluded.parent_slug,
             status = excluded.status,
             owner = excluded.owner,
             updated_at = excluded.updated_at,
             links = excluded.links
         RETURNING id",
        params![
            doc.doc_id,
            doc.slug,
            doc.title,
            doc.path.to_string_lossy(),
            doc.parent_slug,
            doc.status.as_str(),
            owner,
            doc.updated_at,
            links,
        ],
        |row| row.get(0),
    )?;
    crate::search_index::replace_search_row(conn, id, &doc.slug, &doc.title, &doc.body)?;
    Ok(id)
}

/// A document whose file now maps to a different slug (a hub that gained a
/// sibling, a rename that kept its `id:`) still owns its old row. Move that
/// row to the new slug so the upsert updates it instead of tripping the
/// unique `doc_id`. Whatever row held the new slug is dropped; its document,
/// if still present, is written again under its own id.
fn rekey_moved_document(
    conn: &Connection,
    doc: &IndexedDocument,
    rekey: Rekey,
) -> rusqlite::Result<()> {
    let moved: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT id, slug, path FROM documents WHERE doc_id = ?1 AND slug != ?2",
            params![doc.doc_id, doc.slug],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((id, old_slug, old_path)) = moved else {
        return Ok(());
    };
    if rekey == Rekey::IfFileGone
        && Path::new(&old_path) != doc.path
        && Path::new(&old_path).is_file()
    {
        return Ok(());
    }
    let holder: Option<i64> = conn
        .query_row("SELECT id FROM documents WHERE slug = ?1", [&doc.slug], |row| row.get(0))
        .optional()?;
    if let Some(holder) = holder {
        delete_pair(conn, holder)?;
    }
    conn.execute("UPDATE documents SET slug = ?2 WHERE id = ?1", params![id, doc.slug])?;
    tracing::debug!("Moved {} from slug {} to {}", doc.doc_id, old_slug, doc.slug);
    Ok(())
}

fn delete_pair(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    crate::search_index::remove_search_row(conn, id)?;
    conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
    Ok(())
}

fn align_start_page(conn: &Connection) -> rusqlite::Result<usize> {
    let start = setting_in(conn, START_PAGE_KEY)?.filter(|s| !s.is_empty());
    conn.execute(
        "UPDATE documents
         SET is_start_page = CASE WHEN slug = ?1 THEN 1 ELSE 0 END
         WHERE is_start_page != CASE WHEN slug = ?1 THEN 1 ELSE 0 END",
        [start],
    )
}

fn setting_in(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .map(Option::flatten)
}

fn set_setting_in(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

fn query_by_status(conn: &Connection, statuses: &[DocStatus]) -> rusqlite::Result<Vec<DocumentRow>> {
    let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let sql = if statuses.is_empty() {
        format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY slug")
    } else {
        format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE status IN ({}) ORDER BY slug",
            placeholders(statuses.len())
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(statuses.iter()), document_row)?;
    rows.collect()
}

pub(crate) fn document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    let status: String = row.get(6)?;
    let links: Option<String> = row.get(12)?;
    Ok(DocumentRow {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        path: row.get(4)?,
        parent_slug: row.get(5)?,
        status: DocStatus::from_column(&status),
        owner: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        created_at: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        is_start_page: row.get(10)?,
        is_pinned: row.get(11)?,
        links: links
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
    })
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted)
}

/// Arrange rows (sorted by slug) into a tree by parent slug. Rows whose
/// parent is not indexed become roots.
pub fn build_nav_tree(rows: Vec<DocumentRow>) -> Vec<NavNode> {
    let slugs: HashSet<String> = rows.iter().map(|r| r.slug.clone()).collect();
    let mut children: HashMap<String, Vec<DocumentRow>> = HashMap::new();
    let mut roots = Vec::new();
    for row in rows {
        if !row.parent_slug.is_empty() && slugs.contains(&row.parent_slug) {
            children.entry(row.parent_slug.clone()).or_default().push(row);
        } else {
            roots.push(row);
        }
    }

    fn attach(row: DocumentRow, children: &mut HashMap<String, Vec<DocumentRow>>) -> NavNode {
        let kids = children.remove(&row.slug).unwrap_or_default();
        NavNode {
            children: kids.into_iter().map(|kid| attach(kid, children)).collect(),
            slug: row.slug,
            title: row.title,
            status: row.status,
            is_start_page: row.is_start_page,
            is_pinned: row.is_pinned,
        }
    }

    roots.into_iter().map(|row| attach(row, &mut children)).collect()
}
