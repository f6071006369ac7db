use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;

use crate::document::DocStatus;
use crate::error::StoreError;
use crate::store::{placeholders, IndexStore};

const SNIPPET_TOKENS: i64 = 64;

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub slug: String,
    pub title: String,
    pub status: DocStatus,
    pub snippet: String,
    pub score: f64,
}

/// Replace the search row sharing `rowid` with an index row.
pub(crate) fn replace_search_row(
    conn: &Connection,
    rowid: i64,
    slug: &str,
    title: &str,
    body: &str,
) -> rusqlite::Result<()> {
    remove_search_row(conn, rowid)?;
    conn.execute(
        "INSERT INTO documents_fts(rowid, slug, title, body) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![rowid, slug, title, body],
    )?;
    Ok(())
}

pub(crate) fn remove_search_row(conn: &Connection, rowid: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM documents_fts WHERE rowid = ?1", [rowid])?;
    Ok(())
}

impl IndexStore {
    /// Full-text search over indexed documents.
    ///
    /// Words are ANDed, double-quoted phrases are kept together, and query
    /// operators are treated as plain words so user input never produces a
    /// syntax error. An empty status filter means published documents only.
    pub fn search(
        &self,
        query: &str,
        statuses: &[DocStatus],
        limit: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let Some(fts_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let statuses = if statuses.is_empty() {
            &[DocStatus::Published][..]
        } else {
            statuses
        };

        let sql = format!(
            "SELECT d.doc_id, d.slug, d.title, d.status,
                    snippet(documents_fts, 2, '<mark>', '</mark>', '...', {SNIPPET_TOKENS}),
                    bm25(documents_fts, 0.6, 0.35, 0.1) AS rank
             FROM documents_fts
             JOIN documents d ON d.id = documents_fts.rowid
             WHERE documents_fts MATCH ? AND d.status IN ({})
             ORDER BY rank
             LIMIT ?",
            placeholders(statuses.len())
        );
        let mut values: Vec<Value> = Vec::with_capacity(statuses.len() + 2);
        values.push(Value::Text(fts_query));
        values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        values.push(Value::Integer(limit as i64));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                let status: String = row.get(3)?;
                let snippet: String = row.get(4)?;
                let rank: f64 = row.get(5)?;
                Ok(SearchResult {
                    doc_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    slug: row.get(1)?,
                    title: row.get(2)?,
                    status: DocStatus::from_column(&status),
                    snippet: sanitize_snippet(&snippet),
                    score: -rank,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

/// Turn free text into an FTS5 query of quoted terms and phrases.
fn build_match_query(raw: &str) -> Option<String> {
    let mut terms = Vec::new();
    for (idx, segment) in raw.split('"').enumerate() {
        // Odd segments sit between a pair of quotes.
        if idx % 2 == 1 {
            terms.push(segment.to_string());
        } else {
            terms.extend(segment.split_whitespace().map(str::to_string));
        }
    }
    let quoted: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    (!quoted.is_empty()).then(|| quoted.join(" "))
}

/// Escape HTML in a snippet while keeping the highlight tags.
fn sanitize_snippet(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
        .replace("&lt;mark&gt;", "<mark>")
        .replace("&lt;/mark&gt;", "</mark>")
}
