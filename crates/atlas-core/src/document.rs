//! Shared document vocabulary: statuses, index rows and the small pure helpers
//! (titles, ids, parent slugs) used by both the full sync and the write path.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::front_matter;

pub const DOC_ID_PREFIX: &str = "doc-";
const TITLE_FALLBACK_CHARS: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Published,
    Unlisted,
    Draft,
}

impl DocStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocStatus::Published => "published",
            DocStatus::Unlisted => "unlisted",
            DocStatus::Draft => "draft",
        }
    }

    /// Parse a status as written in front matter. Drafts are never persisted,
    /// so only `published` and `unlisted` are accepted.
    pub fn from_front_matter(raw: &str) -> Option<DocStatus> {
        let value = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        match value.to_ascii_lowercase().as_str() {
            "published" => Some(DocStatus::Published),
            "unlisted" => Some(DocStatus::Unlisted),
            _ => None,
        }
    }

    pub fn from_column(raw: &str) -> DocStatus {
        match raw {
            "unlisted" => DocStatus::Unlisted,
            "draft" => DocStatus::Draft,
            _ => DocStatus::Published,
        }
    }
}

/// Everything needed to write one index row and its paired search row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedDocument {
    pub doc_id: String,
    pub slug: String,
    pub title: String,
    pub path: PathBuf,
    pub parent_slug: String,
    pub status: DocStatus,
    pub owner: String,
    pub updated_at: String,
    pub links: Vec<String>,
    /// Raw file content; becomes the search row body.
    pub body: String,
}

/// An index row as read back from the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DocumentRow {
    pub id: i64,
    pub doc_id: Option<String>,
    pub slug: String,
    pub title: String,
    pub path: String,
    pub parent_slug: String,
    pub status: DocStatus,
    pub owner: String,
    pub created_at: String,
    pub updated_at: String,
    pub is_start_page: bool,
    pub is_pinned: bool,
    pub links: Vec<String>,
}

/// Mint a fresh document id: `doc-` followed by 12 random bytes in hex.
pub fn mint_doc_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{DOC_ID_PREFIX}{}", hex::encode(bytes))
}

/// Title from the first `# ` heading, else the first 60 characters of the
/// trimmed body, else the humanized slug.
pub fn extract_title(raw: &str, slug: &str) -> String {
    let body = front_matter::strip(raw);
    for line in body.lines() {
        if let Some(heading) = line.trim().strip_prefix("# ") {
            let heading = heading.trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(TITLE_FALLBACK_CHARS).collect();
    }
    humanize_slug(slug)
}

pub fn humanize_slug(slug: &str) -> String {
    let last = slug.rsplit('/').next().unwrap_or_default();
    let words = last.replace(['-', '_'], " ");
    let words = words.trim();
    if words.is_empty() {
        return "Home".to_string();
    }
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Home".to_string(),
    }
}

pub fn parent_slug(slug: &str) -> &str {
    match slug.rfind('/') {
        Some(idx) if idx > 0 => &slug[..idx],
        _ => "",
    }
}

/// RFC 3339 UTC timestamp with second precision.
pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn minted_ids_are_prefixed_hex() {
        let id = mint_doc_id();
        assert!(id.starts_with("doc-"));
        let hex_part = &id[4..];
        assert_eq!(hex_part.len(), 24);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, mint_doc_id());
    }

    #[test]
    fn title_prefers_first_heading() {
        let raw = "---\nid: doc-1\n---\n\nintro line\n# Real Title\n# Second";
        assert_eq!(extract_title(raw, "a"), "Real Title");
    }

    #[test]
    fn title_falls_back_to_body_prefix() {
        let body = "x".repeat(100);
        assert_eq!(extract_title(&body, "a"), "x".repeat(60));
    }

    #[test]
    fn title_falls_back_to_slug() {
        assert_eq!(extract_title("---\nid: doc-1\n---\n", ""), "Home");
        assert_eq!(extract_title("   \n", "guides/getting-started"), "Getting started");
    }

    #[test]
    fn body_prefix_counts_characters_not_bytes() {
        let body = "é".repeat(70);
        assert_eq!(extract_title(&body, "a").chars().count(), 60);
    }

    #[test]
    fn parent_slug_is_everything_before_last_separator() {
        assert_eq!(parent_slug("a/b/c"), "a/b");
        assert_eq!(parent_slug("a"), "");
        assert_eq!(parent_slug(""), "");
    }

    #[test]
    fn front_matter_status_accepts_only_persisted_values() {
        assert_eq!(DocStatus::from_front_matter("Published"), Some(DocStatus::Published));
        assert_eq!(DocStatus::from_front_matter("'unlisted'"), Some(DocStatus::Unlisted));
        assert_eq!(DocStatus::from_front_matter("draft"), None);
        assert_eq!(DocStatus::from_front_matter(""), None);
    }

    #[test]
    fn timestamps_are_utc_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(format_timestamp(t), "2023-11-14T22:13:20Z");
    }
}
