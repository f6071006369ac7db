//! Reading and minimally editing the `---` key/value block at the top of a
//! markdown file.
//!
//! Edits are byte-preserving outside the block and keep a leading byte-order
//! mark. Both mutating operations return `None` when the content is already
//! in the requested shape, so callers can skip rewriting the file.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static FRONT_MATTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^---\r?\n(.*?)\r?\n---\r?\n?").unwrap());

const BOM: char = '\u{feff}';

/// Recognised front matter keys. Values are kept raw; see
/// [`crate::document::DocStatus::from_front_matter`] for status validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrontMatter {
    pub id: Option<String>,
    pub status: Option<String>,
    pub owner: Option<String>,
}

/// Split raw content into its front matter and body.
///
/// The body has leading line breaks removed when a block is present.
pub fn parse(raw: &str) -> (FrontMatter, &str) {
    let content = strip_bom(raw);
    let Some(block) = FRONT_MATTER_RE.find(content) else {
        return (FrontMatter::default(), content);
    };
    let mut meta = FrontMatter::default();
    for (key, value) in entries(block.as_str()) {
        let value = (!value.is_empty()).then(|| value.to_string());
        match key.to_ascii_lowercase().as_str() {
            "id" => meta.id = value,
            "status" => meta.status = value,
            "owner" => meta.owner = value,
            _ => {}
        }
    }
    (meta, content[block.end()..].trim_start_matches(['\r', '\n']))
}

/// Body without front matter or byte-order mark.
pub fn strip(raw: &str) -> &str {
    parse(raw).1
}

/// True when the block declares `key`, even with an empty value.
pub fn has_key(raw: &str, key: &str) -> bool {
    let wanted = key.trim();
    if wanted.is_empty() {
        return false;
    }
    FRONT_MATTER_RE
        .find(strip_bom(raw))
        .map(|block| entries(block.as_str()).any(|(k, _)| k.eq_ignore_ascii_case(wanted)))
        .unwrap_or(false)
}

/// Make sure the content carries a non-empty `id`.
///
/// Without a block a new one is synthesized ahead of the body. With a block
/// the id line is inserted right after the opening delimiter.
pub fn ensure_id(raw: &str, id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    let content = strip_bom(raw);
    let Some(block) = FRONT_MATTER_RE.find(content) else {
        let body = if content.is_empty() { "\n" } else { content };
        return Some(with_bom(raw, format!("---\nid: {id}\n---\n\n{body}")));
    };
    let mut declared = entries(block.as_str()).filter(|(k, _)| k.eq_ignore_ascii_case("id"));
    match declared.next() {
        Some((_, value)) if !value.is_empty() => None,
        Some(_) => set_field(raw, "id", id),
        None => Some(with_bom(
            raw,
            splice(content, block.range(), insert_after_opening(block.as_str(), &format!("id: {id}"))),
        )),
    }
}

/// Set `key: value`, replacing an existing (case-insensitive) key in place or
/// inserting it after the opening delimiter.
pub fn set_field(raw: &str, key: &str, value: &str) -> Option<String> {
    if key.is_empty() || value.is_empty() {
        return None;
    }
    let content = strip_bom(raw);
    let line = format!("{key}: {value}");
    let Some(block) = FRONT_MATTER_RE.find(content) else {
        let body = content.trim_start_matches(['\r', '\n']);
        let body = if body.is_empty() { "\n" } else { body };
        return Some(with_bom(raw, format!("---\n{line}\n---\n\n{body}")));
    };

    let original = block.as_str();
    let wanted = key.trim().to_ascii_lowercase();
    let mut replaced = false;
    let lines: Vec<String> = original
        .split('\n')
        .map(|raw_line| {
            if !replaced && entry(raw_line).is_some_and(|(k, _)| k.to_ascii_lowercase() == wanted) {
                replaced = true;
                if raw_line.ends_with('\r') {
                    format!("{line}\r")
                } else {
                    line.clone()
                }
            } else {
                raw_line.to_string()
            }
        })
        .collect();

    let updated = if replaced {
        lines.join("\n")
    } else {
        insert_after_opening(original, &line)
    };
    if updated.trim() == original.trim() {
        return None;
    }
    Some(with_bom(raw, splice(content, block.range(), updated)))
}

fn strip_bom(raw: &str) -> &str {
    raw.strip_prefix(BOM).unwrap_or(raw)
}

fn with_bom(original: &str, mut content: String) -> String {
    if original.starts_with(BOM) {
        content.insert(0, BOM);
    }
    content
}

fn entry(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line == "---" {
        return None;
    }
    line.split_once(':').map(|(k, v)| (k.trim(), v.trim()))
}

fn entries(block: &str) -> impl Iterator<Item = (&str, &str)> {
    block.split('\n').filter_map(entry)
}

/// Insert `line` after the opening delimiter, ending it the way the
/// delimiter line is ended.
fn insert_after_opening(block: &str, line: &str) -> String {
    match block.find('\n') {
        Some(idx) => {
            let eol = if block[..idx].ends_with('\r') { "\r\n" } else { "\n" };
            format!("{}{line}{eol}{}", &block[..=idx], &block[idx + 1..])
        }
        None => format!("{block}\n{line}"),
    }
}

fn splice(content: &str, range: std::ops::Range<usize>, replacement: String) -> String {
    let mut out = String::with_capacity(content.len() + replacement.len());
    out.push_str(&content[..range.start]);
    out.push_str(&replacement);
    out.push_str(&content[range.end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // === parse ===

    #[test]
    fn parses_known_keys_and_body() {
        let raw = "---\nid: doc-abc\nStatus: Unlisted\nowner:  alice \ntags: x\n---\n\n# Hello\n";
        let (meta, body) = parse(raw);
        assert_eq!(meta.id.as_deref(), Some("doc-abc"));
        assert_eq!(meta.status.as_deref(), Some("Unlisted"));
        assert_eq!(meta.owner.as_deref(), Some("alice"));
        assert_eq!(body, "# Hello\n");
    }

    #[test]
    fn content_without_block_is_all_body() {
        let (meta, body) = parse("# Just text\n");
        assert_eq!(meta, FrontMatter::default());
        assert_eq!(body, "# Just text\n");
    }

    #[test]
    fn parse_handles_bom_and_crlf() {
        let raw = "\u{feff}---\r\nid: doc-1\r\n---\r\nBody";
        let (meta, body) = parse(raw);
        assert_eq!(meta.id.as_deref(), Some("doc-1"));
        assert_eq!(body, "Body");
    }

    #[test]
    fn unterminated_block_is_treated_as_body() {
        let raw = "---\nid: doc-1\nno closing";
        let (meta, body) = parse(raw);
        assert!(meta.id.is_none());
        assert_eq!(body, raw);
    }

    #[test]
    fn has_key_ignores_case_and_empty_values() {
        let raw = "---\nID:\n---\n";
        assert!(has_key(raw, "id"));
        assert!(!has_key(raw, "status"));
        assert!(!has_key("no block", "id"));
    }

    // === ensure_id ===

    #[test]
    fn ensure_id_synthesizes_block() {
        let updated = ensure_id("# Title\n", "doc-1").unwrap();
        assert_eq!(updated, "---\nid: doc-1\n---\n\n# Title\n");
    }

    #[test]
    fn ensure_id_on_empty_content_leaves_a_body_line() {
        assert_eq!(ensure_id("", "doc-1").unwrap(), "---\nid: doc-1\n---\n\n\n");
    }

    #[test]
    fn ensure_id_inserts_after_opening_delimiter() {
        let raw = "---\nstatus: published\n---\nBody";
        let updated = ensure_id(raw, "doc-1").unwrap();
        assert_eq!(updated, "---\nid: doc-1\nstatus: published\n---\nBody");
    }

    #[test]
    fn ensure_id_is_idempotent() {
        let once = ensure_id("Body", "doc-1").unwrap();
        assert_eq!(ensure_id(&once, "doc-2"), None);
        assert_eq!(parse(&once).0.id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn ensure_id_fills_empty_id_line() {
        let updated = ensure_id("---\nid:\n---\nBody", "doc-9").unwrap();
        assert_eq!(updated, "---\nid: doc-9\n---\nBody");
    }

    #[test]
    fn ensure_id_preserves_bom() {
        let updated = ensure_id("\u{feff}Body", "doc-1").unwrap();
        assert!(updated.starts_with('\u{feff}'));
        assert_eq!(parse(&updated).0.id.as_deref(), Some("doc-1"));

        let with_block = ensure_id("\u{feff}---\nowner: bob\n---\nBody", "doc-2").unwrap();
        assert_eq!(with_block, "\u{feff}---\nid: doc-2\nowner: bob\n---\nBody");
    }

    #[test]
    fn ensure_id_with_empty_id_is_noop() {
        assert_eq!(ensure_id("Body", ""), None);
    }

    // === set_field ===

    #[test]
    fn set_field_replaces_existing_key_case_insensitively() {
        let raw = "---\nid: doc-1\nStatus: unlisted\n---\nBody";
        let updated = set_field(raw, "status", "published").unwrap();
        assert_eq!(updated, "---\nid: doc-1\nstatus: published\n---\nBody");
    }

    #[test]
    fn set_field_inserts_missing_key() {
        let raw = "---\nid: doc-1\n---\nBody";
        let updated = set_field(raw, "owner", "alice").unwrap();
        assert_eq!(updated, "---\nowner: alice\nid: doc-1\n---\nBody");
    }

    #[test]
    fn set_field_keeps_crlf_line_endings() {
        let raw = "---\r\nid: doc-1\r\nstatus: draft\r\n---\r\nBody\r\n";
        let updated = set_field(raw, "status", "published").unwrap();
        assert_eq!(updated, "---\r\nid: doc-1\r\nstatus: published\r\n---\r\nBody\r\n");
        assert_eq!(parse(&updated).0.status.as_deref(), Some("published"));

        let inserted = set_field(raw, "owner", "alice").unwrap();
        assert_eq!(
            inserted,
            "---\r\nowner: alice\r\nid: doc-1\r\nstatus: draft\r\n---\r\nBody\r\n"
        );
        assert!(!inserted.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn set_field_synthesizes_block() {
        let updated = set_field("\n\nBody", "status", "published").unwrap();
        assert_eq!(updated, "---\nstatus: published\n---\n\nBody");
    }

    #[test]
    fn set_field_reports_unchanged() {
        let raw = "---\nstatus: published\n---\nBody";
        assert_eq!(set_field(raw, "status", "published"), None);
    }

    #[test]
    fn set_field_ignores_empty_key_or_value() {
        assert_eq!(set_field("Body", "", "x"), None);
        assert_eq!(set_field("Body", "status", ""), None);
    }

    #[test]
    fn edits_leave_body_bytes_untouched() {
        let body = "line one\r\n\r\n  indented [[link]]\n";
        let raw = format!("---\nid: doc-1\n---\n{body}");
        let updated = set_field(&raw, "owner", "carol").unwrap();
        assert!(updated.ends_with(body));
    }
}
