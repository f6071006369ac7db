use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

// Compile regex once, reuse across calls
static WIKILINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\]]+)\]\]").unwrap()
});

static FENCED_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[^\n]*\n.*?```|~~~[^\n]*\n.*?~~~").unwrap()
});

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`[^`]*`").unwrap()
});

/// One `[[target|label]]` reference, classified by how it names its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkToken {
    /// `[[doc:<id>]]`: names a document id directly.
    DocId(String),
    /// `[[path:<slug>]]` or a bare `[[slug]]`, already normalized.
    Slug(String),
}

/// Extract link tokens from markdown text.
/// The label after `|` and any `#anchor` are dropped.
/// Ignores links inside code blocks and inline code.
pub fn extract_link_tokens(markdown: &str) -> Vec<LinkToken> {
    // Strip code blocks first
    let without_fenced = FENCED_CODE_RE.replace_all(markdown, "");
    let without_code = INLINE_CODE_RE.replace_all(&without_fenced, "");

    let mut tokens = Vec::new();
    for cap in WIKILINK_RE.captures_iter(&without_code) {
        let content = &cap[1];
        let target = content.split('|').next().unwrap_or_default().trim();
        if target.is_empty() {
            continue;
        }

        if let Some(id) = strip_prefix_ignore_case(target, "doc:") {
            let id = id.trim();
            if !id.is_empty() {
                tokens.push(LinkToken::DocId(id.to_string()));
            }
            continue;
        }

        let target = strip_prefix_ignore_case(target, "path:").unwrap_or(target);
        // Anchor (#) points inside the target page
        let target = target.split('#').next().unwrap_or_default();
        let slug = normalize_wiki_target(target);
        if !slug.is_empty() {
            tokens.push(LinkToken::Slug(slug));
        }
    }
    tokens
}

/// Normalize a link target into slug form: percent-decoded, no surrounding
/// whitespace or slashes, no `.md` suffix, forward slashes only.
pub fn normalize_wiki_target(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let target = decoded.trim().trim_matches('/');
    let target = target.strip_suffix(".md").unwrap_or(target);
    target.trim_matches('/').replace('\\', "/")
}

/// Slugs the tokens refer to, for looking up only the ids that are needed.
pub fn referenced_slugs(tokens: &[LinkToken]) -> Vec<&str> {
    tokens
        .iter()
        .filter_map(|token| match token {
            LinkToken::Slug(slug) => Some(slug.as_str()),
            LinkToken::DocId(_) => None,
        })
        .collect()
}

/// Resolve tokens into a sorted, de-duplicated id list.
///
/// Slugs missing from `slug_to_id` are dropped without error, and the
/// document's own id never appears in its link set.
pub fn resolve_link_ids(
    tokens: &[LinkToken],
    slug_to_id: &HashMap<String, String>,
    self_id: &str,
) -> Vec<String> {
    let ids: BTreeSet<&str> = tokens
        .iter()
        .filter_map(|token| match token {
            LinkToken::DocId(id) => Some(id.as_str()),
            LinkToken::Slug(slug) => slug_to_id.get(slug).map(String::as_str),
        })
        .filter(|id| !id.is_empty() && *id != self_id)
        .collect();
    ids.into_iter().map(str::to_string).collect()
}

/// Extract and resolve in one step.
pub fn outgoing_links(
    markdown: &str,
    slug_to_id: &HashMap<String, String>,
    self_id: &str,
) -> Vec<String> {
    resolve_link_ids(&extract_link_tokens(markdown), slug_to_id, self_id)
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &value[prefix.len()..])
}
