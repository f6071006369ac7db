use std::path::{Component, Path, PathBuf};

use crate::error::SlugError;

pub const HUB_FILE_NAME: &str = "_index.md";
const HUB_SUFFIX: &str = "/_index";

/// First path segments that cannot be claimed by a new document.
pub const RESERVED_SLUGS: &[&str] = &[
    "settings", "edit", "about", "history", "backups", "new", "editor", "welcome", "setup",
];

/// A caller-supplied slug after decoding and cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlugParam {
    pub slug: String,
    /// The caller addressed the hub file directly (`…/_index`).
    pub explicit_hub: bool,
}

/// Decode and clean a raw slug parameter.
///
/// Percent-escapes are decoded, surrounding whitespace and slashes and a
/// trailing `.md` are dropped, backslashes become `/`, and a trailing
/// `/_index` is split off as an explicit hub request.
pub fn parse_slug_param(raw: &str) -> SlugParam {
    let decoded = urlencoding::decode(raw)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let slug = decoded.trim().trim_matches('/');
    let slug = slug.strip_suffix(".md").unwrap_or(slug);
    let slug = slug.trim_matches('/').replace('\\', "/");
    match slug.strip_suffix(HUB_SUFFIX) {
        Some(base) => SlugParam {
            slug: base.to_string(),
            explicit_hub: true,
        },
        None => SlugParam {
            slug,
            explicit_hub: false,
        },
    }
}

pub fn is_reserved_slug(raw: &str) -> bool {
    let param = parse_slug_param(raw);
    let first = param.slug.split('/').next().unwrap_or_default();
    !first.is_empty() && RESERVED_SLUGS.contains(&first.to_ascii_lowercase().as_str())
}

/// Lowercase, dash-separated slug built from free text. Never empty.
pub fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace('\\', "/").replace(' ', "-");
    let mut slug: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '/' | '_' | '-'))
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '/');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.to_string()
    }
}

/// Where a slug lives on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub slug: String,
    pub path: PathBuf,
    pub is_hub: bool,
    pub exists: bool,
}

/// Maps slugs to markdown files under one content root.
///
/// A slug `a/b` is either the plain file `a/b.md` or the hub file
/// `a/b/_index.md`. Every path handed out is contained in the root.
#[derive(Clone, Debug)]
pub struct SlugResolver {
    root: PathBuf,
}

impl SlugResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Plain-file and hub-file candidates for an already cleaned slug.
    pub fn candidates(&self, slug: &str) -> Result<(PathBuf, PathBuf), SlugError> {
        let rel = self.relative(slug)?;
        let mut plain = self.root.join(&rel);
        let file_name = format!(
            "{}.md",
            plain.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        );
        plain.set_file_name(file_name);
        let hub = self.root.join(&rel).join(HUB_FILE_NAME);
        Ok((plain, hub))
    }

    /// Resolve a raw slug parameter to the file that should back it.
    ///
    /// An explicit hub request always maps to the hub file. Otherwise an
    /// existing plain file wins over an existing hub, and a slug with neither
    /// maps to the plain file (or the hub when `prefer_hub_for_new`).
    pub fn resolve(&self, raw: &str, prefer_hub_for_new: bool) -> Result<Resolved, SlugError> {
        let param = parse_slug_param(raw);
        let (plain, hub) = self.candidates(&param.slug)?;
        let resolved = |path: PathBuf, is_hub: bool| Resolved {
            slug: param.slug.clone(),
            exists: path.is_file(),
            path,
            is_hub,
        };
        if param.explicit_hub {
            return Ok(resolved(hub, true));
        }
        if plain.is_file() {
            return Ok(resolved(plain, false));
        }
        if hub.is_file() {
            return Ok(resolved(hub, true));
        }
        Ok(if prefer_hub_for_new {
            resolved(hub, true)
        } else {
            resolved(plain, false)
        })
    }

    /// Like [`resolve`](Self::resolve), but refuses to hand out a path for a
    /// new document under a reserved first segment. Existing documents keep
    /// resolving normally.
    pub fn resolve_for_create(
        &self,
        raw: &str,
        prefer_hub_for_new: bool,
    ) -> Result<Resolved, SlugError> {
        let resolved = self.resolve(raw, prefer_hub_for_new)?;
        if resolved.exists {
            return Ok(resolved);
        }
        let (plain, hub) = self.candidates(&resolved.slug)?;
        if !plain.is_file() && !hub.is_file() && is_reserved_slug(&resolved.slug) {
            return Err(SlugError::Reserved(resolved.slug));
        }
        Ok(resolved)
    }

    /// Slug for a markdown file found under the root, applying hub
    /// disambiguation: `a/_index.md` is `a` unless a sibling `a.md` exists, in
    /// which case it keeps the explicit `a/_index` slug.
    pub fn slug_for_file(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<&str> = rel
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        let (file_name, dirs) = segments.split_last()?;
        if file_name.eq_ignore_ascii_case(HUB_FILE_NAME) {
            if dirs.is_empty() {
                return Some("_index".to_string());
            }
            let dir = dirs.join("/");
            let (sibling, _) = self.candidates(&dir).ok()?;
            return Some(if sibling.is_file() {
                format!("{dir}{HUB_SUFFIX}")
            } else {
                dir
            });
        }
        let stem = strip_md_extension(file_name)?;
        let mut parts: Vec<&str> = dirs.to_vec();
        parts.push(stem);
        Some(parts.join("/"))
    }

    fn relative(&self, slug: &str) -> Result<PathBuf, SlugError> {
        if slug.is_empty() {
            return Err(SlugError::Missing);
        }
        let rel = PathBuf::from(slug);
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => return Err(SlugError::Invalid(slug.to_string())),
                _ => return Err(SlugError::Escape(self.root.join(&rel))),
            }
        }
        Ok(rel)
    }
}

fn strip_md_extension(file_name: &str) -> Option<&str> {
    let split = file_name.len().checked_sub(3)?;
    let (stem, ext) = file_name.split_at_checked(split)?;
    (ext.eq_ignore_ascii_case(".md") && !stem.is_empty()).then_some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    // === parse_slug_param ===

    #[test]
    fn cleans_raw_parameters() {
        assert_eq!(parse_slug_param(" /guides/setup.md/ ").slug, "guides/setup");
        assert_eq!(parse_slug_param("guides%2Finstall").slug, "guides/install");
        assert_eq!(parse_slug_param("a\\b").slug, "a/b");
    }

    #[test]
    fn detects_explicit_hub_suffix() {
        let param = parse_slug_param("guides/_index");
        assert_eq!(param.slug, "guides");
        assert!(param.explicit_hub);
        assert!(!parse_slug_param("guides").explicit_hub);
    }

    #[test]
    fn reserved_check_uses_first_segment_only() {
        assert!(is_reserved_slug("settings"));
        assert!(is_reserved_slug("Settings/profile"));
        assert!(!is_reserved_slug("guides/settings"));
        assert!(!is_reserved_slug(""));
    }

    #[test]
    fn slugify_produces_url_safe_slugs() {
        assert_eq!(slugify("Hello World!"), "hello-world");
        assert_eq!(slugify("  a -- b "), "a-b");
        assert_eq!(slugify("???"), "untitled");
    }

    // === resolve ===

    #[test]
    fn rejects_missing_and_traversing_slugs() {
        let resolver = SlugResolver::new("/srv/content");
        assert!(matches!(resolver.resolve("", false), Err(SlugError::Missing)));
        assert!(matches!(resolver.resolve("../etc/passwd", false), Err(SlugError::Invalid(_))));
        assert!(matches!(resolver.resolve("a/%2E%2E/b", false), Err(SlugError::Invalid(_))));
    }

    #[test]
    fn dots_inside_a_segment_are_allowed() {
        let resolver = SlugResolver::new("/srv/content");
        let resolved = resolver.resolve("releases/v1..2", false).unwrap();
        assert_eq!(resolved.path, PathBuf::from("/srv/content/releases/v1..2.md"));
        assert!(resolver.resolve("notes/..hidden..", false).is_ok());
        assert!(matches!(resolver.resolve("a/../../b", false), Err(SlugError::Invalid(_))));
    }

    #[test]
    fn existing_plain_file_wins() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "guides.md");
        touch(tmp.path(), "guides/_index.md");
        let resolved = SlugResolver::new(tmp.path()).resolve("guides", true).unwrap();
        assert_eq!(resolved.path, tmp.path().join("guides.md"));
        assert!(!resolved.is_hub);
        assert!(resolved.exists);
    }

    #[test]
    fn existing_hub_used_when_no_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "guides/_index.md");
        let resolved = SlugResolver::new(tmp.path()).resolve("guides", false).unwrap();
        assert_eq!(resolved.path, tmp.path().join("guides/_index.md"));
        assert!(resolved.is_hub);
    }

    #[test]
    fn new_documents_follow_the_hint() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = SlugResolver::new(tmp.path());
        let plain = resolver.resolve("new-page", false).unwrap();
        assert_eq!(plain.path, tmp.path().join("new-page.md"));
        assert!(!plain.exists);
        let hub = resolver.resolve("new-page", true).unwrap();
        assert_eq!(hub.path, tmp.path().join("new-page/_index.md"));
    }

    #[test]
    fn explicit_hub_maps_to_hub_file() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "guides.md");
        let resolved = SlugResolver::new(tmp.path()).resolve("guides/_index", false).unwrap();
        assert_eq!(resolved.path, tmp.path().join("guides/_index.md"));
        assert!(resolved.is_hub);
        assert!(!resolved.exists);
    }

    #[test]
    fn reserved_guard_applies_to_new_documents_only() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = SlugResolver::new(tmp.path());
        assert!(matches!(
            resolver.resolve_for_create("about", false),
            Err(SlugError::Reserved(_))
        ));
        touch(tmp.path(), "about.md");
        let resolved = resolver.resolve_for_create("about", false).unwrap();
        assert!(resolved.exists);
    }

    // === slug_for_file ===

    #[test]
    fn slug_for_plain_and_nested_files() {
        let resolver = SlugResolver::new("/root");
        assert_eq!(resolver.slug_for_file(Path::new("/root/a.md")).as_deref(), Some("a"));
        assert_eq!(resolver.slug_for_file(Path::new("/root/a/b.MD")).as_deref(), Some("a/b"));
        assert_eq!(resolver.slug_for_file(Path::new("/other/a.md")), None);
        assert_eq!(resolver.slug_for_file(Path::new("/root/a.txt")), None);
    }

    #[test]
    fn hub_slug_is_disambiguated_against_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "solo/_index.md");
        touch(tmp.path(), "both/_index.md");
        touch(tmp.path(), "both.md");
        touch(tmp.path(), "_index.md");
        let resolver = SlugResolver::new(tmp.path());
        let slug = |rel: &str| resolver.slug_for_file(&tmp.path().join(rel));
        assert_eq!(slug("solo/_index.md").as_deref(), Some("solo"));
        assert_eq!(slug("both/_index.md").as_deref(), Some("both/_index"));
        assert_eq!(slug("both.md").as_deref(), Some("both"));
        assert_eq!(slug("_index.md").as_deref(), Some("_index"));
    }
}
