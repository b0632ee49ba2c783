//! Deterministic URL-to-filesystem path mapping.
//!
//! Converts canonical URLs into human-readable nested directory structures,
//! with a mirrored metadata directory alongside. Same URL always produces
//! the same path; paths are chosen to read like the URL they came from and
//! to stay within filesystem-safe length and character limits.

use std::path::{Path, PathBuf};

use docsync_shared::{CanonicalUrl, Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use url::Url;

/// Maximum total length of a generated markdown path, in characters.
pub const MAX_PATH_LENGTH: usize = 200;
/// Maximum length of any single normalized path segment.
pub const MAX_SEGMENT_LENGTH: usize = 100;
/// Maximum length of the query-string suffix appended to a filename.
pub const MAX_QUERY_SUFFIX_LENGTH: usize = 80;
/// Directory holding mirrored `.meta.json` sidecar files.
pub const METADATA_DIR: &str = "__docs_metadata";

const FILE_EXTENSIONS: &[&str] = &[
    ".html", ".htm", ".pdf", ".txt", ".xml", ".json", ".yaml", ".yml", ".md", ".rst",
];

static FORBIDDEN_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._-]").expect("forbidden-char regex"));
static REPEATED_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_]+").expect("repeated-separator regex"));

/// Normalize a raw URL string into canonical form: fragment stripped, host
/// lowercased, trailing slash added to extensionless directory paths, and
/// query strings either stripped or sorted depending on `preserve_query`.
pub fn canonicalize(raw_url: &str, preserve_query: bool) -> Result<CanonicalUrl> {
    let mut url = Url::parse(raw_url).map_err(|e| Error::validation(format!("invalid URL '{raw_url}': {e}")))?;
    url.set_fragment(None);

    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("URL has no host: {raw_url}")))?
        .to_lowercase();
    url.set_host(Some(&host))
        .map_err(|e| Error::validation(format!("invalid host '{host}': {e}")))?;

    let path = url.path().to_string();
    if path.is_empty() {
        url.set_path("/");
    } else if !has_file_extension(&path) && !path.ends_with('/') {
        url.set_path(&format!("{path}/"));
    }

    if !preserve_query {
        url.set_query(None);
    } else if let Some(query) = url.query().map(str::to_owned) {
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        let sorted = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        url.set_query(Some(&sorted));
    }

    Ok(CanonicalUrl::new_unchecked(url.to_string()))
}

/// Build the markdown file path (relative) for a canonical URL.
pub fn markdown_path(url: &CanonicalUrl, preserve_query: bool) -> Result<PathBuf> {
    let parsed = Url::parse(url.as_str())
        .map_err(|e| Error::validation(format!("invalid canonical URL '{url}': {e}")))?;
    let domain = parsed.host_str().unwrap_or("unknown-host").to_lowercase();

    let query_suffix = if preserve_query {
        parsed.query().map(build_query_suffix).unwrap_or_default()
    } else {
        String::new()
    };

    let raw_path = parsed.path();
    let path_parts: Vec<&str> = raw_path.split('/').filter(|p| !p.is_empty()).collect();

    // Whatever the trailing-slash/extension shape of the original path, the
    // last segment becomes `<segment>.md` and everything before it is the
    // directory chain — canonicalize() already normalized slash/extension
    // ambiguity, so there's nothing left to branch on here.
    let (filename, dir_parts): (String, Vec<&str>) = match path_parts.split_last() {
        Some((last, init)) => (format!("{last}.md"), init.to_vec()),
        None => ("index.md".to_string(), vec![]),
    };

    let mut normalized_parts: Vec<String> = vec![domain.clone()];
    normalized_parts.extend(dir_parts.iter().map(|p| normalize_segment(p)));

    let directory: PathBuf = normalized_parts.iter().collect();
    let filename = apply_query_suffix(&filename, &query_suffix);
    let rel_path = directory.join(&filename);

    let rel_str = rel_path.to_string_lossy().to_string();
    if rel_str.len() > MAX_PATH_LENGTH {
        return Ok(truncate_path(&domain, &normalized_parts[1..], &filename));
    }

    Ok(rel_path)
}

/// Build the `.meta.json` sidecar path mirroring a markdown path.
pub fn metadata_path(markdown_rel_path: &Path) -> PathBuf {
    let meta_rel = markdown_rel_path.with_extension("meta.json");
    Path::new(METADATA_DIR).join(meta_rel)
}

fn has_file_extension(segment: &str) -> bool {
    let lower = segment.to_lowercase();
    FILE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn normalize_segment(segment: &str) -> String {
    let decoded = percent_decode(segment);
    let lower = decoded.to_lowercase();
    let spaced = lower.replace(' ', "-");
    let stripped = FORBIDDEN_CHARS.replace_all(&spaced, "_").to_string();
    let collapsed = REPEATED_SEPARATORS.replace_all(&stripped, "-").to_string();
    let trimmed = collapsed.trim_matches(|c| c == '-' || c == '_' || c == '.');

    let result = if trimmed.chars().count() > MAX_SEGMENT_LENGTH {
        let overflow: String = trimmed.chars().skip(MAX_SEGMENT_LENGTH).collect();
        let mut hasher = Sha256::new();
        hasher.update(overflow.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        let head: String = trimmed.chars().take(MAX_SEGMENT_LENGTH - 9).collect();
        format!("{head}-{}", &hash[..8])
    } else {
        trimmed.to_string()
    };

    if result.is_empty() {
        "index".to_string()
    } else {
        result
    }
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(s.replace('+', "%2B").as_bytes())
        .map(|(k, _)| k.into_owned())
        .next()
        .unwrap_or_else(|| s.to_string())
        .into()
}

fn build_query_suffix(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        return String::new();
    }

    let components: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| {
            let key_seg = {
                let n = normalize_segment(&k);
                if n.is_empty() { "param".to_string() } else { n }
            };
            if v.is_empty() {
                key_seg
            } else {
                let val_seg = {
                    let n = normalize_segment(&v);
                    if n.is_empty() { "value".to_string() } else { n }
                };
                format!("{key_seg}_{val_seg}")
            }
        })
        .collect();

    let suffix = format!("__q__{}", components.join("__"));
    if suffix.len() <= MAX_QUERY_SUFFIX_LENGTH {
        return suffix;
    }

    let joined = components.join("__");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("__q__hash_{}", &digest[..12])
}

fn apply_query_suffix(filename: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return filename.to_string();
    }
    match filename.strip_suffix(".md") {
        Some(stem) => format!("{stem}{suffix}.md"),
        None => format!("{filename}{suffix}"),
    }
}

/// Overflow rule: when the full path would exceed [`MAX_PATH_LENGTH`],
/// collapse it to `<domain>/<16-hex-hash-of-middle-segments>/<filename>`.
fn truncate_path(domain: &str, middle_parts: &[String], filename: &str) -> PathBuf {
    let middle = middle_parts.join("/");
    let mut hasher = Sha256::new();
    hasher.update(middle.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    Path::new(domain).join(&hash[..16]).join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_fragment_and_lowercases_host() {
        let c = canonicalize("https://Docs.Example.com/Page#section", false).unwrap();
        assert_eq!(c.as_str(), "https://docs.example.com/Page/");
    }

    #[test]
    fn canonicalize_preserves_extension_without_trailing_slash() {
        let c = canonicalize("https://docs.example.com/guide.html", false).unwrap();
        assert_eq!(c.as_str(), "https://docs.example.com/guide.html");
    }

    #[test]
    fn canonicalize_strips_query_by_default() {
        let c = canonicalize("https://docs.example.com/page?utm=1&b=2", false).unwrap();
        assert!(!c.as_str().contains('?'));
    }

    #[test]
    fn canonicalize_sorts_query_when_preserved() {
        let c = canonicalize("https://docs.example.com/page/?b=2&a=1", true).unwrap();
        assert!(c.as_str().ends_with("?a=1&b=2"));
    }

    #[test]
    fn markdown_path_root_url_is_index() {
        let c = canonicalize("https://docs.example.com/", false).unwrap();
        let p = markdown_path(&c, false).unwrap();
        assert_eq!(p, PathBuf::from("docs.example.com/index.md"));
    }

    #[test]
    fn markdown_path_extensionful_url() {
        let c = canonicalize("https://docs.python.org/3/library/asyncio.html", false).unwrap();
        let p = markdown_path(&c, false).unwrap();
        assert_eq!(
            p,
            PathBuf::from("docs.python.org/3/library/asyncio.html.md")
        );
    }

    #[test]
    fn markdown_path_trailing_slash_url() {
        let c =
            canonicalize("https://docs.djangoproject.com/en/5.2/intro/tutorial01/", false)
                .unwrap();
        let p = markdown_path(&c, false).unwrap();
        assert_eq!(
            p,
            PathBuf::from("docs.djangoproject.com/en/5.2/intro/tutorial01.md")
        );
    }

    #[test]
    fn markdown_path_is_deterministic() {
        let url = "https://docs.example.com/a/b/c";
        let c1 = canonicalize(url, false).unwrap();
        let c2 = canonicalize(url, false).unwrap();
        assert_eq!(markdown_path(&c1, false).unwrap(), markdown_path(&c2, false).unwrap());
    }

    #[test]
    fn metadata_path_mirrors_markdown_path() {
        let md = PathBuf::from("docs.example.com/guide/intro.md");
        let meta = metadata_path(&md);
        assert_eq!(
            meta,
            PathBuf::from("__docs_metadata/docs.example.com/guide/intro.meta.json")
        );
    }

    #[test]
    fn normalize_segment_replaces_spaces_and_forbidden_chars() {
        assert_eq!(normalize_segment("Hello World!"), "hello-world");
    }

    #[test]
    fn normalize_segment_truncates_overlong_segments_with_hash_suffix() {
        let long = "a".repeat(150);
        let normalized = normalize_segment(&long);
        assert!(normalized.len() <= MAX_SEGMENT_LENGTH);
        assert!(normalized.contains('-'));
    }

    #[test]
    fn overflowing_path_collapses_middle_segments() {
        let many_segments = (0..40)
            .map(|i| format!("segment-number-{i}"))
            .collect::<Vec<_>>()
            .join("/");
        let raw = format!("https://docs.example.com/{many_segments}/page");
        let c = canonicalize(&raw, false).unwrap();
        let p = markdown_path(&c, false).unwrap();
        assert!(p.to_string_lossy().len() < raw.len());
        assert!(p.starts_with("docs.example.com"));
    }
}
