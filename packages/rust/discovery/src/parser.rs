//! Tolerant sitemap XML parsing.
//!
//! Sitemaps in the wild are not always well-formed; a single malformed
//! `<url>` entry (missing `<loc>`, bad `<lastmod>`) is skipped rather than
//! failing the whole document.

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use docsync_shared::{Error, Result};

/// One `<url>` entry from a sitemap.
#[derive(Debug, Clone)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<DateTime<Utc>>,
}

/// Parse raw sitemap XML bytes into entries. Elements are matched by local
/// name only (`{*}url`/`{*}loc`/`{*}lastmod` in the original's terms) so a
/// namespaced `<urlset xmlns="...">` parses the same as a bare one.
pub fn parse_sitemap(xml: &[u8]) -> Result<Vec<SitemapEntry>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();

    let mut in_url = false;
    let mut in_loc = false;
    let mut in_lastmod = false;
    let mut current_loc: Option<String> = None;
    let mut current_lastmod: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) => match local_name(tag.name().as_ref()) {
                "url" => {
                    in_url = true;
                    current_loc = None;
                    current_lastmod = None;
                }
                "loc" if in_url => in_loc = true,
                "lastmod" if in_url => in_lastmod = true,
                _ => {}
            },
            Ok(Event::Text(text)) => {
                if in_loc {
                    current_loc = Some(text.unescape().map_err(|e| Error::parse(e.to_string()))?.into_owned());
                } else if in_lastmod {
                    current_lastmod = Some(text.unescape().map_err(|e| Error::parse(e.to_string()))?.into_owned());
                }
            }
            Ok(Event::End(tag)) => match local_name(tag.name().as_ref()) {
                "loc" => in_loc = false,
                "lastmod" => in_lastmod = false,
                "url" => {
                    in_url = false;
                    if let Some(loc) = current_loc.take() {
                        let lastmod = current_lastmod
                            .take()
                            .and_then(|raw| parse_lastmod(&raw));
                        entries.push(SitemapEntry { loc, lastmod });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::parse(format!("sitemap XML error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn local_name(qualified: &[u8]) -> &str {
    let s = std::str::from_utf8(qualified).unwrap_or("");
    s.rsplit(':').next().unwrap_or(s)
}

/// `<lastmod>` is usually RFC 3339 but sometimes uses `Z` in place of an
/// offset, or is date-only. Malformed values are dropped rather than
/// failing the entry.
fn parse_lastmod(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.replace('Z', "+00:00");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_urlset() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://docs.example.com/a</loc><lastmod>2026-01-15T10:00:00Z</lastmod></url>
  <url><loc>https://docs.example.com/b</loc></url>
</urlset>"#;
        let entries = parse_sitemap(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].loc, "https://docs.example.com/a");
        assert!(entries[0].lastmod.is_some());
        assert!(entries[1].lastmod.is_none());
    }

    #[test]
    fn skips_url_entries_missing_loc() {
        let xml = br#"<urlset><url><lastmod>2026-01-01</lastmod></url><url><loc>https://x.example/c</loc></url></urlset>"#;
        let entries = parse_sitemap(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].loc, "https://x.example/c");
    }

    #[test]
    fn date_only_lastmod_parses() {
        let xml = br#"<urlset><url><loc>https://x.example/d</loc><lastmod>2026-02-01</lastmod></url></urlset>"#;
        let entries = parse_sitemap(xml).unwrap();
        assert!(entries[0].lastmod.is_some());
    }
}
