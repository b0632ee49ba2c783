//! Sitemap fetching with change detection, and bounded-concurrency
//! resolution of configured entry URLs.
//!
//! This is the "fast path" of discovery: a sitemap tells us the full set of
//! pages up front, filtered through a tenant's [`UrlPolicy`] and hashed so a
//! sync cycle can tell whether anything changed since the last fetch without
//! re-crawling. Entry-URL resolution is the smaller companion job of
//! confirming a configured seed URL is reachable (following redirects)
//! before handing it to the crawler.

mod parser;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docsync_shared::{Error, InfraConfig, Result, SitemapSnapshot, UrlPolicy};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub use parser::SitemapEntry;

/// Sitemap downloads get the full window the original allowed: 120s total,
/// since a large docs site's sitemap can be several megabytes.
const SITEMAP_TIMEOUT_SECS: u64 = 120;
const MAX_REDIRECTS: usize = 10;

/// A fetched and parsed sitemap, already filtered through a [`UrlPolicy`].
#[derive(Debug, Clone)]
pub struct SitemapDocument {
    pub url: String,
    pub content_hash: String,
    pub entries: Vec<SitemapEntry>,
    pub total_urls: usize,
    pub filtered_count: usize,
    pub fetched_at: DateTime<Utc>,
}

/// Result of comparing a freshly fetched sitemap against its stored
/// snapshot from the previous cycle.
#[derive(Debug, Clone)]
pub struct SitemapDiff {
    pub changed: bool,
    pub urls: Vec<String>,
}

/// Outcome of resolving one configured entry URL.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub requested: String,
    pub resolved: String,
    pub reachable: bool,
    pub status: Option<u16>,
}

/// Fetch and parse a sitemap, filtering entries through `policy` and hashing
/// the raw bytes for change detection.
#[instrument(skip(policy, infra), fields(url = %url))]
pub async fn fetch_sitemap(url: &str, policy: &UrlPolicy, infra: &InfraConfig) -> Result<SitemapDocument> {
    let client = build_client(infra)?;
    info!("fetching sitemap");

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/xml,application/xml;q=0.9,*/*;q=0.8")
        .send()
        .await
        .map_err(|e| Error::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Network(format!("{url}: HTTP {status}")));
    }

    let bytes = response.bytes().await.map_err(|e| Error::Network(format!("{url}: failed to read body: {e}")))?;
    if bytes.is_empty() {
        return Err(Error::parse(format!("{url}: empty sitemap response")));
    }

    let content_hash = format!("{:x}", Sha256::digest(&bytes));
    let all_entries = parser::parse_sitemap(&bytes)?;
    let total_urls = all_entries.len();
    let entries: Vec<SitemapEntry> = all_entries.into_iter().filter(|e| policy.allows(&e.loc)).collect();
    let filtered_count = total_urls - entries.len();

    info!(total_urls, filtered_count, kept = entries.len(), "sitemap fetched");

    Ok(SitemapDocument { url: url.to_string(), content_hash, entries, total_urls, filtered_count, fetched_at: Utc::now() })
}

/// Compare a freshly fetched sitemap against the previous cycle's stored
/// snapshot. A missing snapshot always counts as changed.
pub fn diff_against_snapshot(doc: &SitemapDocument, stored: Option<&SitemapSnapshot>) -> SitemapDiff {
    let changed = match stored {
        Some(prev) => prev.content_hash != doc.content_hash,
        None => true,
    };
    SitemapDiff { changed, urls: doc.entries.iter().map(|e| e.loc.clone()).collect() }
}

/// Resolve a set of configured entry URLs with bounded-concurrency HEAD
/// requests, following redirects. Unreachable entries are still returned
/// (with `reachable: false`) so the caller can log or skip them.
#[instrument(skip(urls, policy, infra))]
pub async fn resolve_entry_urls(urls: &[String], policy: &UrlPolicy, infra: &InfraConfig, concurrency: usize) -> Result<Vec<ResolvedEntry>> {
    let concurrency = concurrency.clamp(1, 8);
    let client = build_client(infra)?;
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for url in urls.iter().filter(|u| policy.allows(u)).cloned() {
        let client = client.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            resolve_one(&client, &url).await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => warn!(error = %e, "entry URL resolution task panicked"),
        }
    }
    Ok(results)
}

async fn resolve_one(client: &Client, url: &str) -> ResolvedEntry {
    match client.head(url).send().await {
        Ok(response) => ResolvedEntry {
            requested: url.to_string(),
            resolved: response.url().to_string(),
            reachable: response.status().is_success(),
            status: Some(response.status().as_u16()),
        },
        Err(e) => {
            debug!(url, error = %e, "HEAD request failed during entry resolution");
            ResolvedEntry { requested: url.to_string(), resolved: url.to_string(), reachable: false, status: None }
        }
    }
}

fn build_client(infra: &InfraConfig) -> Result<Client> {
    Client::builder()
        .user_agent(infra.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(SITEMAP_TIMEOUT_SECS))
        .build()
        .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infra() -> InfraConfig {
        InfraConfig {
            data_root: "/tmp/docsync-test".into(),
            http_timeout_secs: 30,
            user_agent: "docsync-test/0.1".into(),
            event_retention_days: 49,
            event_max_rows: 200_000,
        }
    }

    #[tokio::test]
    async fn fetch_sitemap_parses_and_hashes() {
        let server = wiremock::MockServer::start().await;
        let body = r#"<urlset><url><loc>https://docs.example.com/a</loc></url><url><loc>https://docs.example.com/b</loc></url></urlset>"#;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/sitemap.xml"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let url = format!("{}/sitemap.xml", server.uri());
        let doc = fetch_sitemap(&url, &UrlPolicy::default(), &infra()).await.unwrap();
        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.total_urls, 2);
        assert_eq!(doc.filtered_count, 0);
        assert!(!doc.content_hash.is_empty());
    }

    #[tokio::test]
    async fn fetch_sitemap_applies_url_policy() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();
        let body = format!(
            "<urlset><url><loc>{base}/keep</loc></url><url><loc>{base}/internal/drop</loc></url></urlset>"
        );
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/sitemap.xml"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let policy = UrlPolicy { allow_prefixes: vec![], deny_prefixes: vec![format!("{base}/internal/")] };
        let url = format!("{base}/sitemap.xml");
        let doc = fetch_sitemap(&url, &policy, &infra()).await.unwrap();
        assert_eq!(doc.entries.len(), 1);
        assert_eq!(doc.filtered_count, 1);
    }

    #[tokio::test]
    async fn fetch_sitemap_rejects_non_success_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/sitemap.xml"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = format!("{}/sitemap.xml", server.uri());
        let result = fetch_sitemap(&url, &UrlPolicy::default(), &infra()).await;
        assert!(result.is_err());
    }

    #[test]
    fn diff_against_snapshot_detects_change() {
        let doc = SitemapDocument {
            url: "https://x.example/sitemap.xml".into(),
            content_hash: "abc123".into(),
            entries: vec![SitemapEntry { loc: "https://x.example/a".into(), lastmod: None }],
            total_urls: 1,
            filtered_count: 0,
            fetched_at: Utc::now(),
        };

        let stored = SitemapSnapshot { url: doc.url.clone(), content_hash: "different".into(), url_count: 1, fetched_at: Utc::now() };
        assert!(diff_against_snapshot(&doc, Some(&stored)).changed);

        let same = SitemapSnapshot { url: doc.url.clone(), content_hash: "abc123".into(), url_count: 1, fetched_at: Utc::now() };
        assert!(!diff_against_snapshot(&doc, Some(&same)).changed);

        assert!(diff_against_snapshot(&doc, None).changed);
    }

    #[tokio::test]
    async fn resolve_entry_urls_filters_via_policy_and_follows_redirect() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();
        wiremock::Mock::given(wiremock::matchers::method("HEAD"))
            .and(wiremock::matchers::path("/old"))
            .respond_with(wiremock::ResponseTemplate::new(301).insert_header("Location", format!("{base}/new")))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("HEAD"))
            .and(wiremock::matchers::path("/new"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let urls = vec![format!("{base}/old"), format!("{base}/internal/skip")];
        let policy = UrlPolicy { allow_prefixes: vec![], deny_prefixes: vec![format!("{base}/internal/")] };
        let resolved = resolve_entry_urls(&urls, &policy, &infra(), 4).await.unwrap();

        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].reachable);
        assert!(resolved[0].resolved.ends_with("/new"));
    }
}
