//! Breadth-first URL discovery from a seed set.
//!
//! Workers pull from a shared frontier, fetch with the adaptive per-host
//! rate limiter and adaptive concurrency limiter from [`crate::rate_limit`]
//! applied, extract links from every href-bearing element, and hand
//! newly-discovered URLs back to the caller through a callback rather than
//! writing to storage directly — the crawler has no opinion on persistence.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use docsync_shared::{Error, Result};

use crate::rate_limit::{ConcurrencyLimiter, HostRateLimiter};

/// File extensions that are never worth fetching as documentation pages.
const BINARY_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".json", ".xml", ".txt", ".pdf", ".zip", ".tar", ".gz", ".png", ".jpg", ".jpeg", ".gif", ".svg",
    ".ico", ".webp", ".bmp", ".mp3", ".mp4", ".avi", ".mov", ".wav", ".flv", ".wmv", ".doc", ".docx", ".xls", ".xlsx",
    ".ppt", ".pptx", ".woff", ".woff2", ".ttf", ".eot", ".otf",
];

/// Configuration for one crawl invocation.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub timeout: Duration,
    /// Starting per-host delay; see [`HostRateLimiter`].
    pub base_delay_ms: u64,
    pub max_pages: usize,
    pub same_host_only: bool,
    /// Whether query strings are kept when canonicalizing discovered links.
    pub allow_querystrings: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// When set, `should_skip_recent` is never consulted.
    pub force_crawl: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            base_delay_ms: 2000,
            max_pages: 500,
            same_host_only: true,
            allow_querystrings: false,
            min_workers: 1,
            max_workers: 4,
            force_crawl: false,
        }
    }
}

/// Callbacks the crawler uses to hand discovered URLs and skip decisions
/// back to the caller, instead of depending on a storage crate directly.
#[derive(Clone)]
pub struct CrawlHooks {
    /// Fired once per newly-discovered, in-scope, non-binary link.
    pub on_url_discovered: Arc<dyn Fn(&str) + Send + Sync>,
    /// Consulted before fetching; `true` means skip without counting as an error.
    pub should_skip_recent: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl CrawlHooks {
    pub fn new(on_url_discovered: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        Self { on_url_discovered, should_skip_recent: None }
    }

    pub fn with_skip_recent(mut self, should_skip_recent: Arc<dyn Fn(&str) -> bool + Send + Sync>) -> Self {
        self.should_skip_recent = Some(should_skip_recent);
        self
    }
}

/// Summary of a completed crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub errors: Vec<(String, String)>,
    pub duration: Duration,
}

struct FetchOutcome {
    url: String,
    depth_links: Vec<String>,
    rate_limited: bool,
    error: Option<String>,
}

/// BFS crawler over a seed set, with SSRF protection and adaptive pacing.
pub struct Crawler {
    config: CrawlerConfig,
    client: Client,
    allow_localhost: bool,
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("docsync/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client, allow_localhost: false })
    }

    /// Allow crawling localhost/private IPs. Test-only escape hatch for mock servers.
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    #[instrument(skip_all, fields(seeds = seeds.len(), max_pages = self.config.max_pages))]
    pub async fn crawl(&self, seeds: Vec<String>, hooks: CrawlHooks) -> Result<CrawlSummary> {
        let start_time = Instant::now();

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seed_host: Option<String> = None;

        for seed in &seeds {
            let canonical = match docsync_pathbuilder::canonicalize(seed, self.config.allow_querystrings) {
                Ok(c) => c.as_str().to_string(),
                Err(e) => {
                    debug!(seed, error = %e, "skipping unparsable seed URL");
                    continue;
                }
            };
            if seed_host.is_none() {
                seed_host = Url::parse(&canonical).ok().and_then(|u| u.host_str().map(str::to_string));
            }
            if visited.insert(canonical.clone()) {
                queue.push_back(canonical);
            }
        }

        let rate_limiter = Arc::new(HostRateLimiter::new(self.config.base_delay_ms));
        let concurrency = Arc::new(ConcurrencyLimiter::new(self.config.min_workers, self.config.max_workers));
        let visited = Arc::new(Mutex::new(visited));
        let queue = Arc::new(Mutex::new(queue));

        let mut pages_fetched = 0usize;
        let mut pages_skipped = 0usize;
        let mut errors: Vec<(String, String)> = Vec::new();

        info!(min_workers = self.config.min_workers, max_workers = self.config.max_workers, "starting crawl");

        loop {
            if pages_fetched >= self.config.max_pages {
                break;
            }
            let batch = {
                let mut q = queue.lock().await;
                if q.is_empty() {
                    break;
                }
                let ceiling = concurrency.ceiling();
                let take = ceiling.min(q.len()).min(self.config.max_pages - pages_fetched).max(1);
                (0..take).filter_map(|_| q.pop_front()).collect::<Vec<_>>()
            };

            let mut handles = Vec::new();
            for url in batch {
                if let Some(skip) = &hooks.should_skip_recent {
                    if !self.config.force_crawl && skip(&url) {
                        pages_skipped += 1;
                        continue;
                    }
                }

                let parsed = match Url::parse(&url) {
                    Ok(p) => p,
                    Err(_) => {
                        pages_skipped += 1;
                        continue;
                    }
                };

                if !self.allow_localhost && is_ssrf_target(&parsed) {
                    warn!(%url, "SSRF protection: blocked");
                    pages_skipped += 1;
                    continue;
                }

                if self.config.same_host_only {
                    if let (Some(expected), Some(actual)) = (seed_host.as_deref(), parsed.host_str()) {
                        if !actual.eq_ignore_ascii_case(expected) {
                            pages_skipped += 1;
                            continue;
                        }
                    }
                }

                let client = self.client.clone();
                let rate_limiter = rate_limiter.clone();
                let concurrency = concurrency.clone();
                let allow_qs = self.config.allow_querystrings;

                handles.push(tokio::spawn(async move {
                    let _permit = concurrency.acquire().await;
                    let host = parsed.host_str().unwrap_or("").to_string();
                    rate_limiter.wait_for(&host).await;
                    let outcome = fetch_one(&client, &parsed, allow_qs).await;
                    match &outcome {
                        FetchOutcomeResult::RateLimited => {
                            rate_limiter.record_rate_limit(&host).await;
                            concurrency.record_rate_limit().await;
                        }
                        FetchOutcomeResult::Success(_) => {
                            rate_limiter.record_success(&host).await;
                            concurrency.record_success().await;
                        }
                        FetchOutcomeResult::Error(_) => {}
                    }
                    (url, outcome)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((url, FetchOutcomeResult::RateLimited)) => {
                        // Requeue: a 429 is not a failure, just back-pressure.
                        queue.lock().await.push_back(url);
                    }
                    Ok((url, FetchOutcomeResult::Error(reason))) => {
                        errors.push((url, reason));
                        pages_skipped += 1;
                    }
                    Ok((url, FetchOutcomeResult::Success(links))) => {
                        pages_fetched += 1;
                        let mut vis = visited.lock().await;
                        let mut q = queue.lock().await;
                        for link in links {
                            if !vis.insert(link.clone()) {
                                continue;
                            }
                            (hooks.on_url_discovered)(&link);
                            q.push_back(link);
                        }
                        let _ = url;
                    }
                    Err(e) => {
                        warn!(error = %e, "crawl worker task panicked");
                        pages_skipped += 1;
                    }
                }
            }
        }

        let summary = CrawlSummary { pages_fetched, pages_skipped, errors, duration: start_time.elapsed() };
        info!(
            pages_fetched = summary.pages_fetched,
            pages_skipped = summary.pages_skipped,
            errors = summary.errors.len(),
            duration_ms = summary.duration.as_millis(),
            "crawl completed"
        );
        Ok(summary)
    }
}

enum FetchOutcomeResult {
    Success(Vec<String>),
    RateLimited,
    Error(String),
}

async fn fetch_one(client: &Client, url: &Url, allow_querystrings: bool) -> FetchOutcomeResult {
    debug!(%url, "fetching");

    let response = match client.get(url.as_str()).send().await {
        Ok(r) => r,
        Err(e) => return FetchOutcomeResult::Error(format!("{url}: {e}")),
    };

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return FetchOutcomeResult::RateLimited;
    }
    if !response.status().is_success() {
        return FetchOutcomeResult::Error(format!("{url}: HTTP {}", response.status()));
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => return FetchOutcomeResult::Error(format!("{url}: body read failed: {e}")),
    };

    let doc = Html::parse_document(&body);
    let links = extract_links(&doc, url)
        .into_iter()
        .filter(|l| !has_binary_extension(l))
        .filter_map(|l| docsync_pathbuilder::canonicalize(&l, allow_querystrings).ok())
        .map(|c| c.as_str().to_string())
        .collect();

    FetchOutcomeResult::Success(links)
}

/// Every element with an `href` attribute is a candidate link — AWS-style
/// docs sites use custom elements and `<div href>` for navigation, not just `<a>`.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let href_sel = Selector::parse("[href]").expect("static selector");
    let mut links = Vec::new();

    for el in doc.select(&href_sel) {
        let Some(href) = el.value().attr("href") else { continue };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        if let Ok(mut resolved) = base_url.join(href) {
            resolved.set_fragment(None);
            links.push(resolved.to_string());
        }
    }

    links
}

fn has_binary_extension(url: &str) -> bool {
    let path = Url::parse(url).map(|u| u.path().to_lowercase()).unwrap_or_default();
    BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Block non-http(s) schemes, private/loopback/CGNAT IPs, and known local hostnames.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ssrf_blocks_file_scheme() {
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(is_ssrf_target(&url));
    }

    #[test]
    fn ssrf_blocks_private_ips_and_localhost() {
        assert!(is_ssrf_target(&Url::parse("http://192.168.1.1/admin").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://10.0.0.1/").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://127.0.0.1:8080/").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://localhost:3000/api").unwrap()));
        assert!(is_ssrf_target(&Url::parse("http://printer.local/").unwrap()));
    }

    #[test]
    fn ssrf_allows_public_hosts() {
        assert!(!is_ssrf_target(&Url::parse("https://docs.example.com/page").unwrap()));
    }

    #[test]
    fn extract_links_covers_non_anchor_href_elements() {
        let html = r##"<html><body>
            <a href="/page2">Page 2</a>
            <div href="/custom-nav">Custom nav element</div>
            <a href="#section">Anchor only</a>
            <a href="javascript:void(0)">JS link</a>
            <a href="mailto:x@example.com">Mail</a>
        </body></html>"##;
        let doc = Html::parse_document(html);
        let base = Url::parse("https://docs.example.com/page1").unwrap();
        let links = extract_links(&doc, &base);

        assert!(links.contains(&"https://docs.example.com/page2".to_string()));
        assert!(links.contains(&"https://docs.example.com/custom-nav".to_string()));
        assert!(!links.iter().any(|l| l.contains('#')));
        assert!(!links.iter().any(|l| l.starts_with("javascript:")));
        assert!(!links.iter().any(|l| l.starts_with("mailto:")));
    }

    #[test]
    fn binary_extensions_are_filtered() {
        assert!(has_binary_extension("https://docs.example.com/manual.pdf"));
        assert!(has_binary_extension("https://docs.example.com/app.js"));
        assert!(!has_binary_extension("https://docs.example.com/guide/intro"));
    }

    #[tokio::test]
    async fn crawl_follows_links_within_same_host_and_respects_max_pages() {
        let server = wiremock::MockServer::start().await;
        let page1 = r#"<html><body><h1>Root</h1><a href="/page2">next</a></body></html>"#;
        let page2 = r#"<html><body><h1>Page 2</h1><a href="/page3">next</a></body></html>"#;
        let page3 = r#"<html><body><h1>Page 3</h1></body></html>"#;

        wiremock::Mock::given(wiremock::matchers::path("/"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(page1))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::path("/page2"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(page2))
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::path("/page3"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(page3))
            .mount(&server)
            .await;

        let config = CrawlerConfig { base_delay_ms: 0, max_pages: 2, min_workers: 1, max_workers: 2, ..CrawlerConfig::default() };
        let crawler = Crawler::new(config).unwrap().allow_localhost();

        let discovered_count = Arc::new(AtomicUsize::new(0));
        let counter = discovered_count.clone();
        let hooks = CrawlHooks::new(Arc::new(move |_url: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let summary = crawler.crawl(vec![server.uri()], hooks).await.unwrap();
        assert_eq!(summary.pages_fetched, 2);
        assert!(discovered_count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn crawl_honors_should_skip_recent() {
        let server = wiremock::MockServer::start().await;
        let page1 = r#"<html><body><h1>Root</h1><a href="/page2">next</a></body></html>"#;
        wiremock::Mock::given(wiremock::matchers::path("/"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(page1))
            .mount(&server)
            .await;

        let config = CrawlerConfig { base_delay_ms: 0, max_pages: 10, ..CrawlerConfig::default() };
        let crawler = Crawler::new(config).unwrap().allow_localhost();

        let hooks = CrawlHooks::new(Arc::new(|_url: &str| {})).with_skip_recent(Arc::new(|url: &str| url.ends_with("/page2/")));

        let summary = crawler.crawl(vec![server.uri()], hooks).await.unwrap();
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.pages_skipped, 1);
    }

    #[tokio::test]
    async fn crawl_requeues_429_instead_of_counting_it_as_an_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/"))
            .respond_with(wiremock::ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::path("/"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("<html><body><h1>ok</h1></body></html>"))
            .mount(&server)
            .await;

        let config = CrawlerConfig { base_delay_ms: 0, max_pages: 5, ..CrawlerConfig::default() };
        let crawler = Crawler::new(config).unwrap().allow_localhost();
        let hooks = CrawlHooks::new(Arc::new(|_url: &str| {}));

        let summary = crawler.crawl(vec![server.uri()], hooks).await.unwrap();
        assert_eq!(summary.pages_fetched, 1);
        assert!(summary.errors.is_empty());
    }
}
