//! Cache-first page retrieval: fresh/stale TTL logic, an optional semantic
//! fallback, delegation to an external [`Extractor`], and persistence via a
//! [`docsync_uow::UnitOfWork`].
//!
//! `CacheService` never crawls or parses HTML itself — fetching a page is
//! delegated to whatever `Extractor` the caller wires in, following the same
//! dependency-injection shape the original used for its document fetcher.

mod semantic;

pub use semantic::{SemanticCacheMatcher, SemanticCandidate, default_embedding, normalize_url_for_semantic};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docsync_shared::{CanonicalUrl, Document, Error, FetchError, Result, TenantConfig, UrlStatus, config};
use docsync_state::{CrawlStateStore, EventRecord};
use docsync_uow::UnitOfWork;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Number of most-recently-cached documents kept as semantic-match
/// candidates, per the original's `SEMANTIC_CACHE_CANDIDATE_LIMIT`.
const SEMANTIC_CANDIDATE_LIMIT: usize = 200;
/// Minimum cosine similarity for a semantic match to count as confident.
const SEMANTIC_SIMILARITY_THRESHOLD: f64 = 0.82;
/// Maximum number of semantic matches returned per query.
const SEMANTIC_RETURN_LIMIT: usize = 3;

/// A successfully fetched and extracted page, handed back by an
/// [`Extractor`]. Conversion from raw HTML to markdown/text happens outside
/// this crate.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub title: Option<String>,
    pub markdown: String,
    pub text: String,
    pub excerpt: Option<String>,
}

/// External capability that turns a canonical URL into a [`PageResult`].
/// Implementations crawl the network, read from disk, or whatever else a
/// tenant's `source_type` demands — `CacheService` only knows the trait.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn fetch(&self, url: &CanonicalUrl) -> std::result::Result<PageResult, FetchError>;
}

/// Sidecar fields persisted alongside a document's markdown body, enough to
/// reconstruct the rest of [`Document`] on read without re-fetching.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct DocumentSidecar {
    title: Option<String>,
    text: Option<String>,
    excerpt: Option<String>,
}

struct CandidateCache {
    loaded: bool,
    items: Vec<SemanticCandidate>,
}

/// Cache-first retrieval of a single URL, per the tenant's fresh/stale/
/// semantic/fetch waterfall.
pub struct CacheService {
    state: Arc<CrawlStateStore>,
    uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync>,
    extractor: Arc<dyn Extractor>,
    embedding_provider: Arc<dyn Fn(&str) -> Vec<f64> + Send + Sync>,
    matcher: SemanticCacheMatcher,
    min_fetch_interval_hours: i64,
    offline_mode: bool,
    semantic_cache_enabled: bool,
    candidates: Mutex<CandidateCache>,
}

impl CacheService {
    pub fn new(
        state: Arc<CrawlStateStore>,
        uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync>,
        extractor: Arc<dyn Extractor>,
        tenant: &TenantConfig,
    ) -> Self {
        Self {
            state,
            uow_factory,
            extractor,
            embedding_provider: Arc::new(default_embedding),
            matcher: SemanticCacheMatcher::new(SEMANTIC_SIMILARITY_THRESHOLD, SEMANTIC_RETURN_LIMIT),
            min_fetch_interval_hours: tenant.min_fetch_interval_hours,
            offline_mode: config::operation_mode() == "offline",
            semantic_cache_enabled: tenant.use_semantic_cache,
            candidates: Mutex::new(CandidateCache { loaded: false, items: Vec::new() }),
        }
    }

    /// Return the cached document iff it was fetched within
    /// `min_fetch_interval_hours`.
    pub async fn get_cached(&self, url: &str) -> Result<Option<Document>> {
        let canonical = docsync_pathbuilder::canonicalize(url, false)?;
        let Some(doc) = self.load_document(&canonical).await? else { return Ok(None) };
        let age_hours = (Utc::now() - doc.last_fetched_at).num_seconds() as f64 / 3600.0;
        if age_hours < self.min_fetch_interval_hours as f64 {
            tracing::debug!(url, "cache hit");
            return Ok(Some(doc));
        }
        Ok(None)
    }

    /// Return the cached document regardless of age — the offline-mode
    /// fallback of last resort.
    pub async fn get_stale(&self, url: &str) -> Result<Option<Document>> {
        let canonical = docsync_pathbuilder::canonicalize(url, false)?;
        let doc = self.load_document(&canonical).await?;
        if doc.is_some() {
            tracing::warn!(url, "using stale cache (offline mode)");
        }
        Ok(doc)
    }

    /// Universal page fetch with cache check: fresh cache, then (offline)
    /// stale cache, then semantic cache, then a real fetch via the
    /// [`Extractor`]. Returns `(document, was_cached, failure_reason)`.
    ///
    /// `use_semantic_cache = false` forces a network fetch, which the
    /// scheduler relies on for forced full syncs.
    pub async fn check_and_fetch(&self, url: &str, use_semantic_cache: bool) -> Result<(Option<Document>, bool, Option<String>)> {
        if let Some(doc) = self.get_cached(url).await? {
            return Ok((Some(doc), true, None));
        }

        if self.offline_mode {
            if let Some(doc) = self.get_stale(url).await? {
                return Ok((Some(doc), true, None));
            }
            if self.semantic_cache_enabled && use_semantic_cache {
                if let Some(doc) = self.get_semantic_cache_hit(url).await? {
                    return Ok((Some(doc), true, None));
                }
            }
            tracing::warn!(url, "cannot fetch - offline mode and no cache");
            return Ok((None, false, Some("offline_no_cache".to_string())));
        }

        if self.semantic_cache_enabled && use_semantic_cache {
            if let Some(doc) = self.get_semantic_cache_hit(url).await? {
                tracing::info!(url, "semantic cache hit");
                return Ok((Some(doc), true, None));
            }
        }

        tracing::info!(url, "fetching");
        let (doc, failure_reason) = self.fetch_and_cache(url).await?;
        Ok((doc, false, failure_reason))
    }

    async fn get_semantic_cache_hit(&self, url: &str) -> Result<Option<Document>> {
        if !self.semantic_cache_enabled {
            return Ok(None);
        }
        let normalized_query = normalize_url_for_semantic(url);
        let query_vector = (self.embedding_provider)(&normalized_query);
        let candidates = self.semantic_candidates().await?;

        let embedding_provider = self.embedding_provider.as_ref();
        let (matches, confident) = self.matcher.find_similar(url, &query_vector, &candidates, embedding_provider, Some(1));
        if !confident {
            return Ok(None);
        }
        let Some((_, hit)) = matches.into_iter().next() else { return Ok(None) };
        let doc = self.candidate_to_document(&hit).await?;
        Ok(doc)
    }

    /// Materializes a semantic hit into a [`Document`] by loading its
    /// actual cached content; the candidate cache only ever holds a
    /// lightweight title/url stub.
    async fn candidate_to_document(&self, candidate: &SemanticCandidate) -> Result<Option<Document>> {
        self.load_document(&candidate.url).await
    }

    /// Fetch `url` from the source via the [`Extractor`] and cache the
    /// result. On any failure, records the failure in durable state and
    /// returns `(None, Some(reason))`.
    async fn fetch_and_cache(&self, url: &str) -> Result<(Option<Document>, Option<String>)> {
        let canonical = docsync_pathbuilder::canonicalize(url, false)?;
        match self.extractor.fetch(&canonical).await {
            Ok(page) => match self.store_document(&canonical, &page).await {
                Ok(doc) => Ok((Some(doc), None)),
                Err(e) => {
                    let reason = format!("cache_store_failed:{e}");
                    tracing::warn!(url, %reason, "cache write failed");
                    self.mark_document_failure(&canonical, &reason).await?;
                    Ok((None, Some(reason)))
                }
            },
            Err(fetch_err) => {
                let reason = fetch_err.format_reason();
                tracing::warn!(url, %reason, "fetcher could not extract page");
                self.mark_document_failure(&canonical, &reason).await?;
                Ok((None, Some(reason)))
            }
        }
    }

    async fn store_document(&self, canonical: &CanonicalUrl, page: &PageResult) -> Result<Document> {
        let rel_path = docsync_pathbuilder::markdown_path(canonical, false)?;
        let uow = (self.uow_factory)()?;
        uow.write_document(&rel_path, &page.markdown)?;
        let sidecar = DocumentSidecar { title: page.title.clone(), text: Some(page.text.clone()), excerpt: page.excerpt.clone() };
        uow.write_metadata(&rel_path, &serde_json::to_value(&sidecar).map_err(|e| Error::validation(e.to_string()))?)?;
        uow.commit()?;

        let content_hash = format!("{:x}", Sha256::digest(page.markdown.as_bytes()));
        let now = Utc::now();
        let rel_path_str = rel_path.to_string_lossy().to_string();
        self.state
            .upsert_url_metadata(canonical.as_str(), None, Some(now), None, UrlStatus::Success, 0, None, Some(&rel_path_str), Some(&content_hash))
            .await?;
        self.state
            .record_event(EventRecord { url: Some(canonical.as_str()), event_type: "fetch_success", status: Some("success"), ..Default::default() })
            .await?;

        if let Some(title) = page.title.as_deref() {
            if !title.trim().is_empty() {
                self.record_semantic_candidate(canonical.clone(), title.to_string()).await;
            }
        }

        Ok(Document {
            url: canonical.clone(),
            title: page.title.clone(),
            markdown: page.markdown.clone(),
            text: page.text.clone(),
            excerpt: page.excerpt.clone().unwrap_or_default(),
            markdown_rel_path: rel_path_str,
            first_seen_at: now,
            last_fetched_at: now,
        })
    }

    async fn mark_document_failure(&self, canonical: &CanonicalUrl, reason: &str) -> Result<()> {
        let existing = self.state.load_url_metadata(canonical.as_str()).await?;
        let retry_count = existing.as_ref().map(|m| m.failure_count + 1).unwrap_or(1);
        let markdown_rel_path = existing.as_ref().and_then(|m| m.markdown_rel_path.clone());
        let content_hash = existing.as_ref().and_then(|m| m.content_hash.clone());

        self.state
            .upsert_url_metadata(
                canonical.as_str(),
                None,
                None,
                None,
                UrlStatus::Failed,
                retry_count,
                Some(reason),
                markdown_rel_path.as_deref(),
                content_hash.as_deref(),
            )
            .await?;
        self.state
            .record_event(EventRecord { url: Some(canonical.as_str()), event_type: "fetch_failure", status: Some("failed"), reason: Some(reason), ..Default::default() })
            .await
    }

    /// Loads the candidate cache on first use from the most recently
    /// successful URLs, then keeps it updated in-process as documents are
    /// stored — never re-reads from durable state after that.
    async fn semantic_candidates(&self) -> Result<Vec<SemanticCandidate>> {
        let mut guard = self.candidates.lock().await;
        if guard.loaded {
            return Ok(guard.items.clone());
        }

        let mut all = self.state.list_all_metadata().await?;
        all.retain(|m| m.status == UrlStatus::Success && m.markdown_rel_path.is_some());
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(SEMANTIC_CANDIDATE_LIMIT);

        let mut items = Vec::with_capacity(all.len());
        for meta in all {
            let Some(rel_path) = meta.markdown_rel_path.as_deref().map(PathBuf::from) else { continue };
            let title = self.read_title(&rel_path)?.unwrap_or_else(|| meta.url.as_str().to_string());
            items.push(SemanticCandidate { url: meta.url, title });
        }

        guard.items = items.clone();
        guard.loaded = true;
        Ok(items)
    }

    fn read_title(&self, markdown_rel_path: &std::path::Path) -> Result<Option<String>> {
        let uow = (self.uow_factory)()?;
        let meta_rel_path = docsync_pathbuilder::metadata_path(markdown_rel_path);
        let Some(raw) = uow.read(&meta_rel_path)? else { return Ok(None) };
        let sidecar: DocumentSidecar = serde_json::from_str(&raw).unwrap_or_default();
        Ok(sidecar.title)
    }

    async fn record_semantic_candidate(&self, url: CanonicalUrl, title: String) {
        let mut guard = self.candidates.lock().await;
        if !guard.loaded {
            return;
        }
        let mut updated = vec![SemanticCandidate { url: url.clone(), title }];
        for existing in guard.items.drain(..) {
            if existing.url == url {
                continue;
            }
            updated.push(existing);
            if updated.len() >= SEMANTIC_CANDIDATE_LIMIT {
                break;
            }
        }
        guard.items = updated;
    }

    async fn load_document(&self, canonical: &CanonicalUrl) -> Result<Option<Document>> {
        let Some(meta) = self.state.load_url_metadata(canonical.as_str()).await? else { return Ok(None) };
        if meta.status != UrlStatus::Success {
            return Ok(None);
        }
        let Some(rel_path_str) = meta.markdown_rel_path.clone() else { return Ok(None) };
        let rel_path = PathBuf::from(&rel_path_str);

        let uow = (self.uow_factory)()?;
        let Some(markdown) = uow.read(&rel_path)? else { return Ok(None) };
        let meta_rel_path = docsync_pathbuilder::metadata_path(&rel_path);
        let sidecar: DocumentSidecar = match uow.read(&meta_rel_path)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => DocumentSidecar::default(),
        };

        let last_fetched_at: DateTime<Utc> = meta.last_event_at.unwrap_or(meta.updated_at);
        Ok(Some(Document {
            url: canonical.clone(),
            title: sidecar.title,
            markdown: markdown.clone(),
            text: sidecar.text.unwrap_or(markdown),
            excerpt: sidecar.excerpt.unwrap_or_default(),
            markdown_rel_path: rel_path_str,
            first_seen_at: meta.discovered_at,
            last_fetched_at,
        }))
    }

    /// Number of documents currently stored for this tenant.
    pub async fn stats(&self) -> Result<CacheStats> {
        let all = self.state.list_all_metadata().await?;
        let documents = all.iter().filter(|m| m.status == UrlStatus::Success).count() as u64;
        Ok(CacheStats { documents })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub documents: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_shared::SourceType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_tenant() -> TenantConfig {
        TenantConfig {
            id: "acme".into(),
            source_type: SourceType::Online,
            entry_urls: vec!["https://docs.example.com/".into()],
            sitemap_url: None,
            local_path: None,
            cron_schedule: "0 */6 * * *".into(),
            crawl_depth: 5,
            crawl_concurrency: 4,
            rate_limit_ms: 250,
            min_fetch_interval_hours: 24,
            use_semantic_cache: true,
            url_policy: Default::default(),
        }
    }

    struct StubExtractor {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Extractor for StubExtractor {
        async fn fetch(&self, url: &CanonicalUrl) -> std::result::Result<PageResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::HttpStatus(500));
            }
            Ok(PageResult {
                title: Some(format!("Title for {}", url.as_str())),
                markdown: "# Heading\n\nBody.".into(),
                text: "Heading Body.".into(),
                excerpt: Some("Body.".into()),
            })
        }
    }

    async fn test_service(fail: bool) -> (CacheService, tempfile::TempDir, Arc<StubExtractor>) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(CrawlStateStore::open(dir.path()).await.unwrap());
        let base = dir.path().to_path_buf();
        let uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync> = Arc::new(move || UnitOfWork::open(&base));
        let extractor = Arc::new(StubExtractor { calls: AtomicU32::new(0), fail });
        let service = CacheService::new(state, uow_factory, extractor.clone(), &test_tenant());
        (service, dir, extractor)
    }

    #[tokio::test]
    async fn check_and_fetch_stores_then_hits_fresh_cache() {
        let (service, _dir, extractor) = test_service(false).await;
        let url = "https://docs.example.com/guide";

        let (doc, cached, reason) = service.check_and_fetch(url, true).await.unwrap();
        assert!(doc.is_some());
        assert!(!cached);
        assert!(reason.is_none());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        let (doc2, cached2, _) = service.check_and_fetch(url, true).await.unwrap();
        assert!(doc2.is_some());
        assert!(cached2);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1, "fresh cache hit must not re-fetch");
    }

    #[tokio::test]
    async fn fetch_failure_records_reason_and_marks_failed() {
        let (service, _dir, _extractor) = test_service(true).await;
        let url = "https://docs.example.com/broken";

        let (doc, cached, reason) = service.check_and_fetch(url, true).await.unwrap();
        assert!(doc.is_none());
        assert!(!cached);
        assert_eq!(reason.as_deref(), Some("http_status:500"));
    }

    #[tokio::test]
    async fn offline_mode_without_cache_reports_offline_no_cache() {
        unsafe { std::env::set_var("OPERATION_MODE", "offline") };
        let (service, _dir, extractor) = test_service(false).await;
        let url = "https://docs.example.com/never-cached";

        let (doc, cached, reason) = service.check_and_fetch(url, true).await.unwrap();
        assert!(doc.is_none());
        assert!(!cached);
        assert_eq!(reason.as_deref(), Some("offline_no_cache"));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0, "offline mode must never hit the network");
        unsafe { std::env::remove_var("OPERATION_MODE") };
    }

    #[tokio::test]
    async fn forced_sync_bypasses_semantic_cache() {
        let (service, _dir, extractor) = test_service(false).await;
        service.check_and_fetch("https://docs.example.com/a", true).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        // A different but similar-titled URL would normally be a semantic
        // hit; use_semantic_cache=false must force a real fetch instead.
        let (_doc, cached, _) = service.check_and_fetch("https://docs.example.com/a-guide", false).await.unwrap();
        assert!(!cached);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }
}
