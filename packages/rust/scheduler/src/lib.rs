//! Per-tenant application facade: wires `docsync-state`, `docsync-cache`,
//! and a [`scheduler::SyncScheduler`] together, and exposes the handful of
//! read operations a hosting surface (MCP server, HTTP API, CLI) needs.

pub mod scheduler;
pub mod sync_progress;

pub use scheduler::{
    CRAWLER_LOCK_NAME, SyncCompleteHook, SyncMode, SyncScheduler, SyncSchedulerConfig, SyncSchedulerStats, TriggerOutcome,
};
pub use sync_progress::{FailureInfo, SyncEvent, SyncPhase, SyncProgress, SyncStats};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_cache::{CacheService, Extractor};
use docsync_shared::{Error, InfraConfig, Result, SourceType, TenantConfig};
use docsync_state::CrawlStateStore;
use docsync_uow::UnitOfWork;
use serde::Serialize;

/// External full-text search, injected the same way [`Extractor`] is:
/// this crate has no opinion on ranking or indexing, only on calling it.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search(&self, query: &str, size: usize, word_match: bool) -> Result<SearchResults>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub excerpt: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

/// How much of a cached document [`TenantApp::fetch`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchContext {
    Full,
    Surrounding,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub url: String,
    pub title: Option<String>,
    pub markdown: Option<String>,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub tenant: String,
    pub name: String,
    pub documents: u64,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub is_dir: bool,
    pub children: Vec<TreeEntry>,
}

/// Everything needed to run one tenant: its crawl state, cache, and the
/// scheduler that drives them on a cron.
pub struct TenantApp {
    tenant_codename: String,
    corpus_root: PathBuf,
    tenant: TenantConfig,
    #[allow(dead_code)]
    state: Arc<CrawlStateStore>,
    cache: Arc<CacheService>,
    scheduler: Arc<SyncScheduler>,
    search_index: Option<Arc<dyn SearchIndex>>,
}

impl TenantApp {
    /// Assemble a tenant's storage, cache, and scheduler from config. Does
    /// not start the scheduler — call [`TenantApp::initialize`] for that.
    pub async fn bootstrap(
        tenant: TenantConfig,
        infra: InfraConfig,
        extractor: Arc<dyn Extractor>,
        search_index: Option<Arc<dyn SearchIndex>>,
        on_sync_complete: Option<Arc<dyn SyncCompleteHook>>,
    ) -> Result<Self> {
        let data_root = expand_data_root(&infra.data_root)?;
        let tenant_root = data_root.join(&tenant.id);
        std::fs::create_dir_all(&tenant_root).map_err(|e| Error::io(tenant_root.clone(), e))?;

        let state = Arc::new(CrawlStateStore::open(&tenant_root).await?);

        let documents_root = tenant_root.join("documents");
        let uow_root = documents_root.clone();
        let uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync> = Arc::new(move || UnitOfWork::open(&uow_root));

        match docsync_uow::sweep_orphaned_staging(&documents_root, Duration::from_secs(24 * 3600)) {
            Ok(0) => {}
            Ok(n) => tracing::info!(tenant = %tenant.id, swept = n, "cleaned up orphaned staging directories"),
            Err(e) => tracing::warn!(tenant = %tenant.id, error = %e, "failed to sweep orphaned staging directories"),
        }

        let cache = Arc::new(CacheService::new(Arc::clone(&state), Arc::clone(&uow_factory), extractor, &tenant));

        let sitemap_urls = match &tenant.sitemap_url {
            Some(explicit) => vec![explicit.clone()],
            None => default_sitemap_url(&tenant.entry_urls).into_iter().collect(),
        };

        let scheduler_config = SyncSchedulerConfig {
            sitemap_urls,
            entry_urls: tenant.entry_urls.clone(),
            refresh_schedule: Some(tenant.cron_schedule.clone()),
            ..Default::default()
        };

        let scheduler = Arc::new(SyncScheduler::new(
            tenant.id.clone(),
            Arc::clone(&state),
            Arc::clone(&uow_factory),
            Arc::clone(&cache),
            tenant.clone(),
            infra,
            scheduler_config,
            on_sync_complete,
        )?);

        Ok(Self {
            tenant_codename: tenant.id.clone(),
            corpus_root: documents_root,
            tenant,
            state,
            cache,
            scheduler,
            search_index,
        })
    }

    pub fn tenant_codename(&self) -> &str {
        &self.tenant_codename
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub async fn initialize(&self) -> Result<()> {
        self.scheduler.start().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let stats = self.cache.stats().await?;
        Ok(HealthReport {
            status: "ok".to_string(),
            tenant: self.tenant_codename.clone(),
            name: self.tenant.id.clone(),
            documents: stats.documents,
            source_type: self.tenant.source_type,
        })
    }

    pub async fn search(&self, query: &str, size: usize, word_match: bool) -> Result<SearchResults> {
        match &self.search_index {
            Some(index) => index.search(query, size, word_match).await,
            None => Err(Error::domain_state("no search index configured for this tenant")),
        }
    }

    /// Read a document straight from the durable corpus, ignoring
    /// freshness — the offline-mode fallback, repurposed as an explicit
    /// "give me whatever we have" read API.
    pub async fn fetch(&self, uri: &str, context: FetchContext) -> Result<Option<FetchResult>> {
        let Some(doc) = self.cache.get_stale(uri).await? else { return Ok(None) };
        let result = match context {
            FetchContext::Full => FetchResult {
                url: doc.url.as_str().to_string(),
                title: doc.title,
                markdown: Some(doc.markdown),
                excerpt: Some(doc.excerpt),
            },
            FetchContext::Surrounding => {
                FetchResult { url: doc.url.as_str().to_string(), title: doc.title, markdown: None, excerpt: Some(doc.excerpt) }
            }
            FetchContext::None => FetchResult { url: doc.url.as_str().to_string(), title: doc.title, markdown: None, excerpt: None },
        };
        Ok(Some(result))
    }

    /// Walk the tenant's document corpus below `path`, `depth` levels deep.
    pub fn browse_tree(&self, path: &str, depth: u32) -> Result<TreeEntry> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::validation("path must not contain '..' segments"));
        }
        let depth = depth.clamp(1, 6);
        let root = self.corpus_root.join(path.trim_start_matches('/'));
        build_tree_entry(&root, &self.corpus_root, depth)
    }
}

fn build_tree_entry(absolute: &std::path::Path, corpus_root: &std::path::Path, depth_remaining: u32) -> Result<TreeEntry> {
    let relative = absolute.strip_prefix(corpus_root).unwrap_or(absolute).to_string_lossy().to_string();
    let is_dir = absolute.is_dir();
    let mut children = Vec::new();

    if is_dir && depth_remaining > 0 {
        let mut entries: Vec<_> =
            std::fs::read_dir(absolute).map_err(|e| Error::io(absolute, e))?.filter_map(|entry| entry.ok()).collect();
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            children.push(build_tree_entry(&entry.path(), corpus_root, depth_remaining - 1)?);
        }
    }

    Ok(TreeEntry { path: relative, is_dir, children })
}

fn expand_data_root(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir().ok_or_else(|| Error::config("cannot resolve home directory for data_root"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// When a tenant doesn't configure `sitemap_url` explicitly, guess the
/// conventional `<origin>/sitemap.xml` from its first entry URL.
fn default_sitemap_url(entry_urls: &[String]) -> Option<String> {
    let first = entry_urls.first()?;
    let parsed = url::Url::parse(first).ok()?;
    Some(format!("{}://{}/sitemap.xml", parsed.scheme(), parsed.host_str()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_data_root_resolves_home_prefix() {
        let resolved = expand_data_root("~/docsync-data").unwrap();
        assert!(resolved.ends_with("docsync-data"));
        assert_ne!(resolved, PathBuf::from("~/docsync-data"));
    }

    #[test]
    fn expand_data_root_leaves_absolute_paths_alone() {
        let resolved = expand_data_root("/var/lib/docsync").unwrap();
        assert_eq!(resolved, PathBuf::from("/var/lib/docsync"));
    }

    #[test]
    fn default_sitemap_url_derives_from_first_entry() {
        let urls = vec!["https://docs.acme.test/guide/".to_string()];
        assert_eq!(default_sitemap_url(&urls).as_deref(), Some("https://docs.acme.test/sitemap.xml"));
    }

    #[test]
    fn build_tree_entry_walks_nested_directories_up_to_depth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("guides/setup")).unwrap();
        std::fs::write(dir.path().join("guides/intro.md"), b"hi").unwrap();
        std::fs::write(dir.path().join("guides/setup/install.md"), b"hi").unwrap();

        let shallow = build_tree_entry(dir.path(), dir.path(), 1).unwrap();
        let guides = &shallow.children[0];
        assert_eq!(guides.path, "guides");
        assert!(guides.is_dir);
        assert!(guides.children.is_empty(), "depth 1 should not descend into guides/");

        let deep = build_tree_entry(dir.path(), dir.path(), 3).unwrap();
        let guides = &deep.children[0];
        assert_eq!(guides.children.len(), 2);
    }
}
