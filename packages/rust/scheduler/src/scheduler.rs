//! Cron-driven sync orchestration: one [`SyncScheduler`] per tenant, owning
//! a background loop that decides when a sync cycle is due, runs it, and
//! tracks resumable state through [`crate::sync_progress::SyncProgress`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use docsync_cache::CacheService;
use docsync_crawler::{CrawlHooks, Crawler, CrawlerConfig};
use docsync_shared::{Error, InfraConfig, LockLease, Result, TenantConfig, UrlStatus};
use docsync_state::CrawlStateStore;
use docsync_uow::UnitOfWork;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::sync_progress::{SyncPhase, SyncProgress};

pub const CRAWLER_LOCK_NAME: &str = "crawler";
const PROGRESS_CHECKPOINT_KEY: &str = "sync_progress";
const DEQUEUE_BATCH_SIZE: u32 = 25;

/// Static configuration for one tenant's [`SyncScheduler`].
#[derive(Debug, Clone)]
pub struct SyncSchedulerConfig {
    pub sitemap_urls: Vec<String>,
    pub entry_urls: Vec<String>,
    /// `None` disables automatic scheduling; only `trigger_sync` runs a cycle.
    pub refresh_schedule: Option<String>,
    pub crawler_lock_ttl_seconds: i64,
    /// Caps exponential retry backoff: `max(1, max_sync_interval_days * 24)` hours.
    pub max_sync_interval_days: i64,
    pub checkpoint_interval: Duration,
}

impl Default for SyncSchedulerConfig {
    fn default() -> Self {
        Self {
            sitemap_urls: Vec::new(),
            entry_urls: Vec::new(),
            refresh_schedule: Some("0 */6 * * *".to_string()),
            crawler_lock_ttl_seconds: 300,
            max_sync_interval_days: 30,
            checkpoint_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Sitemap,
    Entry,
    Hybrid,
}

/// Snapshot of scheduler-level bookkeeping, separate from per-URL state
/// which lives in `docsync-state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSchedulerStats {
    pub mode: SyncMode,
    pub refresh_schedule: Option<String>,
    pub schedule_interval_hours: f64,
    pub schedule_interval_hours_effective: f64,
    pub total_syncs: u64,
    pub errors: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub crawler_lock_status: String,
    pub crawler_lock_owner: Option<String>,
    pub crawler_lock_expires_at: Option<DateTime<Utc>>,
    pub force_full_sync_active: bool,
    pub last_error: Option<String>,
}

/// Result of a manually triggered sync, mirroring the shape handed back to
/// an HTTP trigger endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub success: bool,
    pub message: String,
}

/// Async callback invoked after a sync cycle completes successfully —
/// typically wired to an external search index's invalidate-and-rebuild hook.
#[async_trait]
pub trait SyncCompleteHook: Send + Sync {
    async fn on_sync_complete(&self, tenant_codename: &str);
}

struct CyclePlan {
    seed_urls: Vec<String>,
    bypass_idempotency: bool,
    should_run_crawler: bool,
    lastmod_by_url: HashMap<String, DateTime<Utc>>,
}

pub struct SyncScheduler {
    tenant_codename: String,
    state: Arc<CrawlStateStore>,
    #[allow(dead_code)]
    uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync>,
    cache: Arc<CacheService>,
    tenant: TenantConfig,
    infra: InfraConfig,
    config: SyncSchedulerConfig,
    schedule: Option<Schedule>,
    schedule_interval_hours: f64,
    lock_identity: String,
    on_sync_complete: Option<Arc<dyn SyncCompleteHook>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<SyncSchedulerStats>>,
}

impl SyncScheduler {
    pub fn new(
        tenant_codename: impl Into<String>,
        state: Arc<CrawlStateStore>,
        uow_factory: Arc<dyn Fn() -> Result<UnitOfWork> + Send + Sync>,
        cache: Arc<CacheService>,
        tenant: TenantConfig,
        infra: InfraConfig,
        config: SyncSchedulerConfig,
        on_sync_complete: Option<Arc<dyn SyncCompleteHook>>,
    ) -> Result<Self> {
        if config.sitemap_urls.is_empty() && config.entry_urls.is_empty() {
            return Err(Error::config("at least one of sitemap_urls or entry_urls must be provided"));
        }
        let mode = match (!config.sitemap_urls.is_empty(), !config.entry_urls.is_empty()) {
            (true, true) => SyncMode::Hybrid,
            (true, false) => SyncMode::Sitemap,
            (false, _) => SyncMode::Entry,
        };
        let schedule = config.refresh_schedule.as_deref().map(parse_cron_schedule).transpose()?;
        let schedule_interval_hours = schedule.as_ref().map(calculate_interval_hours).unwrap_or(24.0);
        let lock_identity = format!(
            "{}:{}:{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string()),
            std::process::id(),
            uuid::Uuid::new_v4()
        );

        let stats = SyncSchedulerStats {
            mode,
            refresh_schedule: config.refresh_schedule.clone(),
            schedule_interval_hours,
            schedule_interval_hours_effective: schedule_interval_hours,
            total_syncs: 0,
            errors: 0,
            last_sync_at: None,
            next_sync_at: None,
            crawler_lock_status: "idle".to_string(),
            crawler_lock_owner: None,
            crawler_lock_expires_at: None,
            force_full_sync_active: false,
            last_error: None,
        };

        Ok(Self {
            tenant_codename: tenant_codename.into(),
            state,
            uow_factory,
            cache,
            tenant,
            infra,
            config,
            schedule,
            schedule_interval_hours,
            lock_identity,
            on_sync_complete,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            stats: Arc::new(Mutex::new(stats)),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(tenant = %self.tenant_codename, "sync scheduler already running");
            return Ok(());
        }
        tracing::info!(tenant = %self.tenant_codename, "starting sync scheduler");
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move { me.run_loop().await });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn trigger_sync(&self, force_crawler: bool, force_full_sync: bool) -> TriggerOutcome {
        if !self.running.load(Ordering::SeqCst) {
            return TriggerOutcome { success: false, message: "scheduler not running".to_string() };
        }
        tracing::info!(tenant = %self.tenant_codename, force_crawler, force_full_sync, "manual sync triggered");
        match self.sync_cycle(force_crawler, force_full_sync).await {
            Ok(()) => TriggerOutcome { success: true, message: "sync cycle completed".to_string() },
            Err(e) => {
                tracing::error!(tenant = %self.tenant_codename, error = %e, "manual sync failed");
                TriggerOutcome { success: false, message: format!("sync failed: {e}") }
            }
        }
    }

    pub async fn get_stats(&self) -> SyncSchedulerStats {
        self.stats.lock().await.clone()
    }

    async fn run_loop(self: Arc<Self>) {
        let Some(schedule) = self.schedule.clone() else {
            tracing::info!(tenant = %self.tenant_codename, "no refresh schedule configured, idling (manual trigger only)");
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            return;
        };

        while self.running.load(Ordering::SeqCst) {
            let now = Utc::now();
            let last_sync = self.state.get_last_sync_time().await.unwrap_or(None);
            let after = last_sync.unwrap_or(now);
            let Some(next_run) = schedule.after(&after).next() else {
                tokio::time::sleep(Duration::from_secs(60)).await;
                continue;
            };
            self.stats.lock().await.next_sync_at = Some(next_run);

            if next_run <= now {
                tracing::info!(tenant = %self.tenant_codename, ?last_sync, %next_run, "sync due");
                match self.sync_cycle(false, false).await {
                    Ok(()) => {
                        let _ = self.state.save_last_sync_time(now).await;
                        let mut stats = self.stats.lock().await;
                        stats.total_syncs += 1;
                        stats.last_sync_at = Some(now);
                        stats.last_error = None;
                    }
                    Err(e) => {
                        tracing::error!(tenant = %self.tenant_codename, error = %e, "scheduled sync cycle failed");
                        let mut stats = self.stats.lock().await;
                        stats.errors += 1;
                        stats.last_error = Some(e.to_string());
                        drop(stats);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            } else {
                let sleep_secs = (next_run - now).num_seconds().clamp(0, 60) as u64;
                tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
            }
        }
    }

    // -- sync cycle -------------------------------------------------------

    async fn sync_cycle(&self, force_crawler: bool, force_full_sync: bool) -> Result<()> {
        let mut progress = self.load_or_create_progress().await?;
        if progress.phase == SyncPhase::Initializing {
            progress.start_discovery()?;
        }
        self.checkpoint(&mut progress, true).await?;

        let plan = self.build_cycle_plan(force_full_sync).await?;
        self.stats.lock().await.force_full_sync_active = plan.bypass_idempotency;

        if !plan.seed_urls.is_empty() && (force_crawler || plan.should_run_crawler) {
            if let Some(lease) = self.acquire_crawler_lock().await {
                if let Err(e) = self.run_crawler(plan.seed_urls.clone(), plan.bypass_idempotency).await {
                    tracing::warn!(tenant = %self.tenant_codename, error = %e, "crawler pass failed");
                }
                let _ = self.state.release_lock(&lease).await;
            } else {
                tracing::info!(tenant = %self.tenant_codename, "crawler lock unavailable this cycle, skipping crawl pass");
            }
        }

        progress.start_fetching()?;
        self.checkpoint(&mut progress, true).await?;

        let queue_urls = self.hydrate_queue_urls(&progress, &plan).await?;
        let enqueue_outcome = self.state.enqueue_urls(&queue_urls, "sync_cycle", 0, plan.bypass_idempotency).await?;
        progress.enqueue_urls(queue_urls);
        for url in &enqueue_outcome.skipped_recently_fetched {
            progress.mark_url_skipped(url, "recently_fetched");
        }

        self.execute_queue(&mut progress, plan.bypass_idempotency, &plan.lastmod_by_url).await?;

        let outcome = progress.mark_completed();
        if let Err(e) = outcome {
            let _ = progress.mark_failed(e.to_string());
        }
        self.checkpoint(&mut progress, true).await?;

        if progress.is_complete() {
            if let Some(hook) = &self.on_sync_complete {
                hook.on_sync_complete(&self.tenant_codename).await;
            }
        }
        Ok(())
    }

    async fn load_or_create_progress(&self) -> Result<SyncProgress> {
        let checkpoint = self.state.load_checkpoint(PROGRESS_CHECKPOINT_KEY).await?;
        let progress = match checkpoint {
            Some(cp) => match SyncProgress::restore_from_checkpoint(&cp) {
                Ok(mut restored) if restored.can_resume() => {
                    restored.resume()?;
                    restored
                }
                _ => SyncProgress::create_new(&self.tenant_codename),
            },
            None => SyncProgress::create_new(&self.tenant_codename),
        };
        Ok(progress)
    }

    async fn checkpoint(&self, progress: &mut SyncProgress, force: bool) -> Result<()> {
        if !force {
            if let Some(last) = progress.last_checkpoint_at {
                let interval = chrono::Duration::from_std(self.config.checkpoint_interval).unwrap_or(chrono::Duration::seconds(30));
                if Utc::now() - last < interval {
                    return Ok(());
                }
            }
        }
        let payload = progress.create_checkpoint();
        self.state.save_checkpoint(PROGRESS_CHECKPOINT_KEY, &payload, true).await
    }

    async fn build_cycle_plan(&self, force_full_sync: bool) -> Result<CyclePlan> {
        let snapshot = self.state.status_snapshot().await?;
        let bypass_idempotency = force_full_sync || snapshot.metadata_successful == 0;

        let mut seed_urls = Vec::new();
        let mut lastmod_by_url = HashMap::new();

        for sitemap_url in &self.config.sitemap_urls {
            match docsync_discovery::fetch_sitemap(sitemap_url, &self.tenant.url_policy, &self.infra).await {
                Ok(doc) => {
                    let stored = self
                        .state
                        .load_sitemap_snapshot(sitemap_url)
                        .await?
                        .and_then(|v| serde_json::from_value(v).ok());
                    let diff = docsync_discovery::diff_against_snapshot(&doc, stored.as_ref());
                    if diff.changed || bypass_idempotency {
                        for entry in &doc.entries {
                            seed_urls.push(entry.loc.clone());
                            if let Some(lastmod) = entry.lastmod {
                                lastmod_by_url.insert(entry.loc.clone(), lastmod);
                            }
                        }
                    }
                    let snapshot_value = serde_json::to_value(docsync_shared::SitemapSnapshot {
                        url: doc.url.clone(),
                        content_hash: doc.content_hash.clone(),
                        url_count: doc.entries.len(),
                        fetched_at: doc.fetched_at,
                    })
                    .map_err(|e| Error::validation(e.to_string()))?;
                    self.state.save_sitemap_snapshot(sitemap_url, &snapshot_value).await?;
                }
                Err(e) => tracing::warn!(tenant = %self.tenant_codename, sitemap_url, error = %e, "sitemap fetch failed"),
            }
        }

        if !self.config.entry_urls.is_empty() {
            let resolved = docsync_discovery::resolve_entry_urls(&self.config.entry_urls, &self.tenant.url_policy, &self.infra, 8).await?;
            for entry in resolved {
                if entry.reachable {
                    seed_urls.push(entry.resolved);
                } else {
                    tracing::warn!(tenant = %self.tenant_codename, requested = %entry.requested, "entry url unreachable");
                }
            }
        }

        let should_run_crawler = !self.config.entry_urls.is_empty() || bypass_idempotency;
        Ok(CyclePlan { seed_urls, bypass_idempotency, should_run_crawler, lastmod_by_url })
    }

    /// Merge this cycle's discovered seeds with previously successful URLs
    /// (re-checked for freshness) and any failed URLs whose backoff window
    /// has elapsed.
    async fn hydrate_queue_urls(&self, progress: &SyncProgress, plan: &CyclePlan) -> Result<HashSet<String>> {
        let mut queue_urls: HashSet<String> = plan.seed_urls.iter().cloned().collect();

        let all_metadata = self.state.list_all_metadata().await?;
        for meta in &all_metadata {
            if meta.status == UrlStatus::Success {
                queue_urls.insert(meta.url.as_str().to_string());
            }
        }

        let max_backoff_hours = self.config.max_sync_interval_days.max(1) * 24;
        let now = Utc::now();
        for (url, info) in &progress.failed_urls {
            let hours = backoff_hours(info.retry_count, max_backoff_hours);
            let due_at = info.failed_at + chrono::Duration::hours(hours);
            if plan.bypass_idempotency || now >= due_at {
                queue_urls.insert(url.clone());
            }
        }

        Ok(queue_urls)
    }

    async fn execute_queue(
        &self,
        progress: &mut SyncProgress,
        bypass_idempotency: bool,
        lastmod_by_url: &HashMap<String, DateTime<Utc>>,
    ) -> Result<()> {
        let max_backoff_hours = self.config.max_sync_interval_days.max(1) * 24;
        loop {
            let batch = self.state.dequeue_batch(DEQUEUE_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            for url in batch {
                match self.cache.check_and_fetch(&url, !bypass_idempotency).await {
                    Ok((Some(_doc), cache_hit, _)) => {
                        if cache_hit {
                            progress.mark_url_skipped(&url, "recently_fetched");
                        } else {
                            progress.mark_url_processed(&url);
                        }
                        let interval_hours = freshness_interval_hours(lastmod_by_url.get(&url).copied(), self.tenant.min_fetch_interval_hours);
                        let next_due = Utc::now() + chrono::Duration::hours(interval_hours);
                        self.carry_forward_metadata(&url, Some(next_due), UrlStatus::Success, 0, None).await?;
                    }
                    Ok((None, _, reason)) => {
                        let reason = reason.unwrap_or_else(|| "unknown".to_string());
                        progress.mark_url_failed(&url, "FetchError", &reason);
                        let retry_count = progress.failed_urls.get(&url).map(|f| f.retry_count).unwrap_or(1);
                        let hours = backoff_hours(retry_count, max_backoff_hours);
                        let next_due = Utc::now() + chrono::Duration::hours(hours);
                        self.carry_forward_metadata(&url, Some(next_due), UrlStatus::Failed, retry_count, Some(&reason)).await?;
                    }
                    Err(e) => {
                        tracing::warn!(tenant = %self.tenant_codename, url, error = %e, "fetch errored outside the extractor boundary");
                        progress.mark_url_failed(&url, "Error", &e.to_string());
                    }
                }
                self.checkpoint(progress, false).await?;
            }
        }
        Ok(())
    }

    /// Re-apply `upsert_url_metadata` to set `next_due_at`, preserving the
    /// `last_fetched_at`/`markdown_rel_path`/`content_hash` that
    /// `CacheService` already wrote for this URL.
    async fn carry_forward_metadata(
        &self,
        url: &str,
        next_due_at: Option<DateTime<Utc>>,
        status: UrlStatus,
        retry_count: u32,
        reason: Option<&str>,
    ) -> Result<()> {
        let existing = self.state.load_url_metadata(url).await?;
        self.state
            .upsert_url_metadata(
                url,
                None,
                existing.as_ref().and_then(|m| m.last_event_at),
                next_due_at,
                status,
                retry_count,
                reason,
                existing.as_ref().and_then(|m| m.markdown_rel_path.as_deref()),
                existing.as_ref().and_then(|m| m.content_hash.as_deref()),
            )
            .await
    }

    // -- crawler lock -------------------------------------------------------

    async fn acquire_crawler_lock(&self) -> Option<LockLease> {
        let ttl_seconds = self.config.crawler_lock_ttl_seconds.max(60);
        let owner = format!("{}:{}", self.lock_identity, Utc::now().to_rfc3339());

        let (lease, existing) = match self.state.try_acquire_lock(CRAWLER_LOCK_NAME, &owner, ttl_seconds).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tenant = %self.tenant_codename, error = %e, "crawler lock acquisition errored");
                return None;
            }
        };
        if let Some(lease) = lease {
            self.set_lock_stats("acquired", Some(&lease)).await;
            return Some(lease);
        }
        let Some(existing) = existing else {
            self.set_lock_stats("contended", None).await;
            return None;
        };

        let now = Utc::now();
        if !existing.is_expired(now) {
            tracing::info!(
                tenant = %self.tenant_codename,
                owner = %existing.owner,
                remaining_seconds = existing.remaining_seconds(now),
                "crawler lock held by another worker"
            );
            self.set_lock_stats("contended", Some(&existing)).await;
            return None;
        }

        tracing::warn!(tenant = %self.tenant_codename, owner = %existing.owner, "crawler lock expired, evaluating staleness");
        if self.tenant_recently_refreshed().await {
            tracing::info!(tenant = %self.tenant_codename, "tenant recently refreshed, cleaning up stale lock without recrawling");
            let _ = self.state.break_lock(CRAWLER_LOCK_NAME).await;
            self.set_lock_stats("stale", None).await;
            return None;
        }

        let _ = self.state.break_lock(CRAWLER_LOCK_NAME).await;
        match self.state.try_acquire_lock(CRAWLER_LOCK_NAME, &owner, ttl_seconds).await {
            Ok((Some(lease), _)) => {
                self.set_lock_stats("acquired", Some(&lease)).await;
                Some(lease)
            }
            _ => {
                tracing::info!(tenant = %self.tenant_codename, "unable to acquire crawler lock after removing stale lease");
                self.set_lock_stats("contended", None).await;
                None
            }
        }
    }

    async fn set_lock_stats(&self, status: &str, lease: Option<&LockLease>) {
        let mut stats = self.stats.lock().await;
        stats.crawler_lock_status = status.to_string();
        stats.crawler_lock_owner = lease.map(|l| l.owner.clone());
        stats.crawler_lock_expires_at = lease.map(|l| l.expires_at);
    }

    async fn tenant_recently_refreshed(&self) -> bool {
        let Ok(Some(last_sync)) = self.state.get_last_sync_time().await else { return false };
        let elapsed_hours = (Utc::now() - last_sync).num_seconds() as f64 / 3600.0;
        elapsed_hours < self.schedule_interval_hours
    }

    // -- crawler application --------------------------------------------

    async fn run_crawler(&self, seeds: Vec<String>, bypass_idempotency: bool) -> Result<()> {
        let crawler_config = CrawlerConfig {
            base_delay_ms: self.tenant.rate_limit_ms,
            max_workers: self.tenant.crawl_concurrency.max(1) as usize,
            force_crawl: bypass_idempotency,
            ..Default::default()
        };
        let crawler = Crawler::new(crawler_config)?;

        let policy = self.tenant.url_policy.clone();
        let state_for_discovery = Arc::clone(&self.state);
        let on_discovered = Arc::new(move |url: &str| {
            if !policy.allows(url) {
                return;
            }
            let state = Arc::clone(&state_for_discovery);
            let url = url.to_string();
            tokio::spawn(async move {
                let mut set = HashSet::new();
                set.insert(url);
                if let Err(e) = state.enqueue_urls(&set, "crawler_discovered", -1, false).await {
                    tracing::warn!(error = %e, "failed to enqueue crawler-discovered url");
                }
            });
        });

        let interval_hours = self.tenant.min_fetch_interval_hours as f64;
        let state_for_skip = Arc::clone(&self.state);
        let should_skip = Arc::new(move |url: &str| -> bool {
            if bypass_idempotency {
                return false;
            }
            let state = Arc::clone(&state_for_skip);
            let url = url.to_string();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current()
                    .block_on(async move { state.was_recently_fetched(&url, interval_hours).await.unwrap_or(false) })
            })
        });

        let hooks = CrawlHooks::new(on_discovered).with_skip_recent(should_skip);
        let summary = crawler.crawl(seeds, hooks).await?;
        tracing::info!(
            tenant = %self.tenant_codename,
            pages_fetched = summary.pages_fetched,
            pages_skipped = summary.pages_skipped,
            errors = summary.errors.len(),
            "crawler pass complete"
        );
        Ok(())
    }
}

fn parse_cron_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(expr);
    Schedule::from_str(&normalized).map_err(|e| Error::config(format!("invalid cron schedule '{expr}': {e}")))
}

/// The `cron` crate requires a leading seconds field; tenant config follows
/// the conventional 5-field `min hour dom month dow` form.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 { format!("0 {expr}") } else { expr.to_string() }
}

fn calculate_interval_hours(schedule: &Schedule) -> f64 {
    let now = Utc::now();
    let mut upcoming = schedule.after(&now);
    let Some(first) = upcoming.next() else { return 24.0 };
    let Some(second) = upcoming.next() else { return 24.0 };
    ((second - first).num_seconds() as f64 / 3600.0).max(1.0)
}

/// Sitemap-lastmod freshness tiers: recently changed pages get rechecked
/// soonest, stable pages get rechecked least often.
fn freshness_interval_hours(lastmod: Option<DateTime<Utc>>, default_hours: i64) -> i64 {
    let Some(lastmod) = lastmod else { return default_hours.max(1) * 1 };
    let age_days = (Utc::now() - lastmod).num_days();
    if age_days < 7 {
        24
    } else if age_days <= 30 {
        7 * 24
    } else {
        30 * 24
    }
}

/// 1st retry in 1h, 2nd in 2h, 3rd in 4h, doubling thereafter, capped at
/// `max_backoff_hours`.
fn backoff_hours(retry_count: u32, max_backoff_hours: i64) -> i64 {
    let exponent = retry_count.saturating_sub(1).min(32);
    let hours = 2i64.saturating_pow(exponent);
    hours.min(max_backoff_hours.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gets_a_seconds_field_prefixed() {
        assert_eq!(normalize_cron_expr("0 */6 * * *"), "0 0 */6 * * *");
        assert_eq!(normalize_cron_expr("0 0 */6 * * *"), "0 0 */6 * * *");
    }

    #[test]
    fn freshness_tiers_match_lastmod_age() {
        let now = Utc::now();
        assert_eq!(freshness_interval_hours(Some(now - chrono::Duration::days(1)), 168), 24);
        assert_eq!(freshness_interval_hours(Some(now - chrono::Duration::days(15)), 168), 168);
        assert_eq!(freshness_interval_hours(Some(now - chrono::Duration::days(45)), 168), 720);
        assert_eq!(freshness_interval_hours(None, 168), 168);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_hours(1, 720), 1);
        assert_eq!(backoff_hours(2, 720), 2);
        assert_eq!(backoff_hours(3, 720), 4);
        assert_eq!(backoff_hours(20, 720), 720);
    }

    #[test]
    fn interval_from_cron_matches_spacing_between_two_runs() {
        let schedule = parse_cron_schedule("0 */6 * * *").unwrap();
        let hours = calculate_interval_hours(&schedule);
        assert!((hours - 6.0).abs() < 0.01);
    }
}
