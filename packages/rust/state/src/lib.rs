//! Per-tenant SQLite-backed crawl state: URL bookkeeping, work queue,
//! distributed locks, sitemap snapshots, sync progress/checkpoints, and an
//! append-only event log.
//!
//! One [`CrawlStateStore`] owns one `<tenant_root>/__crawl_state/crawl.sqlite`
//! database. Connections are opened with a self-healing retry loop: a
//! transient open failure is retried a few times before the store gives up
//! and reports [`docsync_shared::Error::DatabaseCritical`], which callers
//! should treat as fatal (let the process exit and be restarted).
//!
//! Every operation opens its own short-lived [`Connection`] rather than
//! holding one across awaits; writes on the queue (`enqueue_urls`,
//! `dequeue_batch`) open their transaction with `BEGIN IMMEDIATE` since those
//! are the paths most likely to contend with a concurrent caller.

mod migrations;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use docsync_shared::{CanonicalUrl, Error, LockLease, Result, RetryPolicy, UrlMetadata, UrlStatus};
use libsql::{Connection, Database, Row, TransactionBehavior, params};
use serde_json::Value as JsonValue;

const DB_DIR: &str = "__crawl_state";
const DB_NAME: &str = "crawl.sqlite";
const LAST_SYNC_KEY: &str = "last_sync_at";
const SUMMARY_KEY: &str = "summary";
const LEGACY_ARTIFACT_DIRS: &[&str] = &["__scheduler_meta", "__sync_progress"];

/// Database-level pragmas: persisted in the file itself, only meaningful to
/// set once (ideally before any table exists).
const DB_LEVEL_PRAGMAS: &str = "PRAGMA journal_mode = WAL; PRAGMA auto_vacuum = INCREMENTAL;";
/// Session-level pragmas: apply to one connection only, so every fresh
/// connection this store opens re-applies them.
const SESSION_PRAGMAS: &str = "PRAGMA busy_timeout = 30000; PRAGMA foreign_keys = OFF; PRAGMA synchronous = NORMAL; PRAGMA temp_store = MEMORY;";

pub const EVENT_RETENTION_DAYS: i64 = 49;
pub const EVENT_MAX_ROWS: u64 = 200_000;

/// Aggregate crawl status, mirroring what a dashboard or health check wants.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub captured_at: DateTime<Utc>,
    pub metadata_total_urls: u64,
    pub metadata_due_urls: u64,
    pub metadata_successful: u64,
    pub metadata_pending: u64,
    pub metadata_first_seen_at: Option<DateTime<Utc>>,
    pub metadata_last_success_at: Option<DateTime<Utc>>,
    pub failed_url_count: u64,
    pub queue_depth: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// A single bucketed window in [`CrawlStateStore::event_history`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventBucket {
    pub bucket_start: DateTime<Utc>,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub discovered: u64,
    pub fetched: u64,
}

/// A single row read back by [`CrawlStateStore::event_log`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventLogEntry {
    pub event_at: DateTime<Utc>,
    pub event_type: String,
    pub status: Option<String>,
    pub url: Option<String>,
    pub reason: Option<String>,
    pub detail: Option<JsonValue>,
    pub duration_ms: Option<i64>,
}

/// Fields recorded for one append to `crawl_events`, and folded into the
/// matching `crawl_urls` row's running counters.
#[derive(Debug, Clone, Default)]
pub struct EventRecord<'a> {
    pub url: Option<&'a str>,
    pub event_type: &'a str,
    pub status: Option<&'a str>,
    pub reason: Option<&'a str>,
    pub detail: Option<JsonValue>,
    pub duration_ms: Option<i64>,
}

/// Result of [`CrawlStateStore::enqueue_urls`]: how many rows actually
/// landed in `crawl_queue`, and which candidate URLs were gated out because
/// they were already `success` and not yet due (so the caller can account
/// for them as skipped rather than silently forgetting about them).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    pub inserted: u64,
    pub skipped_recently_fetched: Vec<String>,
}

pub struct CrawlStateStore {
    db: Database,
    tenant_root: PathBuf,
    db_path: PathBuf,
}

impl CrawlStateStore {
    /// Open (creating if absent) the crawl state database for a tenant.
    #[tracing::instrument(skip_all, fields(tenant_root = %tenant_root.display()))]
    pub async fn open(tenant_root: &Path) -> Result<Self> {
        let db_root = tenant_root.join(DB_DIR);
        std::fs::create_dir_all(&db_root).map_err(|e| Error::io(&db_root, e))?;
        let db_path = db_root.join(DB_NAME);

        let retry = RetryPolicy::new(3, Duration::from_millis(500));
        let db = retry
            .retry(|| async {
                std::fs::create_dir_all(&db_root).map_err(|e| e.to_string())?;
                libsql::Builder::new_local(&db_path)
                    .build()
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| {
                Error::DatabaseCritical(format!(
                    "unable to open crawl state db at {}: {e}",
                    db_path.display()
                ))
            })?;

        let store = Self { db, tenant_root: tenant_root.to_path_buf(), db_path };

        let bootstrap = store.conn().await?;
        bootstrap
            .execute_batch(DB_LEVEL_PRAGMAS)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a fresh, short-lived connection with session-level pragmas
    /// applied. Never held across an await boundary beyond the call that
    /// needs it.
    async fn conn(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| Error::DatabaseCritical(format!("failed to connect: {e}")))?;
        conn.execute_batch(SESSION_PRAGMAS)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(conn)
    }

    async fn run_migrations(&self) -> Result<()> {
        let conn = self.conn().await?;
        let current = Self::schema_version_on(&conn).await;
        for migration in migrations::all_migrations() {
            if migration.version > current {
                tracing::info!(version = migration.version, description = migration.description, "applying crawl-state migration");
                conn.execute_batch(migration.sql)
                    .await
                    .map_err(|e| Error::Storage(format!("migration v{} failed: {e}", migration.version)))?;
            }
        }
        Ok(())
    }

    async fn schema_version_on(conn: &Connection) -> u32 {
        match conn.query("SELECT MAX(version) FROM schema_migrations", params![]).await {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    #[cfg(test)]
    async fn schema_version(&self) -> u32 {
        let conn = self.conn().await.expect("conn");
        Self::schema_version_on(&conn).await
    }

    /// Remove pre-sqlite artifact directories left by an older layout, if any.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_legacy_artifacts(&self) -> Result<()> {
        for name in LEGACY_ARTIFACT_DIRS {
            let path = self.tenant_root.join(name);
            if path.exists() {
                tracing::warn!(?path, "legacy crawl metadata detected, no migration applied");
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    tracing::debug!(?path, error = %e, "failed to remove legacy artifact directory");
                }
            }
        }
        Ok(())
    }

    fn canonicalize(url: &str) -> Result<CanonicalUrl> {
        docsync_pathbuilder::canonicalize(url, false)
    }

    // -- events --------------------------------------------------------

    async fn record_event_on(&self, canonical: Option<&str>, record: &EventRecord<'_>) -> Result<()> {
        let conn = self.conn().await?;
        let now = Utc::now().to_rfc3339();
        let detail_json = record.detail.as_ref().map(|v| v.to_string());
        conn.execute(
            "INSERT INTO crawl_events (event_at, canonical_url, url, event_type, status, reason, detail, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                now.as_str(),
                canonical,
                record.url,
                record.event_type,
                record.status,
                record.reason,
                detail_json.as_deref(),
                record.duration_ms,
            ],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        if let Some(canonical) = canonical {
            conn.execute(
                "INSERT OR IGNORE INTO crawl_urls (canonical_url, url, first_seen_at, next_due_at, last_status, retry_count)
                 VALUES (?1, ?2, ?3, ?3, 'pending', 0)",
                params![canonical, record.url.unwrap_or(canonical), now.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            conn.execute(
                "UPDATE crawl_urls SET last_event_at = ?1 WHERE canonical_url = ?2",
                params![now.as_str(), canonical],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            if record.event_type == "cache_hit" {
                conn.execute(
                    "UPDATE crawl_urls SET cache_hit_count = cache_hit_count + 1 WHERE canonical_url = ?1",
                    params![canonical],
                )
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            } else if matches!(record.event_type, "fetch_success" | "fetch_failure") {
                conn.execute(
                    "UPDATE crawl_urls SET fetch_count = fetch_count + 1 WHERE canonical_url = ?1",
                    params![canonical],
                )
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            if record.status == Some("failed") {
                conn.execute(
                    "UPDATE crawl_urls SET failure_count = failure_count + 1 WHERE canonical_url = ?1",
                    params![canonical],
                )
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Append an event to the log, folding counters into the matching
    /// `crawl_urls` row (events are append-only: retries stay observable).
    pub async fn record_event(&self, record: EventRecord<'_>) -> Result<()> {
        let owned_canonical = match record.url {
            Some(u) => Some(Self::canonicalize(u)?.as_str().to_string()),
            None => None,
        };
        self.record_event_on(owned_canonical.as_deref(), &record).await
    }

    // -- meta ------------------------------------------------------------

    pub async fn save_last_sync_time(&self, when: DateTime<Utc>) -> Result<()> {
        self.save_meta(LAST_SYNC_KEY, &when.to_rfc3339()).await
    }

    pub async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.load_meta(LAST_SYNC_KEY).await? else {
            return Ok(None);
        };
        Ok(DateTime::parse_from_rfc3339(&value).ok().map(|dt| dt.with_timezone(&Utc)))
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO crawl_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT value FROM crawl_meta WHERE key = ?1", params![key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            _ => Ok(None),
        }
    }

    // -- sitemap snapshots -------------------------------------------------

    pub async fn save_sitemap_snapshot(&self, snapshot_id: &str, payload: &JsonValue) -> Result<()> {
        let conn = self.conn().await?;
        let serialized = payload.to_string();
        conn.execute(
            "INSERT INTO crawl_sitemaps (snapshot_id, payload) VALUES (?1, ?2)
             ON CONFLICT(snapshot_id) DO UPDATE SET payload = excluded.payload",
            params![snapshot_id, serialized.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn load_sitemap_snapshot(&self, snapshot_id: &str) -> Result<Option<JsonValue>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT payload FROM crawl_sitemaps WHERE snapshot_id = ?1", params![snapshot_id])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(serde_json::from_str(&payload).ok())
            }
            _ => Ok(None),
        }
    }

    // -- debug snapshots ---------------------------------------------------

    pub async fn save_debug_snapshot(&self, name: &str, payload: &JsonValue) -> Result<()> {
        let conn = self.conn().await?;
        let serialized = payload.to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO crawl_debug (name, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![name, serialized.as_str(), now.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn load_debug_snapshot(&self, name: &str) -> Result<Option<JsonValue>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT payload FROM crawl_debug WHERE name = ?1", params![name])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(serde_json::from_str(&payload).ok())
            }
            _ => Ok(None),
        }
    }

    // -- summary -------------------------------------------------------------

    pub async fn save_summary(&self, payload: &JsonValue) -> Result<()> {
        let conn = self.conn().await?;
        let serialized = payload.to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO crawl_summary (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![SUMMARY_KEY, serialized.as_str(), now.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn load_summary(&self) -> Result<Option<JsonValue>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT payload FROM crawl_summary WHERE key = ?1", params![SUMMARY_KEY])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(serde_json::from_str(&payload).ok())
            }
            _ => Ok(None),
        }
    }

    /// Aggregate counts across `crawl_urls`/`crawl_queue`/`crawl_events`.
    pub async fn status_snapshot(&self) -> Result<StatusSnapshot> {
        let conn = self.conn().await?;
        let now = Utc::now();
        let now_iso = now.to_rfc3339();

        let total = Self::scalar_u64_on(&conn, "SELECT COUNT(*) FROM crawl_urls", params![]).await?;
        let success = Self::scalar_u64_on(&conn, "SELECT COUNT(*) FROM crawl_urls WHERE last_status = 'success'", params![]).await?;
        let failed = Self::scalar_u64_on(&conn, "SELECT COUNT(*) FROM crawl_urls WHERE last_status = 'failed'", params![]).await?;
        let pending = Self::scalar_u64_on(
            &conn,
            "SELECT COUNT(*) FROM crawl_urls WHERE last_status IN ('pending', 'processing')",
            params![],
        )
        .await?;
        let due = Self::scalar_u64_on(
            &conn,
            "SELECT COUNT(*) FROM crawl_urls WHERE next_due_at IS NOT NULL AND next_due_at <= ?1",
            params![now_iso.as_str()],
        )
        .await?;
        let queue_depth = Self::scalar_u64_on(&conn, "SELECT COUNT(*) FROM crawl_queue", params![]).await?;

        let first_seen_at = Self::scalar_timestamp_on(&conn, "SELECT MIN(first_seen_at) FROM crawl_urls").await?;
        let last_success_at =
            Self::scalar_timestamp_on(&conn, "SELECT MAX(last_fetched_at) FROM crawl_urls WHERE last_status = 'success'").await?;
        let last_event_at = Self::scalar_timestamp_on(&conn, "SELECT MAX(event_at) FROM crawl_events").await?;

        Ok(StatusSnapshot {
            captured_at: now,
            metadata_total_urls: total,
            metadata_due_urls: due,
            metadata_successful: success,
            metadata_pending: pending,
            metadata_first_seen_at: first_seen_at,
            metadata_last_success_at: last_success_at,
            failed_url_count: failed,
            queue_depth,
            last_event_at,
        })
    }

    async fn scalar_u64_on(conn: &Connection, sql: &str, args: impl libsql::params::IntoParams) -> Result<u64> {
        let mut rows = conn.query(sql, args).await.map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            _ => Ok(0),
        }
    }

    async fn scalar_u64(&self, sql: &str, args: impl libsql::params::IntoParams) -> Result<u64> {
        let conn = self.conn().await?;
        Self::scalar_u64_on(&conn, sql, args).await
    }

    async fn scalar_timestamp_on(conn: &Connection, sql: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = conn.query(sql, params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let value: Option<String> = row.get(0).ok();
                Ok(value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|dt| dt.with_timezone(&Utc)))
            }
            _ => Ok(None),
        }
    }

    // -- url metadata --------------------------------------------------------

    /// Upsert crawl bookkeeping for a URL. `first_seen_at` is preserved across
    /// updates; every other field reflects the latest attempt.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_url_metadata(
        &self,
        url: &str,
        discovered_from: Option<&str>,
        last_fetched_at: Option<DateTime<Utc>>,
        next_due_at: Option<DateTime<Utc>>,
        status: UrlStatus,
        retry_count: u32,
        last_failure_reason: Option<&str>,
        markdown_rel_path: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<()> {
        let canonical = Self::canonicalize(url)?;
        let now = Utc::now().to_rfc3339();
        let last_fetched_at = last_fetched_at.map(|d| d.to_rfc3339());
        let next_due_at = next_due_at.map(|d| d.to_rfc3339());
        let last_failure_at = if last_failure_reason.is_some() { Some(now.clone()) } else { None };

        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO crawl_urls (
                canonical_url, url, discovered_from, first_seen_at, last_fetched_at,
                next_due_at, last_status, retry_count, last_failure_reason,
                last_failure_at, markdown_rel_path, content_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(canonical_url) DO UPDATE SET
                url = excluded.url,
                discovered_from = COALESCE(excluded.discovered_from, crawl_urls.discovered_from),
                first_seen_at = COALESCE(crawl_urls.first_seen_at, excluded.first_seen_at),
                last_fetched_at = excluded.last_fetched_at,
                next_due_at = excluded.next_due_at,
                last_status = excluded.last_status,
                retry_count = excluded.retry_count,
                last_failure_reason = excluded.last_failure_reason,
                last_failure_at = excluded.last_failure_at,
                markdown_rel_path = excluded.markdown_rel_path,
                content_hash = COALESCE(excluded.content_hash, crawl_urls.content_hash)",
            params![
                canonical.as_str(),
                url,
                discovered_from,
                now.as_str(),
                last_fetched_at.as_deref(),
                next_due_at.as_deref(),
                status.as_str(),
                retry_count,
                last_failure_reason,
                last_failure_at.as_deref(),
                markdown_rel_path,
                content_hash,
            ],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn load_url_metadata(&self, url: &str) -> Result<Option<UrlMetadata>> {
        let canonical = Self::canonicalize(url)?;
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT * FROM crawl_urls WHERE canonical_url = ?1", params![canonical.as_str()])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_url_metadata(&row)?)),
            _ => Ok(None),
        }
    }

    pub async fn list_all_metadata(&self) -> Result<Vec<UrlMetadata>> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT * FROM crawl_urls", params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(row_to_url_metadata(&row)?);
        }
        Ok(out)
    }

    // -- queue ---------------------------------------------------------------

    /// Enqueue URLs for crawling. Skips (and reports back) URLs whose
    /// `next_due_at` hasn't elapsed unless `force` is set.
    pub async fn enqueue_urls(&self, urls: &HashSet<String>, reason: &str, priority: i64, force: bool) -> Result<EnqueueOutcome> {
        if urls.is_empty() {
            return Ok(EnqueueOutcome::default());
        }
        let now_dt = Utc::now();
        let now = now_dt.to_rfc3339();
        let mut inserted = 0u64;
        let mut skipped_recently_fetched = Vec::new();

        let conn = self.conn().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        for url in urls {
            let canonical = Self::canonicalize(url)?;
            tx.execute(
                "INSERT OR IGNORE INTO crawl_urls (canonical_url, url, first_seen_at, next_due_at, last_status, retry_count)
                 VALUES (?1, ?2, ?3, ?3, 'pending', 0)",
                params![canonical.as_str(), url.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

            if !force {
                let mut rows = tx
                    .query(
                        "SELECT last_status, next_due_at FROM crawl_urls WHERE canonical_url = ?1",
                        params![canonical.as_str()],
                    )
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                if let Ok(Some(row)) = rows.next().await {
                    let status: Option<String> = row.get(0).ok();
                    let next_due_at: Option<String> = row.get(1).ok();
                    if status.as_deref() == Some("success") {
                        if let Some(due) = next_due_at.as_deref().and_then(|d| DateTime::parse_from_rfc3339(d).ok()) {
                            if due.with_timezone(&Utc) > now_dt {
                                skipped_recently_fetched.push(url.clone());
                                continue;
                            }
                        }
                    }
                }
            }

            if force {
                tx.execute(
                    "INSERT INTO crawl_queue (canonical_url, url, enqueued_at, priority, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(canonical_url) DO UPDATE SET
                        url = excluded.url, enqueued_at = excluded.enqueued_at,
                        priority = MAX(crawl_queue.priority, excluded.priority), reason = excluded.reason",
                    params![canonical.as_str(), url.as_str(), now.as_str(), priority, reason],
                )
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            } else {
                tx.execute(
                    "INSERT OR IGNORE INTO crawl_queue (canonical_url, url, enqueued_at, priority, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![canonical.as_str(), url.as_str(), now.as_str(), priority, reason],
                )
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            tx.execute(
                "INSERT INTO crawl_events (event_at, canonical_url, url, event_type, status, reason) VALUES (?1, ?2, ?3, 'queue_enqueued', 'ok', ?4)",
                params![now.as_str(), canonical.as_str(), url.as_str(), reason],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            inserted += 1;
        }
        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(EnqueueOutcome { inserted, skipped_recently_fetched })
    }

    /// Re-enqueue every URL whose `last_status = 'failed'`, highest priority.
    pub async fn requeue_failed_urls(&self, limit: Option<u64>, reason: &str, priority: i64) -> Result<u64> {
        if limit == Some(0) {
            return Ok(0);
        }
        let mut sql = "SELECT url FROM crawl_urls WHERE last_status = 'failed' \
                       ORDER BY (last_failure_at IS NULL), last_failure_at DESC"
            .to_string();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.conn().await?;
        let mut rows = conn.query(&sql, params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
        let mut urls = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(url) = row.get::<String>(0) {
                urls.insert(url);
            }
        }
        if urls.is_empty() {
            return Ok(0);
        }
        Ok(self.enqueue_urls(&urls, reason, priority, true).await?.inserted)
    }

    /// Pop up to `limit` queued URLs, marking them `processing`. Dequeue is
    /// destructive: a worker that crashes mid-fetch relies on `crawl_urls`
    /// metadata (not the queue) to notice the URL needs another pass.
    pub async fn dequeue_batch(&self, limit: u32) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT canonical_url, url FROM crawl_queue ORDER BY priority DESC, enqueued_at ASC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut picked: Vec<(String, String)> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let canonical: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
            let url: String = row.get(1).map_err(|e| Error::Storage(e.to_string()))?;
            picked.push((canonical, url));
        }
        if picked.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now().to_rfc3339();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        for (canonical, url) in &picked {
            tx.execute("DELETE FROM crawl_queue WHERE canonical_url = ?1", params![canonical.as_str()])
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            tx.execute(
                "UPDATE crawl_urls SET last_status = 'processing', next_due_at = ?1 WHERE canonical_url = ?2",
                params![now.as_str(), canonical.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            tx.execute(
                "INSERT INTO crawl_events (event_at, canonical_url, url, event_type, status) VALUES (?1, ?2, ?3, 'queue_dequeued', 'ok')",
                params![now.as_str(), canonical.as_str(), url.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(picked.into_iter().map(|(_, url)| url).collect())
    }

    pub async fn remove_from_queue(&self, url: &str) -> Result<()> {
        let canonical = Self::canonicalize(url)?;
        let conn = self.conn().await?;
        conn.execute("DELETE FROM crawl_queue WHERE canonical_url = ?1", params![canonical.as_str()])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        drop(conn);
        self.record_event_on(Some(canonical.as_str()), &EventRecord { url: Some(url), event_type: "queue_removed", status: Some("ok"), ..Default::default() })
            .await
    }

    pub async fn delete_url_metadata(&self, url: &str) -> Result<()> {
        let canonical = Self::canonicalize(url)?;
        let conn = self.conn().await?;
        conn.execute("DELETE FROM crawl_queue WHERE canonical_url = ?1", params![canonical.as_str()])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute("DELETE FROM crawl_urls WHERE canonical_url = ?1", params![canonical.as_str()])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        drop(conn);
        self.record_event_on(Some(canonical.as_str()), &EventRecord { url: Some(url), event_type: "metadata_pruned", status: Some("ok"), ..Default::default() })
            .await
    }

    /// Delete every URL (and queue entry) whose raw URL starts with `prefix`.
    /// Used when a subtree is excluded from a tenant's policy after the fact.
    pub async fn delete_urls_by_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{prefix}%");
        let count = self.scalar_u64("SELECT COUNT(*) FROM crawl_urls WHERE url LIKE ?1", params![pattern.as_str()]).await?;
        if count > 0 {
            let conn = self.conn().await?;
            conn.execute("DELETE FROM crawl_queue WHERE url LIKE ?1", params![pattern.as_str()])
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
            conn.execute("DELETE FROM crawl_urls WHERE url LIKE ?1", params![pattern.as_str()])
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(count)
    }

    pub async fn queue_depth(&self) -> Result<u64> {
        self.scalar_u64("SELECT COUNT(*) FROM crawl_queue", params![]).await
    }

    /// Whether `url` was fetched successfully within `interval_hours` of now.
    pub async fn was_recently_fetched(&self, url: &str, interval_hours: f64) -> Result<bool> {
        let canonical = Self::canonicalize(url)?;
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT last_fetched_at, last_status FROM crawl_urls WHERE canonical_url = ?1",
                params![canonical.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let Ok(Some(row)) = rows.next().await else { return Ok(false) };
        let last_fetched: Option<String> = row.get(0).ok();
        let status: Option<String> = row.get(1).ok();
        if status.as_deref() != Some("success") {
            return Ok(false);
        }
        let Some(fetched_at) = last_fetched.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()) else {
            return Ok(false);
        };
        let age_hours = (Utc::now() - fetched_at.with_timezone(&Utc)).num_seconds() as f64 / 3600.0;
        Ok(age_hours < interval_hours)
    }

    // -- locks -----------------------------------------------------------

    /// Attempt to acquire a named lock. Returns the newly-acquired lease on
    /// success, or the existing lease (possibly expired) on contention.
    pub async fn try_acquire_lock(&self, name: &str, owner: &str, ttl_seconds: i64) -> Result<(Option<LockLease>, Option<LockLease>)> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_seconds);
        let conn = self.conn().await?;
        let insert = conn
            .execute(
                "INSERT INTO crawl_locks (name, owner, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, owner, now.to_rfc3339().as_str(), expires_at.to_rfc3339().as_str()],
            )
            .await;

        match insert {
            Ok(_) => Ok((
                Some(LockLease { name: name.to_string(), owner: owner.to_string(), acquired_at: now, expires_at }),
                None,
            )),
            Err(_) => {
                let mut rows = conn
                    .query(
                        "SELECT name, owner, acquired_at, expires_at FROM crawl_locks WHERE name = ?1",
                        params![name],
                    )
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                match rows.next().await {
                    Ok(Some(row)) => Ok((None, Some(row_to_lock_lease(&row)?))),
                    _ => Ok((None, None)),
                }
            }
        }
    }

    pub async fn release_lock(&self, lease: &LockLease) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM crawl_locks WHERE name = ?1 AND owner = ?2",
            params![lease.name.as_str(), lease.owner.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    /// Forcibly remove a lock row regardless of owner (operator override for
    /// a lease an operator has confirmed is stale/abandoned).
    pub async fn break_lock(&self, name: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM crawl_locks WHERE name = ?1", params![name])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn clear_queue(&self, reason: Option<&str>) -> Result<u64> {
        let conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(|e| Error::Storage(e.to_string()))?;
        let count = {
            let mut rows = tx.query("SELECT COUNT(*) FROM crawl_queue", params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
            match rows.next().await {
                Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0).max(0) as u64,
                _ => 0,
            }
        };
        tx.execute("DELETE FROM crawl_queue", params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(reason) = reason {
            let now = Utc::now().to_rfc3339();
            let detail = serde_json::json!({ "count": count }).to_string();
            tx.execute(
                "INSERT INTO crawl_events (event_at, event_type, status, reason, detail) VALUES (?1, 'queue_removed', 'ok', ?2, ?3)",
                params![now.as_str(), reason, detail.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;
        Ok(count)
    }

    // -- sync progress & checkpoints ------------------------------------

    pub async fn save_progress(&self, key: &str, payload: &JsonValue) -> Result<()> {
        let conn = self.conn().await?;
        let serialized = payload.to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO crawl_progress (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![key, serialized.as_str(), now.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn load_progress(&self, key: &str) -> Result<Option<JsonValue>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT payload FROM crawl_progress WHERE key = ?1", params![key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(serde_json::from_str(&payload).ok())
            }
            _ => Ok(None),
        }
    }

    pub async fn delete_progress(&self, key: &str) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM crawl_progress WHERE key = ?1", params![key]).await.map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute("DELETE FROM crawl_checkpoint WHERE key = ?1", params![key]).await.map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute("DELETE FROM crawl_checkpoint_history WHERE key = ?1", params![key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn save_checkpoint(&self, key: &str, payload: &JsonValue, keep_history: bool) -> Result<()> {
        let conn = self.conn().await?;
        let serialized = payload.to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO crawl_checkpoint (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![key, serialized.as_str(), now.as_str()],
        )
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        if keep_history {
            conn.execute(
                "INSERT INTO crawl_checkpoint_history (key, payload, created_at) VALUES (?1, ?2, ?3)",
                params![key, serialized.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn load_checkpoint(&self, key: &str) -> Result<Option<JsonValue>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT payload FROM crawl_checkpoint WHERE key = ?1", params![key])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
                Ok(serde_json::from_str(&payload).ok())
            }
            _ => Ok(None),
        }
    }

    // -- maintenance -------------------------------------------------------

    /// Prune `crawl_events` rows older than `event_retention_days`, then trim
    /// to `event_max_rows` if still over budget, checkpoint the WAL, and
    /// reclaim freed pages (`auto_vacuum = INCREMENTAL` only frees pages when
    /// asked to).
    #[tracing::instrument(skip(self))]
    pub async fn maintenance(&self, event_retention_days: i64, event_max_rows: u64) -> Result<()> {
        let cutoff = (Utc::now() - chrono::Duration::days(event_retention_days)).to_rfc3339();
        let conn = self.conn().await?;

        let tx = match conn.transaction().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(error = %e, "skipping maintenance; crawl db busy");
                return Ok(());
            }
        };

        tx.execute("DELETE FROM crawl_events WHERE event_at < ?1", params![cutoff.as_str()])
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let total = {
            let mut rows = tx.query("SELECT COUNT(*) FROM crawl_events", params![]).await.map_err(|e| Error::Storage(e.to_string()))?;
            match rows.next().await {
                Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0).max(0) as u64,
                _ => 0,
            }
        };
        if total > event_max_rows {
            let trim = total - event_max_rows;
            tx.execute(
                "DELETE FROM crawl_events WHERE id IN (SELECT id FROM crawl_events ORDER BY event_at ASC LIMIT ?1)",
                params![trim],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| Error::Storage(e.to_string()))?;

        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); PRAGMA incremental_vacuum;").await {
            tracing::debug!(error = %e, "skipping wal checkpoint/vacuum; db busy");
        }
        Ok(())
    }

    // -- event history / log -----------------------------------------------

    /// Time-bucketed event counts over the trailing `minutes` (or `range_days`
    /// if given), for dashboards.
    pub async fn event_history(&self, minutes: i64, range_days: Option<i64>, bucket_seconds: i64, limit: u32) -> Result<Vec<EventBucket>> {
        let cutoff = match range_days {
            Some(days) => Utc::now() - chrono::Duration::days(days),
            None => Utc::now() - chrono::Duration::minutes(minutes),
        };
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT event_at, event_type, status FROM crawl_events WHERE event_at >= ?1 ORDER BY event_at ASC LIMIT ?2",
                params![cutoff.to_rfc3339().as_str(), limit],
            )
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut buckets: Vec<EventBucket> = Vec::new();
        let mut index: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();

        while let Ok(Some(row)) = rows.next().await {
            let event_at: String = row.get(0).unwrap_or_default();
            let event_type: String = row.get(1).unwrap_or_default();
            let status: Option<String> = row.get(2).ok();
            let Ok(parsed) = DateTime::parse_from_rfc3339(&event_at) else { continue };
            let parsed = parsed.with_timezone(&Utc);
            let bucket_epoch = (parsed.timestamp() / bucket_seconds) * bucket_seconds;

            let idx = *index.entry(bucket_epoch).or_insert_with(|| {
                buckets.push(EventBucket {
                    bucket_start: DateTime::from_timestamp(bucket_epoch, 0).unwrap_or(parsed),
                    total: 0,
                    success: 0,
                    failed: 0,
                    discovered: 0,
                    fetched: 0,
                });
                buckets.len() - 1
            });
            let bucket = &mut buckets[idx];
            bucket.total += 1;
            if status.as_deref() == Some("failed") {
                bucket.failed += 1;
            } else {
                bucket.success += 1;
            }
            if event_type == "crawl_discovered" {
                bucket.discovered += 1;
            }
            if matches!(event_type.as_str(), "fetch_success" | "cache_hit") {
                bucket.fetched += 1;
            }
        }

        buckets.sort_by_key(|b| b.bucket_start);
        Ok(buckets)
    }

    /// Recent raw events for drill-down views, newest first.
    pub async fn event_log(&self, limit: u32, event_type: Option<&str>, status: Option<&str>) -> Result<Vec<EventLogEntry>> {
        let mut clauses = Vec::new();
        if event_type.is_some() {
            clauses.push("event_type = ?1");
        }
        if status.is_some() {
            clauses.push(if event_type.is_some() { "status = ?2" } else { "status = ?1" });
        }
        let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
        let sql = format!(
            "SELECT event_at, event_type, status, url, reason, detail, duration_ms FROM crawl_events {where_clause} ORDER BY event_at DESC LIMIT ?{}",
            clauses.len() + 1
        );

        let conn = self.conn().await?;
        let mut rows = match (event_type, status) {
            (Some(et), Some(s)) => conn.query(&sql, params![et, s, limit]).await,
            (Some(et), None) => conn.query(&sql, params![et, limit]).await,
            (None, Some(s)) => conn.query(&sql, params![s, limit]).await,
            (None, None) => conn.query(&sql, params![limit]).await,
        }
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let event_at: String = row.get(0).unwrap_or_default();
            let Ok(event_at) = DateTime::parse_from_rfc3339(&event_at) else { continue };
            let detail: Option<String> = row.get(5).ok();
            out.push(EventLogEntry {
                event_at: event_at.with_timezone(&Utc),
                event_type: row.get(1).unwrap_or_default(),
                status: row.get(2).ok(),
                url: row.get(3).ok(),
                reason: row.get(4).ok(),
                detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
                duration_ms: row.get(6).ok(),
            });
        }
        Ok(out)
    }

    /// Path of the backing SQLite file, for diagnostics.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

// Column order mirrors the CREATE TABLE in migrations.rs:
// 0 canonical_url, 1 url, 2 discovered_from, 3 first_seen_at, 4 last_fetched_at,
// 5 next_due_at, 6 last_status, 7 retry_count, 8 last_failure_reason,
// 9 last_failure_at, 10 markdown_rel_path, 11 content_hash, 12 fetch_count,
// 13 cache_hit_count, 14 failure_count, 15 last_event_at
fn row_to_url_metadata(row: &Row) -> Result<UrlMetadata> {
    let canonical: String = row.get(0).map_err(|e| Error::Storage(e.to_string()))?;
    let first_seen_at: Option<String> = row.get(3).ok();
    let last_fetched_at: Option<String> = row.get(4).ok();
    let last_event_at: Option<String> = row.get(15).ok();
    let status: Option<String> = row.get(6).ok();

    Ok(UrlMetadata {
        url: CanonicalUrl::new_unchecked(canonical),
        status: status.as_deref().and_then(UrlStatus::parse).unwrap_or(UrlStatus::Pending),
        fetch_count: row.get::<i64>(12).unwrap_or(0).max(0) as u32,
        cache_hit_count: row.get::<i64>(13).unwrap_or(0).max(0) as u32,
        failure_count: row.get::<i64>(14).unwrap_or(0).max(0) as u32,
        last_event_at: last_event_at.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|d| d.with_timezone(&Utc)),
        last_failure_reason: row.get(8).ok(),
        content_hash: row.get(11).ok(),
        markdown_rel_path: row.get(10).ok(),
        discovered_at: first_seen_at
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        updated_at: last_fetched_at
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    })
}

fn row_to_lock_lease(row: &Row) -> Result<LockLease> {
    let acquired_at: String = row.get(2).map_err(|e| Error::Storage(e.to_string()))?;
    let expires_at: String = row.get(3).map_err(|e| Error::Storage(e.to_string()))?;
    Ok(LockLease {
        name: row.get(0).map_err(|e| Error::Storage(e.to_string()))?,
        owner: row.get(1).map_err(|e| Error::Storage(e.to_string()))?,
        acquired_at: DateTime::parse_from_rfc3339(&acquired_at)
            .map_err(|e| Error::Storage(e.to_string()))?
            .with_timezone(&Utc),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| Error::Storage(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, CrawlStateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CrawlStateStore::open(dir.path()).await.expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn open_runs_migrations() {
        let (_dir, store) = test_store().await;
        assert_eq!(store.schema_version().await, 1);
    }

    #[tokio::test]
    async fn url_metadata_roundtrip() {
        let (_dir, store) = test_store().await;
        store
            .upsert_url_metadata(
                "https://docs.example.com/guide",
                None,
                Some(Utc::now()),
                None,
                UrlStatus::Success,
                0,
                None,
                Some("docs.example.com/guide.md"),
                Some("abc123"),
            )
            .await
            .expect("upsert");

        let meta = store
            .load_url_metadata("https://docs.example.com/guide")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(meta.status, UrlStatus::Success);
        assert_eq!(meta.markdown_rel_path.as_deref(), Some("docs.example.com/guide.md"));
    }

    #[tokio::test]
    async fn enqueue_and_dequeue_batch() {
        let (_dir, store) = test_store().await;
        let mut urls = HashSet::new();
        urls.insert("https://docs.example.com/a".to_string());
        urls.insert("https://docs.example.com/b".to_string());

        let outcome = store.enqueue_urls(&urls, "discovered", 0, false).await.expect("enqueue");
        assert_eq!(outcome.inserted, 2);
        assert!(outcome.skipped_recently_fetched.is_empty());
        assert_eq!(store.queue_depth().await.unwrap(), 2);

        let batch = store.dequeue_batch(10).await.expect("dequeue");
        assert_eq!(batch.len(), 2);
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_skips_recently_succeeded_url_unless_forced() {
        let (_dir, store) = test_store().await;
        let url = "https://docs.example.com/stable";
        store
            .upsert_url_metadata(url, None, Some(Utc::now()), Some(Utc::now() + chrono::Duration::hours(6)), UrlStatus::Success, 0, None, None, None)
            .await
            .unwrap();

        let mut urls = HashSet::new();
        urls.insert(url.to_string());
        let outcome = store.enqueue_urls(&urls, "rediscovered", 0, false).await.unwrap();
        assert_eq!(outcome.inserted, 0, "not due yet, should be skipped");
        assert_eq!(outcome.skipped_recently_fetched, vec![url.to_string()]);
        assert_eq!(store.queue_depth().await.unwrap(), 0);

        let forced = store.enqueue_urls(&urls, "manual", 0, true).await.unwrap();
        assert_eq!(forced.inserted, 1);
        assert!(forced.skipped_recently_fetched.is_empty());
        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lock_acquire_and_release() {
        let (_dir, store) = test_store().await;
        let (lease, contender) = store.try_acquire_lock("crawler", "host:1", 60).await.unwrap();
        assert!(lease.is_some());
        assert!(contender.is_none());

        let (second, existing) = store.try_acquire_lock("crawler", "host:2", 60).await.unwrap();
        assert!(second.is_none());
        assert!(existing.is_some());

        store.release_lock(&lease.unwrap()).await.unwrap();
        let (third, _) = store.try_acquire_lock("crawler", "host:2", 60).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn last_sync_time_roundtrip() {
        let (_dir, store) = test_store().await;
        assert!(store.get_last_sync_time().await.unwrap().is_none());
        let now = Utc::now();
        store.save_last_sync_time(now).await.unwrap();
        let loaded = store.get_last_sync_time().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn was_recently_fetched_honors_interval() {
        let (_dir, store) = test_store().await;
        let url = "https://docs.example.com/p";
        store
            .upsert_url_metadata(url, None, Some(Utc::now()), None, UrlStatus::Success, 0, None, None, None)
            .await
            .unwrap();
        assert!(store.was_recently_fetched(url, 24.0).await.unwrap());
        assert!(!store.was_recently_fetched(url, 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn maintenance_prunes_old_events() {
        let (_dir, store) = test_store().await;
        store
            .record_event(EventRecord { url: Some("https://docs.example.com/x"), event_type: "fetch_success", status: Some("ok"), ..Default::default() })
            .await
            .unwrap();
        store.maintenance(0, EVENT_MAX_ROWS).await.unwrap();
        let history = store.event_history(60, None, 60, 100).await.unwrap();
        assert!(history.is_empty() || history.iter().all(|b| b.total == 0));
    }

    #[tokio::test]
    async fn cleanup_legacy_artifacts_removes_old_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("__scheduler_meta")).unwrap();
        let store = CrawlStateStore::open(dir.path()).await.unwrap();
        store.cleanup_legacy_artifacts().await.unwrap();
        assert!(!dir.path().join("__scheduler_meta").exists());
    }
}
