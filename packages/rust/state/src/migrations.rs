//! SQL migration definitions for the per-tenant crawl state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements executed together.

pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "crawl state: urls, queue, locks, meta, sitemaps, debug, summary, progress, checkpoints, events",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS crawl_urls (
    canonical_url      TEXT PRIMARY KEY,
    url                TEXT NOT NULL,
    discovered_from    TEXT,
    first_seen_at      TEXT,
    last_fetched_at    TEXT,
    next_due_at        TEXT,
    last_status        TEXT,
    retry_count         INTEGER,
    last_failure_reason TEXT,
    last_failure_at    TEXT,
    markdown_rel_path  TEXT,
    content_hash       TEXT,
    fetch_count        INTEGER DEFAULT 0,
    cache_hit_count    INTEGER DEFAULT 0,
    failure_count      INTEGER DEFAULT 0,
    last_event_at      TEXT
);

CREATE TABLE IF NOT EXISTS crawl_queue (
    canonical_url TEXT PRIMARY KEY,
    url           TEXT NOT NULL,
    enqueued_at   TEXT,
    priority      INTEGER DEFAULT 0,
    reason        TEXT
);

CREATE TABLE IF NOT EXISTS crawl_locks (
    name        TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_meta (
    key   TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS crawl_sitemaps (
    snapshot_id TEXT PRIMARY KEY,
    payload     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_debug (
    name       TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_summary (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_progress (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_checkpoint (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_checkpoint_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    key        TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawl_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_at    TEXT NOT NULL,
    canonical_url TEXT,
    url         TEXT,
    event_type  TEXT NOT NULL,
    status      TEXT,
    reason      TEXT,
    detail      TEXT,
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_crawl_events_url_time ON crawl_events (canonical_url, event_at DESC);
CREATE INDEX IF NOT EXISTS idx_crawl_events_time ON crawl_events (event_at DESC);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
