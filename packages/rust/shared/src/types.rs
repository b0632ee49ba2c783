//! Core domain value types shared across docsync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A URL that has passed through `docsync_pathbuilder::canonicalize` and is
/// safe to use as a stable cache/storage key. Never construct directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(pub String);

impl CanonicalUrl {
    /// Wrap an already-canonical string. Only `docsync-pathbuilder` should
    /// call this outside of tests.
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fetched and extracted document, ready for caching/storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub url: CanonicalUrl,
    pub title: Option<String>,
    pub markdown: String,
    pub text: String,
    pub excerpt: String,
    pub markdown_rel_path: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_fetched_at: DateTime<Utc>,
}

/// Lifecycle status of a URL tracked in `crawl_urls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Success => "success",
            UrlStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A row from `crawl_urls` — per-URL crawl bookkeeping (§3 URLMetadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlMetadata {
    pub url: CanonicalUrl,
    pub status: UrlStatus,
    pub fetch_count: u32,
    pub cache_hit_count: u32,
    pub failure_count: u32,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub content_hash: Option<String>,
    pub markdown_rel_path: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entry in the `crawl_queue` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub url: CanonicalUrl,
    pub depth: u32,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i64,
}

/// A distributed lock lease from `crawl_locks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockLease {
    pub name: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Event kinds recorded in `crawl_events`, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    QueueEnqueued,
    QueueDequeued,
    QueueRemoved,
    CrawlStart,
    CrawlComplete,
    CrawlError,
    CrawlSkipped,
    CrawlDiscovered,
    CacheHit,
    FetchSuccess,
    FetchFailure,
    MetadataPruned,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::QueueEnqueued => "queue_enqueued",
            EventType::QueueDequeued => "queue_dequeued",
            EventType::QueueRemoved => "queue_removed",
            EventType::CrawlStart => "crawl_start",
            EventType::CrawlComplete => "crawl_complete",
            EventType::CrawlError => "crawl_error",
            EventType::CrawlSkipped => "crawl_skipped",
            EventType::CrawlDiscovered => "crawl_discovered",
            EventType::CacheHit => "cache_hit",
            EventType::FetchSuccess => "fetch_success",
            EventType::FetchFailure => "fetch_failure",
            EventType::MetadataPruned => "metadata_pruned",
        }
    }
}

/// A row appended to `crawl_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub url: Option<CanonicalUrl>,
    pub detail: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// A stored sitemap fetch, used for change detection across cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapSnapshot {
    pub url: String,
    pub content_hash: String,
    pub url_count: usize,
    pub fetched_at: DateTime<Utc>,
}

/// Where a tenant's documents originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Online,
    Filesystem,
    Git,
}

/// Simple prefix-based allow/deny policy over discovered URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlPolicy {
    #[serde(default)]
    pub allow_prefixes: Vec<String>,
    #[serde(default)]
    pub deny_prefixes: Vec<String>,
}

impl UrlPolicy {
    pub fn allows(&self, url: &str) -> bool {
        if self.deny_prefixes.iter().any(|p| url.starts_with(p.as_str())) {
            return false;
        }
        if self.allow_prefixes.is_empty() {
            return true;
        }
        self.allow_prefixes.iter().any(|p| url.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_status_roundtrips_through_string() {
        for s in ["pending", "processing", "success", "failed"] {
            let parsed = UrlStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(UrlStatus::parse("bogus").is_none());
    }

    #[test]
    fn lock_lease_expiry() {
        let now = Utc::now();
        let lease = LockLease {
            name: "crawler".into(),
            owner: "host:1:sched:now".into(),
            acquired_at: now - chrono::Duration::seconds(10),
            expires_at: now - chrono::Duration::seconds(1),
        };
        assert!(lease.is_expired(now));
        assert_eq!(lease.remaining_seconds(now), 0);
    }

    #[test]
    fn url_policy_deny_wins_over_allow() {
        let policy = UrlPolicy {
            allow_prefixes: vec!["https://docs.example.com/".into()],
            deny_prefixes: vec!["https://docs.example.com/internal/".into()],
        };
        assert!(policy.allows("https://docs.example.com/guide"));
        assert!(!policy.allows("https://docs.example.com/internal/secret"));
        assert!(!policy.allows("https://other.example.com/guide"));
    }

    #[test]
    fn url_policy_empty_allow_list_allows_everything_not_denied() {
        let policy = UrlPolicy::default();
        assert!(policy.allows("https://anywhere.example.com/"));
    }
}
