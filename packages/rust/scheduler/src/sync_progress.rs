//! Resumable sync progress: a small state machine plus domain events,
//! checkpointed through [`docsync_state::CrawlStateStore::save_checkpoint`].
//!
//! Mirrors the Cosmic Python aggregate-plus-domain-events shape: every
//! mutation on [`SyncProgress`] that changes externally-visible state
//! appends a [`SyncEvent`] to its event log, and illegal phase transitions
//! fail fast rather than silently clamping.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use docsync_shared::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Phases of a sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initializing,
    Discovering,
    Fetching,
    Completed,
    Failed,
    Interrupted,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::Failed)
    }

    pub fn can_resume(self) -> bool {
        matches!(self, SyncPhase::Discovering | SyncPhase::Fetching | SyncPhase::Interrupted)
    }

    fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Initializing => "initializing",
            SyncPhase::Discovering => "discovering",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
            SyncPhase::Interrupted => "interrupted",
        }
    }
}

/// Aggregate counters tracked alongside a [`SyncProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub urls_discovered: u64,
    pub urls_pending: u64,
    pub urls_processed: u64,
    pub urls_failed: u64,
    pub urls_skipped: u64,
}

/// Details for a single URL's most recent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub url: String,
    pub error_type: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Domain events appended to a [`SyncProgress`]'s log, Cosmic-Python style.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    Started { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc> },
    PhaseChanged { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc>, previous_phase: String, new_phase: String },
    Completed { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc> },
    Failed { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc>, reason: String },
    UrlProcessed { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc>, url: String },
    UrlFailed { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc>, url: String, error_type: String },
    UrlSkipped { sync_id: Uuid, tenant: String, occurred_at: DateTime<Utc>, url: String, reason: String },
}

/// Aggregate root for a single sync cycle's resumable state.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub tenant_codename: String,
    pub sync_id: Uuid,
    pub phase: SyncPhase,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub discovered_urls: HashSet<String>,
    pub pending_urls: HashSet<String>,
    pub processed_urls: HashSet<String>,
    pub failed_urls: HashMap<String, FailureInfo>,
    pub stats: SyncStats,
    pub events: Vec<SyncEvent>,
}

impl SyncProgress {
    pub fn create_new(tenant_codename: impl Into<String>) -> Self {
        let tenant_codename = tenant_codename.into();
        let sync_id = Uuid::new_v4();
        let now = Utc::now();
        let mut progress = Self {
            tenant_codename: tenant_codename.clone(),
            sync_id,
            phase: SyncPhase::Initializing,
            started_at: now,
            last_checkpoint_at: None,
            completed_at: None,
            failure_reason: None,
            discovered_urls: HashSet::new(),
            pending_urls: HashSet::new(),
            processed_urls: HashSet::new(),
            failed_urls: HashMap::new(),
            stats: SyncStats::default(),
            events: Vec::new(),
        };
        progress.record_event(SyncEvent::Started { sync_id, tenant: tenant_codename, occurred_at: now });
        progress
    }

    pub fn restore_from_checkpoint(checkpoint: &Value) -> Result<Self> {
        let sync_id = checkpoint
            .get("sync_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::domain_state("checkpoint missing sync_id"))?;
        let sync_id = Uuid::parse_str(sync_id).map_err(|e| Error::domain_state(format!("invalid sync_id: {e}")))?;
        let phase: SyncPhase = checkpoint
            .get("phase")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::domain_state(format!("invalid phase: {e}")))?
            .ok_or_else(|| Error::domain_state("checkpoint missing phase"))?;
        let tenant_codename = checkpoint
            .get("tenant_codename")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::domain_state("checkpoint missing tenant_codename"))?
            .to_string();
        let started_at = parse_rfc3339(checkpoint.get("started_at"))?
            .ok_or_else(|| Error::domain_state("checkpoint missing started_at"))?;

        Ok(Self {
            tenant_codename,
            sync_id,
            phase,
            started_at,
            last_checkpoint_at: parse_rfc3339(checkpoint.get("last_checkpoint_at"))?,
            completed_at: parse_rfc3339(checkpoint.get("completed_at"))?,
            failure_reason: checkpoint.get("failure_reason").and_then(Value::as_str).map(str::to_string),
            discovered_urls: string_set(checkpoint.get("discovered_urls")),
            pending_urls: string_set(checkpoint.get("pending_urls")),
            processed_urls: string_set(checkpoint.get("processed_urls")),
            failed_urls: failed_urls_from_json(checkpoint.get("failed_urls"))?,
            stats: checkpoint
                .get("stats")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::domain_state(format!("invalid stats: {e}")))?
                .unwrap_or_default(),
            events: Vec::new(),
        })
    }

    /// Serialize to the checkpoint shape persisted via
    /// `CrawlStateStore::save_checkpoint`.
    pub fn to_checkpoint(&self) -> Value {
        let mut discovered: Vec<&String> = self.discovered_urls.iter().collect();
        discovered.sort();
        let mut pending: Vec<&String> = self.pending_urls.iter().collect();
        pending.sort();
        let mut processed: Vec<&String> = self.processed_urls.iter().collect();
        processed.sort();

        json!({
            "sync_id": self.sync_id.to_string(),
            "tenant_codename": self.tenant_codename,
            "phase": self.phase,
            "started_at": self.started_at.to_rfc3339(),
            "last_checkpoint_at": self.last_checkpoint_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "failure_reason": self.failure_reason,
            "discovered_urls": discovered,
            "pending_urls": pending,
            "processed_urls": processed,
            "failed_urls": self.failed_urls,
            "stats": self.stats,
        })
    }

    /// Stamp `last_checkpoint_at` and return the checkpoint payload to persist.
    pub fn create_checkpoint(&mut self) -> Value {
        self.last_checkpoint_at = Some(Utc::now());
        self.to_checkpoint()
    }

    pub fn start_discovery(&mut self) -> Result<()> {
        self.transition_to(SyncPhase::Discovering)
    }

    pub fn start_fetching(&mut self) -> Result<()> {
        self.transition_to(SyncPhase::Fetching)
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition_to(SyncPhase::Completed)?;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.record_event(SyncEvent::Completed { sync_id: self.sync_id, tenant: self.tenant_codename.clone(), occurred_at: now });
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.failure_reason = Some(error.clone());
        self.transition_to(SyncPhase::Failed)?;
        let now = Utc::now();
        self.record_event(SyncEvent::Failed { sync_id: self.sync_id, tenant: self.tenant_codename.clone(), occurred_at: now, reason: error });
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.phase.can_resume() {
            return Err(Error::domain_state(format!("cannot resume from phase {}", self.phase.as_str())));
        }
        self.transition_to(SyncPhase::Fetching)
    }

    pub fn add_discovered_urls(&mut self, urls: impl IntoIterator<Item = String>) {
        let mut added = false;
        for url in urls {
            if self.discovered_urls.insert(url.clone()) {
                self.pending_urls.insert(url);
                added = true;
            }
        }
        if added {
            self.stats.urls_discovered = self.discovered_urls.len() as u64;
            self.stats.urls_pending = self.pending_urls.len() as u64;
        }
    }

    pub fn enqueue_urls(&mut self, urls: impl IntoIterator<Item = String>) {
        let mut added = false;
        for url in urls {
            if self.processed_urls.contains(&url) {
                continue;
            }
            if self.pending_urls.insert(url) {
                added = true;
            }
        }
        if added {
            self.stats.urls_pending = self.pending_urls.len() as u64;
        }
    }

    pub fn mark_url_processed(&mut self, url: &str) {
        self.pending_urls.remove(url);
        self.processed_urls.insert(url.to_string());
        self.failed_urls.remove(url);
        self.stats.urls_pending = self.pending_urls.len() as u64;
        self.stats.urls_processed = self.processed_urls.len() as u64;
        self.stats.urls_failed = self.failed_urls.len() as u64;
        let now = Utc::now();
        self.record_event(SyncEvent::UrlProcessed { sync_id: self.sync_id, tenant: self.tenant_codename.clone(), occurred_at: now, url: url.to_string() });
    }

    pub fn mark_url_failed(&mut self, url: &str, error_type: &str, error_message: &str) {
        let now = Utc::now();
        let retry_count = self.failed_urls.get(url).map(|f| f.retry_count + 1).unwrap_or(1);
        self.failed_urls.insert(
            url.to_string(),
            FailureInfo { url: url.to_string(), error_type: error_type.to_string(), error_message: error_message.to_string(), failed_at: now, retry_count },
        );
        self.pending_urls.remove(url);
        self.processed_urls.remove(url);
        self.stats.urls_pending = self.pending_urls.len() as u64;
        self.stats.urls_processed = self.processed_urls.len() as u64;
        self.stats.urls_failed = self.failed_urls.len() as u64;
        self.record_event(SyncEvent::UrlFailed { sync_id: self.sync_id, tenant: self.tenant_codename.clone(), occurred_at: now, url: url.to_string(), error_type: error_type.to_string() });
    }

    pub fn mark_url_skipped(&mut self, url: &str, reason: &str) {
        self.pending_urls.remove(url);
        self.stats.urls_pending = self.pending_urls.len() as u64;
        self.stats.urls_skipped += 1;
        let now = Utc::now();
        self.record_event(SyncEvent::UrlSkipped { sync_id: self.sync_id, tenant: self.tenant_codename.clone(), occurred_at: now, url: url.to_string(), reason: reason.to_string() });
    }

    pub fn can_resume(&self) -> bool {
        self.phase.can_resume()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == SyncPhase::Completed
    }

    pub fn duration(&self) -> chrono::Duration {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        end - self.started_at
    }

    fn transition_to(&mut self, new_phase: SyncPhase) -> Result<()> {
        if self.phase == new_phase {
            return Ok(());
        }
        if self.phase.is_terminal() {
            return Err(Error::domain_state(format!(
                "cannot transition from terminal phase {} to {}",
                self.phase.as_str(),
                new_phase.as_str()
            )));
        }
        let previous = self.phase;
        self.phase = new_phase;
        let now = Utc::now();
        self.record_event(SyncEvent::PhaseChanged {
            sync_id: self.sync_id,
            tenant: self.tenant_codename.clone(),
            occurred_at: now,
            previous_phase: previous.as_str().to_string(),
            new_phase: new_phase.as_str().to_string(),
        });
        Ok(())
    }

    fn record_event(&mut self, event: SyncEvent) {
        self.events.push(event);
    }
}

fn parse_rfc3339(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    match value.and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| Error::domain_state(format!("invalid timestamp {s:?}: {e}"))),
    }
}

fn string_set(value: Option<&Value>) -> HashSet<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn failed_urls_from_json(value: Option<&Value>) -> Result<HashMap<String, FailureInfo>> {
    let Some(obj) = value.and_then(Value::as_object) else { return Ok(HashMap::new()) };
    obj.iter()
        .map(|(url, info)| {
            let info: FailureInfo = serde_json::from_value(info.clone())
                .map_err(|e| Error::domain_state(format!("invalid failure info for {url}: {e}")))?;
            Ok((url.clone(), info))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_to_completion_round_trips_through_checkpoint() {
        let mut progress = SyncProgress::create_new("acme-docs");
        progress.start_discovery().unwrap();
        progress.add_discovered_urls(["https://docs.acme.test/a".to_string(), "https://docs.acme.test/b".to_string()]);
        progress.start_fetching().unwrap();
        progress.mark_url_processed("https://docs.acme.test/a");
        progress.mark_url_failed("https://docs.acme.test/b", "Timeout", "read timed out");
        progress.mark_completed().unwrap();

        assert_eq!(progress.stats.urls_processed, 1);
        assert_eq!(progress.stats.urls_failed, 1);

        let checkpoint = progress.to_checkpoint();
        let restored = SyncProgress::restore_from_checkpoint(&checkpoint).unwrap();
        assert_eq!(restored.phase, SyncPhase::Completed);
        assert_eq!(restored.processed_urls.len(), 1);
        assert_eq!(restored.failed_urls.len(), 1);
        assert!(!restored.can_resume());
    }

    #[test]
    fn terminal_phase_transition_is_rejected() {
        let mut progress = SyncProgress::create_new("acme-docs");
        progress.mark_failed("boom").unwrap();
        let err = progress.start_discovery().unwrap_err();
        assert!(matches!(err, Error::DomainState(_)));
    }

    #[test]
    fn resume_requires_a_resumable_phase() {
        let mut progress = SyncProgress::create_new("acme-docs");
        assert!(progress.resume().is_err());
        progress.start_discovery().unwrap();
        progress.resume().unwrap();
        assert_eq!(progress.phase, SyncPhase::Fetching);
    }

    #[test]
    fn enqueue_skips_already_processed_urls() {
        let mut progress = SyncProgress::create_new("acme-docs");
        progress.start_discovery().unwrap();
        progress.add_discovered_urls(["https://docs.acme.test/a".to_string()]);
        progress.mark_url_processed("https://docs.acme.test/a");
        progress.enqueue_urls(["https://docs.acme.test/a".to_string()]);
        assert!(!progress.pending_urls.contains("https://docs.acme.test/a"));
    }

    #[test]
    fn retry_count_accumulates_across_repeat_failures() {
        let mut progress = SyncProgress::create_new("acme-docs");
        progress.mark_url_failed("https://docs.acme.test/a", "Timeout", "first");
        progress.mark_url_failed("https://docs.acme.test/a", "Timeout", "second");
        assert_eq!(progress.failed_urls["https://docs.acme.test/a"].retry_count, 2);
    }
}
