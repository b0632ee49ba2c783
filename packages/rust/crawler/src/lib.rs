//! Breadth-first web crawler: seed-set discovery, adaptive per-host rate
//! limiting, adaptive worker concurrency, and href-based link extraction.
//!
//! The crawler has no storage dependency. It hands discovered URLs to the
//! caller through [`engine::CrawlHooks::on_url_discovered`] and defers
//! idempotency decisions to an optional `should_skip_recent` callback —
//! both are expected to be backed by `docsync-state` one layer up.

pub mod engine;
mod rate_limit;

pub use engine::{CrawlHooks, CrawlSummary, Crawler, CrawlerConfig};
pub use rate_limit::{ConcurrencyLimiter, HostRateLimiter};
