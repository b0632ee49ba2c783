//! Shared types, error model, and configuration for docsync.
//!
//! This crate is the foundation depended on by all other docsync crates.
//! It provides:
//! - [`Error`] — the unified error type, plus [`FetchError`] for the
//!   `Extractor` boundary
//! - Domain types ([`CanonicalUrl`], [`Document`], [`UrlMetadata`], ...)
//! - Configuration ([`TenantConfig`], [`InfraConfig`], config loading)

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::{
    AppConfig, InfraConfig, TenantConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, operation_mode, validate_tenant,
};
pub use error::{Error, FetchError, Result};
pub use retry::RetryPolicy;
pub use types::{
    CanonicalUrl, Document, Event, EventType, LockLease, QueueEntry, SitemapSnapshot, SourceType,
    UrlMetadata, UrlPolicy, UrlStatus,
};
