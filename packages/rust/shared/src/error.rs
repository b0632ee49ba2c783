//! Error types for docsync.
//!
//! Library crates use [`Error`] via `thiserror`. The daemon binary wraps this
//! with `color-eyre` for rich diagnostics at the process boundary.

use std::path::PathBuf;

/// Top-level error type for all docsync operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during crawl, discovery, or cache fetch.
    #[error("network error: {0}")]
    Network(String),

    /// Sitemap or HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Storage layer error (SQLite, short of a critical failure).
    #[error("storage error: {0}")]
    Storage(String),

    /// Storage layer failure the store could not self-heal from after its
    /// retry budget was exhausted. Callers should treat this as fatal for
    /// the affected tenant.
    #[error("database critical: {0}")]
    DatabaseCritical(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed URL, schema mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An operation was attempted that the domain's state machine forbids
    /// (e.g. an illegal `SyncProgress` phase transition, or a reference to
    /// a tenant that is not registered).
    #[error("domain state error: {0}")]
    DomainState(String),

    /// A page fetch failed inside the `Extractor` boundary.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a domain-state error from any displayable message.
    pub fn domain_state(msg: impl Into<String>) -> Self {
        Self::DomainState(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure modes surfaced by an `Extractor` implementation when fetching a
/// single page. Mirrors `DocFetchError` from the original implementation,
/// as a typed sum instead of an exception hierarchy.
#[derive(Debug, thiserror::Error, Clone)]
pub enum FetchError {
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("robots.txt disallows fetch")]
    RobotsDisallowed,

    #[error("content type not supported: {0}")]
    UnsupportedContentType(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl FetchError {
    /// Render as `reason:truncated-detail[:240]`, matching the formatting
    /// the original used for stored failure reasons in `url_metadata`.
    pub fn format_reason(&self) -> String {
        let (reason, detail) = match self {
            FetchError::Timeout(d) => ("timeout".to_string(), format!("{d:?}")),
            FetchError::HttpStatus(code) => ("http_status".to_string(), code.to_string()),
            FetchError::Connection(d) => ("connection_error".to_string(), d.clone()),
            FetchError::RobotsDisallowed => ("robots_disallowed".to_string(), String::new()),
            FetchError::UnsupportedContentType(d) => {
                ("unsupported_content_type".to_string(), d.clone())
            }
            FetchError::ExtractionFailed(d) => ("extraction_failed".to_string(), d.clone()),
            FetchError::Unexpected(d) => ("unexpected_error".to_string(), d.clone()),
        };
        if detail.is_empty() {
            reason
        } else {
            let mut truncated = detail;
            truncated.truncate(240);
            format!("{reason}:{truncated}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = Error::config("missing tenant config");
        assert_eq!(err.to_string(), "config error: missing tenant config");

        let err = Error::validation("url has no scheme");
        assert!(err.to_string().contains("url has no scheme"));
    }

    #[test]
    fn fetch_error_reason_is_truncated() {
        let long = "x".repeat(500);
        let err = FetchError::Connection(long);
        let reason = err.format_reason();
        assert!(reason.starts_with("connection_error:"));
        assert!(reason.len() <= "connection_error:".len() + 240);
    }

    #[test]
    fn fetch_error_without_detail_has_no_colon_suffix() {
        let err = FetchError::RobotsDisallowed;
        assert_eq!(err.format_reason(), "robots_disallowed");
    }
}
