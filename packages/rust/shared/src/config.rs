//! Tenant and infrastructure configuration for docsync.
//!
//! Config lives at `~/.docsync/docsync.toml` (or `DOCSYNC_CONFIG`): one
//! `[infra]` section plus one `[[tenant]]` table per configured tenant.
//! `OPERATION_MODE` (env var, default `online`) can force every tenant's
//! `source_type` to `filesystem` for offline/air-gapped runs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{SourceType, UrlPolicy};

const CONFIG_FILE_NAME: &str = "docsync.toml";
const CONFIG_DIR_NAME: &str = ".docsync";
const CONFIG_ENV_VAR: &str = "DOCSYNC_CONFIG";
const OPERATION_MODE_ENV_VAR: &str = "OPERATION_MODE";

/// Top-level config file, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub infra: InfraConfig,

    #[serde(default, rename = "tenant")]
    pub tenants: Vec<TenantConfig>,
}

/// `[infra]` — shared infrastructure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Root directory under which each tenant gets its own subdirectory.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// HTTP request timeout in seconds, used by discovery/crawler/cache.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// User-Agent string sent on outbound requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Event retention window in days (§4.B maintenance).
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,

    /// Hard cap on `crawl_events` rows before maintenance prunes oldest rows.
    #[serde(default = "default_event_max_rows")]
    pub event_max_rows: u64,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
            event_retention_days: default_event_retention_days(),
            event_max_rows: default_event_max_rows(),
        }
    }
}

fn default_data_root() -> String {
    "~/docsync-data".into()
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("docsync/", env!("CARGO_PKG_VERSION")).into()
}
fn default_event_retention_days() -> i64 {
    49
}
fn default_event_max_rows() -> u64 {
    200_000
}

/// `[[tenant]]` — one configured documentation source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Stable tenant identifier (directory-safe slug).
    pub id: String,

    /// Where this tenant's documents come from.
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,

    /// Entry URL(s) to discover/crawl from, for `source_type = online`.
    #[serde(default)]
    pub entry_urls: Vec<String>,

    /// Sitemap URL override. When absent, derived as `<origin>/sitemap.xml`.
    #[serde(default)]
    pub sitemap_url: Option<String>,

    /// Local filesystem path, for `source_type = filesystem` or `git`.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Cron expression controlling the sync schedule (§4.F).
    #[serde(default = "default_cron")]
    pub cron_schedule: String,

    /// Maximum crawl depth from each entry URL.
    #[serde(default = "default_crawl_depth")]
    pub crawl_depth: u32,

    /// Baseline worker concurrency before adaptive scaling (§4.E E2).
    pub crawl_concurrency: u32,

    /// Baseline per-host delay in ms before adaptive scaling (§4.E E1).
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,

    /// Minimum hours between re-fetches of an unchanged URL (§4.D).
    #[serde(default = "default_min_fetch_interval_hours")]
    pub min_fetch_interval_hours: i64,

    /// Whether the semantic cache fallback is enabled (§4.D step 3).
    #[serde(default = "default_true")]
    pub use_semantic_cache: bool,

    /// URL allow/deny policy applied during discovery and crawling.
    #[serde(default)]
    pub url_policy: UrlPolicy,
}

fn default_source_type() -> SourceType {
    SourceType::Online
}
fn default_cron() -> String {
    "0 */6 * * *".into()
}
fn default_crawl_depth() -> u32 {
    5
}
fn default_rate_limit_ms() -> u64 {
    250
}
fn default_min_fetch_interval_hours() -> i64 {
    24
}
fn default_true() -> bool {
    true
}

impl TenantConfig {
    /// Apply the `OPERATION_MODE` env var override: forces `source_type`
    /// to `filesystem` (offline mode) regardless of the configured value.
    pub fn with_operation_mode_override(mut self) -> Self {
        if operation_mode() == "offline" {
            self.source_type = SourceType::Filesystem;
        }
        self
    }
}

/// Read `OPERATION_MODE`, defaulting to `"online"`.
pub fn operation_mode() -> String {
    std::env::var(OPERATION_MODE_ENV_VAR).unwrap_or_else(|_| "online".into())
}

/// Directory holding the config file (`~/.docsync/` by default).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Path to the config file, honoring `DOCSYNC_CONFIG` if set.
pub fn config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load config from disk, returning defaults (zero tenants) if absent.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }
    load_config_from(&path)
}

/// Load config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
    for tenant in &config.tenants {
        validate_tenant(tenant)?;
    }
    Ok(config)
}

/// Validate a tenant's config is internally consistent for its source type.
pub fn validate_tenant(tenant: &TenantConfig) -> Result<()> {
    match tenant.source_type {
        SourceType::Online => {
            if tenant.entry_urls.is_empty() {
                return Err(Error::config(format!(
                    "tenant '{}': source_type = online requires at least one entry_url",
                    tenant.id
                )));
            }
        }
        SourceType::Filesystem | SourceType::Git => {
            if tenant.local_path.is_none() {
                return Err(Error::config(format!(
                    "tenant '{}': source_type = {:?} requires local_path",
                    tenant.id, tenant.source_type
                )));
            }
        }
    }
    Ok(())
}

/// Create the config directory and write a default (empty-tenant) config.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| Error::config(e.to_string()))?;
    std::fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
    tracing::info!(?path, "created default config file");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("data_root"));
    }

    #[test]
    fn config_roundtrip_with_tenant() {
        let toml_str = r#"
[infra]
data_root = "/tmp/docsync"

[[tenant]]
id = "acme"
entry_urls = ["https://docs.acme.example.com/"]
crawl_concurrency = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].id, "acme");
        assert_eq!(config.tenants[0].crawl_depth, 5);
        assert!(config.tenants[0].use_semantic_cache);
    }

    #[test]
    fn online_tenant_without_entry_urls_is_invalid() {
        let tenant = TenantConfig {
            id: "bad".into(),
            source_type: SourceType::Online,
            entry_urls: vec![],
            sitemap_url: None,
            local_path: None,
            cron_schedule: default_cron(),
            crawl_depth: 5,
            crawl_concurrency: 4,
            rate_limit_ms: 250,
            min_fetch_interval_hours: 24,
            use_semantic_cache: true,
            url_policy: UrlPolicy::default(),
        };
        assert!(validate_tenant(&tenant).is_err());
    }

    #[test]
    fn filesystem_tenant_requires_local_path() {
        let tenant = TenantConfig {
            id: "fs".into(),
            source_type: SourceType::Filesystem,
            entry_urls: vec![],
            sitemap_url: None,
            local_path: None,
            cron_schedule: default_cron(),
            crawl_depth: 5,
            crawl_concurrency: 4,
            rate_limit_ms: 250,
            min_fetch_interval_hours: 24,
            use_semantic_cache: true,
            url_policy: UrlPolicy::default(),
        };
        assert!(validate_tenant(&tenant).is_err());
    }
}
