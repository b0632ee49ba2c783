//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docsync_scheduler::TenantApp;
use docsync_shared::{AppConfig, SourceType, load_config};

use crate::extractor::HtmlExtractor;

/// docsyncd — multi-tenant documentation sync daemon.
#[derive(Parser)]
#[command(
    name = "docsyncd",
    version,
    about = "Keep a per-tenant documentation corpus in sync with its upstream source.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start every configured tenant's scheduler and run until interrupted.
    Run,

    /// Run one sync cycle for a tenant in the foreground, then exit.
    Trigger {
        /// Tenant id, matching `[[tenant]] id` in the config file.
        tenant: String,

        /// Force a crawler pass even if the schedule wouldn't normally run one.
        #[arg(long)]
        force_crawler: bool,

        /// Ignore cached freshness and re-fetch every known URL.
        #[arg(long)]
        force_full_sync: bool,
    },

    /// Print each configured tenant's health snapshot.
    Status,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docsyncd=info",
        1 => "docsyncd=debug",
        _ => "docsyncd=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => cmd_run().await,
        Command::Trigger { tenant, force_crawler, force_full_sync } => cmd_trigger(&tenant, force_crawler, force_full_sync).await,
        Command::Status => cmd_status().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn online_tenants(config: &AppConfig) -> Vec<docsync_shared::TenantConfig> {
    config.tenants.iter().filter(|t| t.source_type == SourceType::Online).cloned().collect()
}

async fn bootstrap_tenant(tenant: docsync_shared::TenantConfig, config: &AppConfig) -> Result<TenantApp> {
    let extractor = Arc::new(HtmlExtractor::new(&config.infra.user_agent, config.infra.http_timeout_secs));
    TenantApp::bootstrap(tenant, config.infra.clone(), extractor, None, None).await.map_err(|e| eyre!(e.to_string()))
}

async fn cmd_run() -> Result<()> {
    let config = load_config()?;
    let tenants = online_tenants(&config);
    if tenants.is_empty() {
        return Err(eyre!("no online tenants configured — nothing to sync"));
    }

    let mut apps = Vec::new();
    for tenant in tenants {
        let id = tenant.id.clone();
        tracing::info!(tenant = %id, "bootstrapping tenant");
        let app = bootstrap_tenant(tenant, &config).await?;
        app.initialize().await.map_err(|e| eyre!(e.to_string()))?;
        apps.push(app);
    }

    tracing::info!(tenants = apps.len(), "docsyncd running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.map_err(|e| eyre!("failed to listen for shutdown signal: {e}"))?;

    tracing::info!("shutting down");
    for app in &apps {
        app.shutdown().await;
    }
    Ok(())
}

async fn cmd_trigger(tenant_id: &str, force_crawler: bool, force_full_sync: bool) -> Result<()> {
    let config = load_config()?;
    let tenant = config
        .tenants
        .iter()
        .find(|t| t.id == tenant_id)
        .ok_or_else(|| eyre!("no tenant named '{tenant_id}' in config"))?
        .clone();
    if tenant.source_type != SourceType::Online {
        return Err(eyre!("tenant '{tenant_id}' is not source_type = online; only online tenants run a sync engine"));
    }

    let app = bootstrap_tenant(tenant, &config).await?;
    app.scheduler().start().await.map_err(|e| eyre!(e.to_string()))?;
    let outcome = app.scheduler().trigger_sync(force_crawler, force_full_sync).await;
    app.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        return Err(eyre!(outcome.message));
    }
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let tenants = online_tenants(&config);
    if tenants.is_empty() {
        println!("[]");
        return Ok(());
    }

    let mut reports = Vec::new();
    for tenant in tenants {
        let id = tenant.id.clone();
        match bootstrap_tenant(tenant, &config).await {
            Ok(app) => match app.health().await {
                Ok(report) => reports.push(serde_json::to_value(report)?),
                Err(e) => reports.push(serde_json::json!({"tenant": id, "status": "error", "error": e.to_string()})),
            },
            Err(e) => reports.push(serde_json::json!({"tenant": id, "status": "error", "error": e.to_string()})),
        }
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = docsync_shared::init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
