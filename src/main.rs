//! Meli Sync - Mercado Livre catalog synchronization
//!
//! Command-line entry point: runs sync jobs in the foreground, serves the
//! control API with the token monitor, and drives the OAuth authorization
//! steps. Every setting has an environment fallback.

use clap::{Parser, Subcommand};
use meli_sync::auth::mask_token;
use meli_sync::clock::SystemClock;
use meli_sync::config::{
    parse_strategies, OAuthSettings, SyncConfig, DEFAULT_API_BASE_URL, DEFAULT_AUTH_BASE_URL,
};
use meli_sync::job::{JobOptions, JobStatus, SyncJob, SyncMode};
use meli_sync::{database, web, App, CredentialState, OpClass};
use std::path::PathBuf;
use std::sync::Arc;

/// Mercado Livre catalog sync - keeps a local product catalog in step with a seller inventory
#[derive(Parser, Debug)]
#[command(name = "meli_sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the SQLite database file
    #[arg(short, long, env = "ML_DATABASE", default_value_t = default_db_path())]
    database: String,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Settings {
    /// Marketplace application id
    #[arg(long, env = "ML_CLIENT_ID", default_value = "")]
    client_id: String,

    /// Marketplace application secret
    #[arg(long, env = "ML_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    client_secret: String,

    /// Redirect URI registered for the application
    #[arg(long, env = "ML_REDIRECT_URI", default_value = "")]
    redirect_uri: String,

    /// Seller whose inventory is synced (default: the authorized user)
    #[arg(long, env = "ML_SELLER_ID", default_value = "")]
    seller_id: String,

    #[arg(long, env = "ML_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    #[arg(long, env = "ML_AUTH_BASE_URL", default_value = DEFAULT_AUTH_BASE_URL)]
    auth_base_url: String,

    /// Site searched by the category strategy
    #[arg(long, env = "ML_SITE_ID", default_value = "MLB")]
    site_id: String,

    /// Requests per minute shared by every marketplace call
    #[arg(long, env = "ML_RATE_LIMIT", default_value_t = 250)]
    rate_limit: u32,

    /// Maximum in-flight marketplace requests
    #[arg(long, env = "ML_MAX_CONCURRENCY", default_value_t = 8)]
    max_concurrency: usize,

    /// Default identifiers per checkpointed batch
    #[arg(long, env = "ML_FULL_SYNC_BATCH", default_value_t = 300)]
    full_sync_batch: u32,

    /// Default cap on items per job (default: no cap)
    #[arg(long, env = "ML_FULL_SYNC_MAX")]
    full_sync_max: Option<usize>,

    /// Collection strategies, comma separated
    #[arg(long, env = "ML_STRATEGIES", default_value = "status,time,category,scan")]
    strategies: String,

    /// Refresh token used to seed an empty credential store
    #[arg(long, env = "ML_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,
}

impl Settings {
    fn to_config(&self) -> meli_sync::Result<SyncConfig> {
        Ok(SyncConfig {
            api_base_url: self.api_base_url.clone(),
            auth_base_url: self.auth_base_url.clone(),
            site_id: self.site_id.clone(),
            oauth: OAuthSettings {
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
                redirect_uri: self.redirect_uri.clone(),
            },
            seller_id: self.seller_id.clone(),
            requests_per_minute: self.rate_limit,
            max_concurrency: self.max_concurrency,
            batch_size: self.full_sync_batch,
            max_items: self.full_sync_max,
            strategies: parse_strategies(&self.strategies)?,
            ..SyncConfig::default()
        })
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Serve the control API and keep the token fresh in the background
    Serve {
        #[arg(long, env = "ML_PORT", default_value_t = 8080)]
        port: u16,

        /// Do not start the token monitor
        #[arg(long, default_value_t = false)]
        no_monitor: bool,
    },
    /// Run a sync job in the foreground
    Sync {
        /// full, incremental or new-only
        #[arg(long, default_value = "full")]
        mode: SyncMode,

        #[arg(long)]
        batch_size: Option<u32>,

        /// Maximum number of items to process
        #[arg(long)]
        limit: Option<usize>,

        /// Incremental window in hours
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        since_hours: Option<i64>,
    },
    /// Continue an interrupted job from its last checkpoint
    Resume,
    /// Print the job and token status
    Status,
    /// Collect item identifiers and print the report without syncing
    Collect {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the authorization URL the seller must open
    AuthUrl,
    /// Exchange an authorization code for the initial credential
    ExchangeCode { code: String },
    /// Force a token refresh
    Refresh,
    /// Show the user the stored credential belongs to
    Whoami,
}

/// Returns the default database path: ~/.local/share/meli_sync/meli_sync.db
fn default_db_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meli_sync")
        .join("meli_sync.db")
        .to_string_lossy()
        .to_string()
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = PathBuf::from(&args.database);
    log::info!("Database path: {}", db_path.display());

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            log::info!("Created directory: {}", parent.display());
        }
    }

    let db = database::shared(database::open(&db_path)?);
    let config = args.settings.to_config()?;
    let app = App::build(config, db, Arc::new(SystemClock))?;

    if let Some(token) = args.settings.refresh_token.as_deref() {
        app.credentials.seed_refresh_token(token)?;
    }

    match args.command {
        Command::Serve { port, no_monitor } => {
            let job = app.jobs.status()?;
            if job.status.is_busy() {
                log::warn!(
                    "Previous job left {} at offset {}; POST /api/sync/resume to continue it",
                    job.status,
                    job.current_offset
                );
            }
            match app.credentials.state()? {
                CredentialState::Absent => {
                    log::warn!("No credential stored yet; authorize through GET /api/auth/url")
                }
                CredentialState::Invalid => {
                    log::warn!("Stored credential was revoked; re-authorize via GET /api/auth/url")
                }
                _ => {}
            }
            if !no_monitor {
                app.monitor.start();
            }
            web::serve(app.control_state(), port).await?;
            app.monitor.stop().await;
        }
        Command::Sync {
            mode,
            batch_size,
            limit,
            since_hours,
        } => {
            let job = app
                .jobs
                .sync(JobOptions {
                    mode,
                    batch_size,
                    max_items: limit,
                    since_hours,
                })
                .await?;
            print_job(&job);
        }
        Command::Resume => {
            let job = app.jobs.resume().await?;
            print_job(&job);
        }
        Command::Status => {
            print_job(&app.jobs.status()?);
            let token = app.credentials.status().await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        Command::Collect { limit } => {
            let report = app.collector().collect(limit).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::AuthUrl => {
            println!("{}", app.credentials.authorization_url());
        }
        Command::ExchangeCode { code } => {
            let credential = app.credentials.exchange_authorization_code(&code).await?;
            println!(
                "Authorized user {} (token {}, expires {})",
                credential.subject_id.as_deref().unwrap_or("?"),
                mask_token(&credential.access_token),
                credential.expires_at
            );
        }
        Command::Refresh => {
            let credential = app.credentials.refresh().await?;
            println!(
                "Refreshed token {} (expires {})",
                mask_token(&credential.access_token),
                credential.expires_at
            );
        }
        Command::Whoami => {
            let user = app.credentials.verify(OpClass::Write).await?;
            println!(
                "{} ({}, site {})",
                user.id,
                user.nickname.as_deref().unwrap_or("?"),
                user.site_id.as_deref().unwrap_or("?")
            );
        }
    }

    Ok(())
}

fn print_job(job: &SyncJob) {
    println!(
        "Job {} ({}): {}/{} ({}%) - {} new, {} updated, {} unchanged, {} failed",
        job.status,
        job.mode,
        job.current_offset,
        job.total_expected.unwrap_or(0),
        job.progress_percent(),
        job.new_count,
        job.updated_count,
        job.unchanged_count,
        job.failed_count
    );
    if job.status == JobStatus::Error {
        if let Some(message) = &job.error_message {
            println!("Error: {}", message);
        }
    }
}
