mod api;
mod artifact_store;
mod auth;
mod cli;
mod clock;
mod config;
mod credits;
mod error;
mod models;
mod provider;
mod rate_limit;
mod reaper;
mod scheduler;
mod store;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use artifact_store::ArtifactStore;
use clock::SystemClock;
use config::Config;
use provider::{CloudProviderClient, ThrottledProvider};
use rate_limit::RateLimiter;
use reaper::Reaper;
use scheduler::Scheduler;
use store::Store;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub scheduler: Scheduler,
    pub artifacts: ArtifactStore,
    pub submit_limiter: Arc<RateLimiter>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if cli::maybe_run_from_cli(&args).await? {
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model3d_queue_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; set MODEL3D_API_KEY to make it stable");
    }

    let provider_http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;
    let (connect_timeout, idle_timeout) = config.download_timeouts();
    let download_http = artifact_store::download_client(connect_timeout, idle_timeout)?;

    let artifacts =
        ArtifactStore::new(&config.storage_root, &config.public_base_url, download_http);
    artifacts.ensure_root().await?;

    let store = Arc::new(
        Store::open(&config.database_path)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
    );

    let provider = ThrottledProvider::new(
        CloudProviderClient::new(config.provider_config(), provider_http),
        Arc::new(RateLimiter::new(
            config.provider_rate_limit_per_minute,
            config.provider_rate_limit_burst,
        )),
    );
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(provider),
        artifacts.clone(),
        Arc::new(SystemClock),
        config.scheduler_settings(),
    );

    let interrupted = scheduler.resume_pending().await?;
    if interrupted > 0 {
        warn!(interrupted, "Failed jobs left running by a previous process");
    }

    if config.cleanup_interval_seconds > 0 {
        reaper::spawn_cleanup_worker(
            Reaper::new(store.clone(), artifacts.clone()),
            Duration::from_secs(config.cleanup_interval_seconds),
            config.expired_grace(),
        );
    }

    let state = AppState {
        config: config.clone(),
        store,
        scheduler,
        artifacts,
        submit_limiter: Arc::new(RateLimiter::new(
            config.submit_rate_limit_per_minute,
            config.submit_rate_limit_burst,
        )),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("model3d-queue-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
