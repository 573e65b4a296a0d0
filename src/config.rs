use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Result;
use uuid::Uuid;

use crate::{
    clock::PeakWindow, credits::CreditPricing, provider::ProviderConfig,
    scheduler::SchedulerSettings,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub storage_root: PathBuf,
    pub database_path: PathBuf,
    pub public_base_url: String,
    pub max_concurrent: usize,
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub poll_interval_seconds: u64,
    pub max_poll_attempts: u32,
    pub drain_delay_seconds: u64,
    pub http_timeout_seconds: u64,
    pub download_idle_timeout_seconds: u64,
    pub retention_days: i64,
    pub expired_grace_days: i64,
    pub cleanup_interval_seconds: u64,
    pub basic_tier_credits: i64,
    pub provider_endpoint: String,
    pub provider_secret_id: String,
    pub provider_secret_key: String,
    pub provider_region: String,
    pub provider_rate_limit_per_minute: u32,
    pub provider_rate_limit_burst: u32,
    pub submit_rate_limit_per_minute: u32,
    pub submit_rate_limit_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("MODEL3D_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let storage_root = PathBuf::from(
            env::var("MODEL3D_STORAGE_ROOT").unwrap_or_else(|_| "./storage".to_string()),
        );
        let database_path = env::var("MODEL3D_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| storage_root.join("model3d.sqlite3"));
        let public_base_url =
            env::var("MODEL3D_PUBLIC_BASE_URL").unwrap_or_else(|_| "/api/storage".to_string());

        let peak_start_hour = parsed("MODEL3D_PEAK_START_HOUR", 9u32).min(23);
        let peak_end_hour = parsed("MODEL3D_PEAK_END_HOUR", 22u32).min(23);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            storage_root,
            database_path,
            public_base_url,
            max_concurrent: parsed("MODEL3D_MAX_CONCURRENT", 3usize).max(1),
            peak_start_hour,
            peak_end_hour,
            poll_interval_seconds: parsed("MODEL3D_POLL_INTERVAL_SECONDS", 5),
            max_poll_attempts: parsed("MODEL3D_MAX_POLL_ATTEMPTS", 60u32).max(1),
            drain_delay_seconds: parsed("MODEL3D_DRAIN_DELAY_SECONDS", 2),
            http_timeout_seconds: parsed("MODEL3D_HTTP_TIMEOUT_SECONDS", 30),
            download_idle_timeout_seconds: parsed("MODEL3D_DOWNLOAD_IDLE_TIMEOUT_SECONDS", 30u64)
                .max(1),
            retention_days: parsed("MODEL3D_RETENTION_DAYS", 7),
            expired_grace_days: parsed("MODEL3D_EXPIRED_GRACE_DAYS", 7),
            cleanup_interval_seconds: parsed("MODEL3D_CLEANUP_INTERVAL_SECONDS", 24 * 60 * 60),
            basic_tier_credits: parsed("MODEL3D_BASIC_TIER_CREDITS", 0),
            provider_endpoint: env::var("MODEL3D_PROVIDER_ENDPOINT")
                .unwrap_or_else(|_| "https://ai3d.tencentcloudapi.com".to_string()),
            provider_secret_id: env::var("MODEL3D_PROVIDER_SECRET_ID").unwrap_or_default(),
            provider_secret_key: env::var("MODEL3D_PROVIDER_SECRET_KEY").unwrap_or_default(),
            provider_region: env::var("MODEL3D_PROVIDER_REGION")
                .unwrap_or_else(|_| "ap-guangzhou".to_string()),
            provider_rate_limit_per_minute: parsed("MODEL3D_PROVIDER_RATE_LIMIT_PER_MINUTE", 120),
            provider_rate_limit_burst: parsed("MODEL3D_PROVIDER_RATE_LIMIT_BURST", 20),
            submit_rate_limit_per_minute: parsed("MODEL3D_SUBMIT_RATE_LIMIT_PER_MINUTE", 10),
            submit_rate_limit_burst: parsed("MODEL3D_SUBMIT_RATE_LIMIT_BURST", 5),
        })
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: self.max_concurrent,
            peak: PeakWindow {
                start_hour: self.peak_start_hour,
                end_hour: self.peak_end_hour,
            },
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            max_poll_attempts: self.max_poll_attempts,
            drain_delay: Duration::from_secs(self.drain_delay_seconds),
            retention: chrono::Duration::days(self.retention_days),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            endpoint: self.provider_endpoint.clone(),
            secret_id: self.provider_secret_id.clone(),
            secret_key: self.provider_secret_key.clone(),
            region: self.provider_region.clone(),
        }
    }

    pub fn credit_pricing(&self) -> CreditPricing {
        CreditPricing {
            basic: self.basic_tier_credits,
        }
    }

    /// Connect and per-read bounds for artifact downloads.
    pub fn download_timeouts(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.http_timeout_seconds),
            Duration::from_secs(self.download_idle_timeout_seconds),
        )
    }

    pub fn expired_grace(&self) -> chrono::Duration {
        chrono::Duration::days(self.expired_grace_days)
    }

    #[cfg(test)]
    pub fn for_tests(storage_root: &std::path::Path) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key: "test-key".to_string(),
            api_key_is_fallback: false,
            storage_root: storage_root.to_path_buf(),
            database_path: storage_root.join("model3d.sqlite3"),
            public_base_url: "/api/storage".to_string(),
            max_concurrent: 3,
            peak_start_hour: 9,
            peak_end_hour: 22,
            poll_interval_seconds: 5,
            max_poll_attempts: 60,
            drain_delay_seconds: 2,
            http_timeout_seconds: 5,
            download_idle_timeout_seconds: 5,
            retention_days: 7,
            expired_grace_days: 7,
            cleanup_interval_seconds: 0,
            basic_tier_credits: 0,
            provider_endpoint: "http://127.0.0.1:9".to_string(),
            provider_secret_id: String::new(),
            provider_secret_key: String::new(),
            provider_region: "ap-guangzhou".to_string(),
            provider_rate_limit_per_minute: 120,
            provider_rate_limit_burst: 20,
            submit_rate_limit_per_minute: 600,
            submit_rate_limit_burst: 100,
        }
    }
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("MODEL3D_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("MODEL3D_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[model3d-queue-api] MODEL3D_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[model3d-queue-api] Failed reading MODEL3D_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[model3d-queue-api] MODEL3D_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_settings_follow_config_values() {
        let mut config = Config::for_tests(std::path::Path::new("/tmp/model3d"));
        config.max_concurrent = 4;
        config.peak_start_hour = 20;
        config.peak_end_hour = 2;
        config.retention_days = 3;
        config.basic_tier_credits = 12;

        let settings = config.scheduler_settings();
        assert_eq!(settings.max_concurrent, 4);
        assert!(settings.peak.contains(1));
        assert_eq!(settings.retention, chrono::Duration::days(3));
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(config.credit_pricing().basic, 12);
        assert_eq!(
            config.download_timeouts(),
            (Duration::from_secs(5), Duration::from_secs(5))
        );
    }
}
