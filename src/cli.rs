use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use crate::{
    artifact_store::{download_client, ArtifactStore},
    config::Config,
    reaper::Reaper,
    store::Store,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CleanupArgs {
    grace_days: Option<i64>,
    report_within_days: Option<i64>,
}

/// Handles `cleanup [--grace-days N] [--report-within-days N]`, one reaper
/// pass for cron. Returns `false` when the process should start the server.
pub async fn maybe_run_from_cli(args: &[String]) -> Result<bool> {
    if args.len() < 2 || args[1] != "cleanup" {
        return Ok(false);
    }

    let parsed = parse_args(args).context("Invalid cleanup arguments")?;
    let config = Config::from_env().context("Failed to load config")?;
    let store = Arc::new(
        Store::open(&config.database_path)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
    );
    let (connect_timeout, idle_timeout) = config.download_timeouts();
    let http = download_client(connect_timeout, idle_timeout)?;
    let artifacts = ArtifactStore::new(&config.storage_root, &config.public_base_url, http);
    let reaper = Reaper::new(store, artifacts);

    let now = Utc::now();
    let grace = parsed
        .grace_days
        .map(chrono::Duration::days)
        .unwrap_or_else(|| config.expired_grace());
    let (sweep, purge) = reaper.run_once(now, grace).await?;

    let expiring = match parsed.report_within_days {
        Some(days) => reaper
            .expiring_soon(now, chrono::Duration::days(days))
            .await?
            .into_iter()
            .map(|r| json!({ "uuid": r.uuid, "userUuid": r.user_uuid, "expiresAt": r.expires_at }))
            .collect(),
        None => Vec::new(),
    };

    let result = json!({
        "sweep": sweep,
        "purge": purge,
        "graceDays": grace.num_days(),
        "expiringSoon": expiring,
    });
    println!("{}", serde_json::to_string(&result)?);
    Ok(true)
}

fn parse_args(args: &[String]) -> Result<CleanupArgs> {
    let mut grace_days = None;
    let mut report_within_days = None;

    let mut i = 2usize;
    while i < args.len() {
        let key = args[i].as_str();
        let val = args.get(i + 1).cloned();
        match (key, val) {
            ("--grace-days", Some(v)) => {
                grace_days = Some(parse_days(&v).context("--grace-days")?);
                i += 2;
            }
            ("--report-within-days", Some(v)) => {
                report_within_days = Some(parse_days(&v).context("--report-within-days")?);
                i += 2;
            }
            _ => {
                anyhow::bail!("Unknown or incomplete argument near `{}`", key);
            }
        }
    }

    Ok(CleanupArgs {
        grace_days,
        report_within_days,
    })
}

fn parse_days(raw: &str) -> Result<i64> {
    let days: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("`{raw}` is not a number of days"))?;
    if days < 0 {
        anyhow::bail!("day count must not be negative");
    }
    Ok(days)
}
