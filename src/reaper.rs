use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use crate::{
    artifact_store::{ArtifactStore, StorageArea},
    error::QueueResult,
    models::GenerationRecord,
    store::Store,
};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub expired: usize,
    pub failures: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub checked: usize,
    pub deleted: usize,
    pub failures: usize,
}

/// Retires completed generations once their retention deadline passes.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<Store>,
    artifacts: ArtifactStore,
}

impl Reaper {
    pub fn new(store: Arc<Store>, artifacts: ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    /// Deletes the files of every completed record past its deadline and
    /// marks it `expired`. One bad record never stops the sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> QueueResult<SweepReport> {
        let due = self.store.completed_records_expired_before(now).await?;
        let mut report = SweepReport {
            checked: due.len(),
            ..SweepReport::default()
        };

        for record in due {
            match self.expire(&record).await {
                Ok(freed) => {
                    report.expired += 1;
                    report.bytes_freed += freed;
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(record_uuid = %record.uuid, "Failed to expire generation: {err}");
                }
            }
        }

        info!(
            checked = report.checked,
            expired = report.expired,
            failures = report.failures,
            bytes_freed = report.bytes_freed,
            "Expiry sweep finished"
        );
        Ok(report)
    }

    async fn expire(&self, record: &GenerationRecord) -> QueueResult<u64> {
        let freed = self
            .artifacts
            .delete_all(&record.user_uuid, record.uuid)
            .await?;
        self.store.mark_record_expired(record.uuid).await?;
        Ok(freed)
    }

    /// Removes rows of records that have stayed `expired` for longer than
    /// `grace`, after making sure their files are gone.
    pub async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> QueueResult<PurgeReport> {
        let stale = self.store.expired_records_before(now - grace).await?;
        let mut report = PurgeReport {
            checked: stale.len(),
            ..PurgeReport::default()
        };

        for record in stale {
            let result = async {
                let dir = self
                    .artifacts
                    .record_dir(StorageArea::Models, &record.user_uuid, record.uuid)?;
                if tokio::fs::try_exists(&dir).await? {
                    warn!(record_uuid = %record.uuid, "Expired record still had files, removing");
                    self.artifacts
                        .delete_all(&record.user_uuid, record.uuid)
                        .await?;
                }
                self.store.delete_record(record.uuid).await
            }
            .await;

            match result {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    report.failures += 1;
                    warn!(record_uuid = %record.uuid, "Failed to purge expired generation: {err}");
                }
            }
        }

        info!(
            checked = report.checked,
            deleted = report.deleted,
            failures = report.failures,
            "Expired record purge finished"
        );
        Ok(report)
    }

    pub async fn expiring_soon(
        &self,
        now: DateTime<Utc>,
        within: chrono::Duration,
    ) -> QueueResult<Vec<GenerationRecord>> {
        self.store.records_expiring_between(now, now + within).await
    }

    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> QueueResult<(SweepReport, PurgeReport)> {
        let sweep = self.sweep_expired(now).await?;
        let purge = self.purge_expired(now, grace).await?;
        Ok((sweep, purge))
    }
}

pub fn spawn_cleanup_worker(reaper: Reaper, every: Duration, grace: chrono::Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            if let Err(err) = reaper.run_once(Utc::now(), grace).await {
                warn!("Cleanup worker error: {err}");
            }
        }
    });
}
