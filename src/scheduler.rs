//! Admission and execution of generation jobs.
//!
//! Jobs wait in the durable queue and are started oldest first while the
//! in-flight set is below the effective ceiling (one lower during the peak
//! window). Each started job owns its record until it completes or fails;
//! a failed job refunds the credits it was charged exactly once.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::{ArtifactStore, StorageArea, StoredFile},
    clock::{Clock, PeakWindow},
    error::{QueueError, QueueResult},
    models::{
        GenerationRecord, Manifest, ManifestFile, OutputArtifact, QueueEntry, QueueStats,
        QueueStatus, RemoteJobState, ResultFile, Tier,
    },
    provider::{friendly_error, ModelProvider},
    store::Store,
};

pub const INTERRUPTED_MESSAGE: &str = "Generation was interrupted, please try again";
const ABORTED_MESSAGE: &str = "Generation failed, please try again";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub peak: PeakWindow,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub drain_delay: Duration,
    pub retention: chrono::Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            peak: PeakWindow::default(),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
            drain_delay: Duration::from_secs(2),
            retention: chrono::Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub ceiling: usize,
    pub peak: bool,
    pub waiting: u64,
    pub processing: u64,
    pub high_water: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    provider: Arc<dyn ModelProvider>,
    artifacts: ArtifactStore,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    in_flight: Mutex<HashSet<Uuid>>,
    high_water: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn ModelProvider>,
        artifacts: ArtifactStore,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                artifacts,
                clock,
                settings,
                in_flight: Mutex::new(HashSet::new()),
                high_water: AtomicUsize::new(0),
            }),
        }
    }

    fn is_peak(&self) -> bool {
        self.inner.settings.peak.contains(self.inner.clock.local_hour())
    }

    fn ceiling(&self) -> usize {
        self.inner
            .settings
            .peak
            .effective_ceiling(self.inner.settings.max_concurrent, self.inner.clock.local_hour())
    }

    /// Persists a `waiting` entry for the record and starts whatever fits.
    /// Returns once the entry is stored; the job itself runs in the background.
    pub async fn enqueue(&self, record_uuid: Uuid, tier: Tier) -> QueueResult<QueueEntry> {
        let record = self
            .inner
            .store
            .get_record(record_uuid)
            .await?
            .ok_or(QueueError::RecordNotFound(record_uuid))?;

        let peak = self.is_peak();
        let estimated_seconds = tier.estimated_seconds(peak);
        let entry = self
            .inner
            .store
            .insert_queue_entry(
                record_uuid,
                &record.user_uuid,
                tier,
                peak,
                estimated_seconds,
                self.inner.clock.now(),
            )
            .await?;
        info!(
            record_uuid = %record_uuid,
            tier = tier.as_str(),
            peak,
            estimated_seconds,
            "Generation job queued"
        );

        if let Err(err) = self.drain().await {
            warn!(record_uuid = %record_uuid, "Queue drain after enqueue failed: {err}");
        }
        Ok(entry)
    }

    /// Starts waiting jobs until the in-flight set reaches the ceiling.
    /// The in-flight lock is held for the whole pass so concurrent passes
    /// cannot book the same slot twice.
    pub fn drain(&self) -> Pin<Box<dyn Future<Output = QueueResult<usize>> + Send + '_>> {
        Box::pin(async move {
            let mut in_flight = self.inner.in_flight.lock().await;
            let ceiling = self.ceiling();
            if in_flight.len() >= ceiling {
                return Ok(0);
            }

            // Started jobs stay `waiting` until their task marks them, so the
            // fetch covers the in-flight ones too and they are skipped below.
            let candidates = self.inner.store.waiting_entries(ceiling).await?;

            let mut started = 0;
            for entry in candidates {
                if in_flight.len() >= ceiling {
                    break;
                }
                if !in_flight.insert(entry.record_uuid) {
                    continue;
                }
                self.inner
                    .high_water
                    .fetch_max(in_flight.len(), Ordering::SeqCst);
                self.spawn_job(entry);
                started += 1;
            }
            if started > 0 {
                debug!(started, in_flight = in_flight.len(), ceiling, "Queue drained");
            }
            Ok(started)
        })
    }

    /// Runs the job in its own task and supervises it: an error or panic that
    /// escapes the job still ends in the failure path.
    fn spawn_job(&self, entry: QueueEntry) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let record_uuid = entry.record_uuid;
            let job = tokio::spawn({
                let scheduler = scheduler.clone();
                let entry = entry.clone();
                async move { scheduler.process(entry).await }
            });

            match job.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(record_uuid = %record_uuid, "Generation job aborted: {err}");
                    scheduler.fail_job(&entry, &err.user_message()).await;
                }
                Err(join_err) => {
                    error!(record_uuid = %record_uuid, "Generation job panicked: {join_err}");
                    scheduler.fail_job(&entry, ABORTED_MESSAGE).await;
                }
            }

            scheduler.finish(record_uuid).await;
        });
    }

    async fn finish(&self, record_uuid: Uuid) {
        self.inner.in_flight.lock().await.remove(&record_uuid);
        tokio::time::sleep(self.inner.settings.drain_delay).await;
        if let Err(err) = self.drain().await {
            warn!(record_uuid = %record_uuid, "Queue drain after job failed: {err}");
        }
    }

    async fn process(&self, entry: QueueEntry) -> QueueResult<()> {
        let store = &self.inner.store;
        let started_at = self.inner.clock.now();
        store
            .mark_entry_processing(entry.record_uuid, started_at)
            .await?;
        store
            .mark_record_processing(entry.record_uuid, started_at)
            .await?;
        let record = store
            .get_record(entry.record_uuid)
            .await?
            .ok_or(QueueError::RecordNotFound(entry.record_uuid))?;
        info!(record_uuid = %entry.record_uuid, tier = entry.tier.as_str(), "Generation job started");

        match self.execute(&entry, &record).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    record_uuid = %entry.record_uuid,
                    code = err.code(),
                    "Generation job failed: {err}"
                );
                self.fail_job(&entry, &err.user_message()).await;
                Ok(())
            }
        }
    }

    async fn execute(&self, entry: &QueueEntry, record: &GenerationRecord) -> QueueResult<()> {
        // The queue entry decides the tier, whatever the stored params say.
        let params = record.params.clone().with_tier(entry.tier);
        let submitted = self.inner.provider.submit(&params).await?;
        self.inner
            .store
            .set_cloud_job_id(record.uuid, &submitted.job_id)
            .await?;

        let files = self.poll(record.uuid, &submitted.job_id, entry.tier).await?;
        self.complete(entry, record, files).await
    }

    /// Queries the provider once per tick, at most `max_poll_attempts` times.
    async fn poll(&self, record_uuid: Uuid, job_id: &str, tier: Tier) -> QueueResult<Vec<ResultFile>> {
        let attempts = self.inner.settings.max_poll_attempts;
        let mut last_failed = false;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.inner.settings.poll_interval).await;
            match self.inner.provider.query_status(job_id, tier).await {
                Ok(status) => {
                    last_failed = false;
                    match status.state {
                        RemoteJobState::Done => return Ok(status.result_files),
                        RemoteJobState::Fail => {
                            let code = status.error_code.unwrap_or_default();
                            let message = status
                                .error_message
                                .unwrap_or_else(|| friendly_error(&code).to_string());
                            return Err(QueueError::Provider { code, message });
                        }
                        RemoteJobState::Wait | RemoteJobState::Run => {
                            debug!(record_uuid = %record_uuid, attempt, state = ?status.state, "Job still running");
                        }
                    }
                }
                Err(err) => {
                    last_failed = true;
                    warn!(record_uuid = %record_uuid, attempt, "Status query failed, retrying: {err}");
                }
            }
        }

        if last_failed {
            Err(QueueError::StatusQueryFailed)
        } else {
            Err(QueueError::PollTimeout { attempts })
        }
    }

    async fn complete(
        &self,
        entry: &QueueEntry,
        record: &GenerationRecord,
        files: Vec<ResultFile>,
    ) -> QueueResult<()> {
        if files.is_empty() {
            return Err(QueueError::Provider {
                code: "EmptyResult".to_string(),
                message: friendly_error("EmptyResult").to_string(),
            });
        }

        let artifacts = &self.inner.artifacts;
        let user = record.user_uuid.as_str();
        let mut stored: Vec<(ResultFile, StoredFile)> = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            match artifacts
                .download_file(&file.url, user, record.uuid, &file.file_type, index)
                .await
            {
                Ok(local) => stored.push((file, local)),
                Err(err) => {
                    if let Err(cleanup) = artifacts.delete_all(user, record.uuid).await {
                        warn!(record_uuid = %record.uuid, "Failed to remove partial artifacts: {cleanup}");
                    }
                    return Err(err);
                }
            }
        }

        let mut preview: Option<StoredFile> = None;
        for (file, _) in &stored {
            if let Some(url) = &file.preview_image_url {
                preview = artifacts.download_preview(url, user, record.uuid).await;
                if preview.is_some() {
                    break;
                }
            }
        }
        let preview_url = preview.as_ref().map(|p| {
            artifacts.public_url(StorageArea::Models, user, record.uuid, &p.file_name)
        });

        let outputs: Vec<OutputArtifact> = stored
            .iter()
            .map(|(file, local)| OutputArtifact {
                file_type: file.file_type.clone(),
                url: artifacts.public_url(StorageArea::Models, user, record.uuid, &local.file_name),
                file_name: local.file_name.clone(),
                preview_image_url: preview_url.clone(),
                size_bytes: local.size_bytes,
            })
            .collect();

        let completed_at = self.inner.clock.now();
        let expires_at = completed_at + self.inner.settings.retention;
        let manifest = Manifest {
            record_uuid: record.uuid,
            user_uuid: record.user_uuid.clone(),
            tier: entry.tier,
            prompt: record.prompt.clone(),
            files: outputs
                .iter()
                .map(|o| ManifestFile {
                    file_type: o.file_type.clone(),
                    file_name: o.file_name.clone(),
                    size_bytes: o.size_bytes,
                    preview_file_name: preview.as_ref().map(|p| p.file_name.clone()),
                })
                .collect(),
            total_size_bytes: outputs.iter().map(|o| o.size_bytes).sum(),
            created_at: record.created_at,
            expires_at,
        };
        artifacts.save_manifest(user, record.uuid, &manifest).await;

        self.inner
            .store
            .mark_record_completed(record.uuid, &outputs, completed_at, expires_at)
            .await?;
        self.inner
            .store
            .mark_entry_finished(record.uuid, QueueStatus::Completed, completed_at)
            .await?;
        info!(
            record_uuid = %record.uuid,
            files = outputs.len(),
            total_size_bytes = manifest.total_size_bytes,
            expires_at = %expires_at,
            "Generation job completed"
        );
        Ok(())
    }

    /// Marks the record and its entry failed and refunds the charge. Every
    /// step is attempted even if an earlier one fails.
    async fn fail_job(&self, entry: &QueueEntry, message: &str) {
        let store = &self.inner.store;
        let record_uuid = entry.record_uuid;
        let at = self.inner.clock.now();

        if let Err(err) = store.mark_record_failed(record_uuid, message, at).await {
            error!(record_uuid = %record_uuid, "Failed to mark record failed: {err}");
        }
        if let Err(err) = store
            .mark_entry_finished(record_uuid, QueueStatus::Failed, at)
            .await
        {
            error!(record_uuid = %record_uuid, "Failed to mark queue entry failed: {err}");
        }

        let record = match store.get_record(record_uuid).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                self.report_refund_failure(record_uuid, None, err.to_string());
                return;
            }
        };
        if record.credits_used <= 0 {
            return;
        }
        match store
            .refund(&record.user_uuid, record.credits_used, record_uuid)
            .await
        {
            Ok(true) => info!(
                record_uuid = %record_uuid,
                user_uuid = %record.user_uuid,
                amount = record.credits_used,
                "Credits refunded for failed generation"
            ),
            Ok(false) => warn!(record_uuid = %record_uuid, "Refund already issued"),
            Err(err) => {
                self.report_refund_failure(record_uuid, Some(record.credits_used), err.to_string())
            }
        }
    }

    fn report_refund_failure(&self, record_uuid: Uuid, amount: Option<i64>, reason: String) {
        let err = QueueError::RefundFailed {
            record_uuid,
            amount: amount.unwrap_or_default(),
            reason,
        };
        error!(alert = "refund_failed", record_uuid = %record_uuid, "{err}");
    }

    pub async fn get_status(&self, record_uuid: Uuid) -> QueueResult<QueueStats> {
        let store = &self.inner.store;
        let entry = store
            .get_queue_entry(record_uuid)
            .await?
            .ok_or(QueueError::QueueEntryNotFound(record_uuid))?;
        let total_in_queue = store.count_waiting().await?;

        let finished = |message: &str| QueueStats {
            position: 0,
            total_in_queue,
            estimated_wait_seconds: 0,
            message: message.to_string(),
        };
        match entry.status {
            QueueStatus::Processing => Ok(finished("processing, please wait.")),
            QueueStatus::Completed => Ok(finished("done.")),
            QueueStatus::Failed => Ok(finished("failed.")),
            QueueStatus::Waiting => {
                let position = store.count_waiting_before(&entry).await? + 1;
                let per_job = entry.tier.estimated_seconds(self.is_peak());
                let ceiling = self.ceiling() as u64;
                let estimated_wait_seconds = (position * per_job).div_ceil(ceiling);
                Ok(QueueStats {
                    position,
                    total_in_queue,
                    estimated_wait_seconds,
                    message: format!("queued at position {position} of {total_in_queue}."),
                })
            }
        }
    }

    pub async fn stats(&self) -> QueueResult<SchedulerStats> {
        let in_flight = self.inner.in_flight.lock().await.len();
        Ok(SchedulerStats {
            in_flight,
            ceiling: self.ceiling(),
            peak: self.is_peak(),
            waiting: self.inner.store.count_waiting().await?,
            processing: self.inner.store.count_processing().await?,
            high_water: self.inner.high_water.load(Ordering::SeqCst),
        })
    }

    /// Fails and refunds jobs a previous process left `processing`, then
    /// starts the waiting queue. Call once at startup.
    pub async fn resume_pending(&self) -> QueueResult<usize> {
        let stranded = self
            .inner
            .store
            .entries_with_status(QueueStatus::Processing)
            .await?;
        for entry in &stranded {
            warn!(record_uuid = %entry.record_uuid, "Failing job interrupted by restart");
            self.fail_job(entry, INTERRUPTED_MESSAGE).await;
        }
        self.drain().await?;
        Ok(stranded.len())
    }
}
