//! Persistence queue.
//!
//! Three structures in the cache store: a pending list (FIFO — enqueue
//! pushes the tail, dequeue pops the head), a processing hash keyed by job
//! id, and a dead-letter list for jobs that exhausted their retries. The
//! dead-letter list is pushed at the head so the newest failures list first.
//!
//! Dequeue is a pop followed by a processing-hash write, not an atomic
//! move. A worker crash between the two orphans the job; that is accepted
//! because the client retries persistence on its next save and the content
//! cache short-circuits a re-enqueue when state already matches.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::cache::SharedCache;
use crate::documents::DocumentUpdates;
use crate::epoch_ms;
use crate::ids::{DocumentId, JobId, PrincipalId};

pub const PENDING_KEY: &str = "document-updates";
pub const PROCESSING_KEY: &str = "processing-jobs";
pub const FAILED_KEY: &str = "failed-jobs";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdatePayload {
    pub document_id: DocumentId,
    pub principal_id: PrincipalId,
    pub updates: DocumentUpdates,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Work carried by a job, tagged the way it travels on the wire:
/// `{"type": "document-update", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    DocumentUpdate(DocumentUpdatePayload),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::DocumentUpdate(_) => "document-update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub job_id: JobId,
    #[serde(flatten)]
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-enqueued for another attempt after the backoff delay.
    Retried { attempts: u32 },
    /// Out of attempts (or permanently rejected); parked in the DLQ.
    DeadLettered,
}

fn generate_job_id() -> JobId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    JobId::new(format!("job_{}_{}", epoch_ms(), suffix.to_lowercase()))
}

#[derive(Clone)]
pub struct PersistenceQueue {
    store: SharedCache,
    max_attempts: u32,
    backoff: Duration,
}

impl PersistenceQueue {
    pub fn new(store: SharedCache, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            store,
            max_attempts,
            backoff,
        }
    }

    /// Append a new job to the pending tail; returns its generated id.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobId> {
        let job = QueueJob {
            job_id: generate_job_id(),
            payload,
            attempts: 0,
            max_attempts: self.max_attempts,
            backoff_ms: self.backoff.as_millis() as u64,
            created_at: epoch_ms(),
            scheduled_for: None,
            processing_started_at: None,
            last_error: None,
            failed_at: None,
        };
        self.push_pending(&job).await?;
        debug!(job_id = %job.job_id, kind = job.payload.kind(), "job enqueued");
        Ok(job.job_id)
    }

    /// Pop one job off the pending head and record it as processing.
    pub async fn dequeue(&self) -> Result<Option<QueueJob>> {
        let Some(raw) = self.store.lpop(PENDING_KEY).await? else {
            return Ok(None);
        };
        let mut job: QueueJob = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(error) => {
                warn!(%error, "discarding undecodable pending job");
                return Ok(None);
            }
        };

        job.processing_started_at = Some(epoch_ms());
        let snapshot = serde_json::to_string(&job).context("serialize processing job")?;
        self.store
            .hset(PROCESSING_KEY, job.job_id.as_str(), &snapshot)
            .await?;
        Ok(Some(job))
    }

    /// Successful completion clears the processing record.
    pub async fn complete(&self, job_id: &JobId) -> Result<()> {
        self.store.hdel(PROCESSING_KEY, job_id.as_str()).await?;
        Ok(())
    }

    /// Record a failure. Retryable failures with attempts to spare are
    /// pushed back onto the pending tail once the backoff delay elapses;
    /// everything else goes to the dead-letter list.
    pub async fn fail(
        &self,
        mut job: QueueJob,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        self.store.hdel(PROCESSING_KEY, job.job_id.as_str()).await?;
        job.attempts += 1;
        job.processing_started_at = None;
        job.last_error = Some(error.to_owned());

        if retryable && job.attempts < job.max_attempts {
            let delay = Duration::from_millis(job.backoff_ms);
            job.scheduled_for = Some(epoch_ms() + job.backoff_ms as i64);
            info!(
                job_id = %job.job_id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = job.backoff_ms,
                error,
                "job failed; retrying after backoff"
            );
            let attempts = job.attempts;
            let store = self.store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match serde_json::to_string(&job) {
                    Ok(raw) => {
                        if let Err(error) = store.rpush(PENDING_KEY, &raw).await {
                            warn!(job_id = %job.job_id, %error, "failed to re-enqueue job");
                        }
                    }
                    Err(error) => {
                        warn!(job_id = %job.job_id, %error, "failed to serialize retry job");
                    }
                }
            });
            return Ok(FailureOutcome::Retried { attempts });
        }

        job.failed_at = Some(epoch_ms());
        warn!(
            job_id = %job.job_id,
            attempts = job.attempts,
            retryable,
            error,
            "job dead-lettered"
        );
        let raw = serde_json::to_string(&job).context("serialize dead-letter job")?;
        self.store.lpush(FAILED_KEY, &raw).await?;
        Ok(FailureOutcome::DeadLettered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.store.llen(PENDING_KEY).await?,
            processing: self.store.hlen(PROCESSING_KEY).await?,
            failed: self.store.llen(FAILED_KEY).await?,
        })
    }

    /// Most recent dead-lettered jobs, newest first.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<QueueJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(FAILED_KEY, 0, limit as i64 - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(job) => Some(job),
                Err(error) => {
                    warn!(%error, "skipping undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    /// Move a dead-lettered job back to pending with a clean slate.
    /// Returns false when no such job is parked in the DLQ.
    pub async fn retry_failed_job(&self, job_id: &JobId) -> Result<bool> {
        let entries = self.store.lrange(FAILED_KEY, 0, -1).await?;
        for raw in entries {
            let Ok(mut job) = serde_json::from_str::<QueueJob>(&raw) else {
                continue;
            };
            if job.job_id != *job_id {
                continue;
            }

            self.store.lrem(FAILED_KEY, &raw).await?;
            job.attempts = 0;
            job.scheduled_for = None;
            job.last_error = None;
            job.failed_at = None;
            self.push_pending(&job).await?;
            info!(job_id = %job_id, "dead-lettered job requeued");
            return Ok(true);
        }
        Ok(false)
    }

    /// Administrative reset of all three structures.
    pub async fn clear_all(&self) -> Result<()> {
        self.store.del(PENDING_KEY).await?;
        self.store.del(PROCESSING_KEY).await?;
        self.store.del(FAILED_KEY).await?;
        Ok(())
    }

    async fn push_pending(&self, job: &QueueJob) -> Result<()> {
        let raw = serde_json::to_string(job).context("serialize pending job")?;
        self.store.rpush(PENDING_KEY, &raw).await?;
        Ok(())
    }
}
