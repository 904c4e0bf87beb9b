//! Queue worker.
//!
//! One worker task per process, ticking once a second. Each tick drains at
//! most one job; several processes may run workers concurrently because the
//! pending-list pop is atomic in the cache store. A job gets a soft timeout
//! from the moment it leaves the queue; overrunning it counts as a
//! retryable failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use cowrite_core::content::ContentCache;
use cowrite_core::documents::{DocumentGateway, EditHistoryEntry, GatewayError};
use cowrite_core::epoch_ms;
use cowrite_core::queue::{DocumentUpdatePayload, JobPayload, PersistenceQueue, QueueJob};

pub struct QueueWorker {
    queue: PersistenceQueue,
    documents: Arc<dyn DocumentGateway>,
    content: ContentCache,
    tick: Duration,
    job_timeout: Duration,
}

/// Controls a started worker; `stop` lets the in-flight job finish (or hit
/// its timeout) before the task exits.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            warn!(%error, "worker task ended abnormally");
        }
    }
}

struct JobFailure {
    message: String,
    retryable: bool,
}

impl JobFailure {
    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl QueueWorker {
    pub fn new(
        queue: PersistenceQueue,
        documents: Arc<dyn DocumentGateway>,
        content: ContentCache,
        tick: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            documents,
            content,
            tick,
            job_timeout,
        }
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(tick_ms = self.tick.as_millis() as u64, "queue worker started");
            let mut ticker = interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        // The tick body runs to completion before shutdown
                        // is observed: the in-flight job drains.
                        self.tick_once().await;
                    }
                }
            }
            info!("queue worker stopped");
        });
        WorkerHandle { shutdown, task }
    }

    async fn tick_once(&self) {
        let job = match self.queue.dequeue().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "failed to dequeue job");
                return;
            }
        };
        self.process(job).await;
    }

    async fn process(&self, job: QueueJob) {
        let job_id = job.job_id.clone();
        let outcome = timeout(self.job_timeout, self.handle(&job)).await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(error) = self.queue.complete(&job_id).await {
                    warn!(job_id = %job_id, %error, "failed to mark job complete");
                }
                debug!(job_id = %job_id, "job completed");
            }
            Ok(Err(failure)) => {
                if let Err(error) = self
                    .queue
                    .fail(job, &failure.message, failure.retryable)
                    .await
                {
                    warn!(job_id = %job_id, %error, "failed to record job failure");
                }
            }
            Err(_elapsed) => {
                let message = format!(
                    "job exceeded its {} ms timeout",
                    self.job_timeout.as_millis()
                );
                if let Err(error) = self.queue.fail(job, &message, true).await {
                    warn!(job_id = %job_id, %error, "failed to record job timeout");
                }
            }
        }
    }

    async fn handle(&self, job: &QueueJob) -> Result<(), JobFailure> {
        match &job.payload {
            JobPayload::DocumentUpdate(payload) => self.handle_document_update(payload).await,
        }
    }

    async fn handle_document_update(
        &self,
        payload: &DocumentUpdatePayload,
    ) -> Result<(), JobFailure> {
        let record = self
            .documents
            .update_document(
                &payload.principal_id,
                &payload.document_id,
                &payload.updates,
            )
            .await
            .map_err(|error| match error {
                GatewayError::NotFound => JobFailure::permanent("document not found"),
                GatewayError::PermissionDenied => JobFailure::permanent("permission denied"),
                GatewayError::Transient(inner) => {
                    JobFailure::retryable(format!("gateway failure: {inner}"))
                }
            })?;

        // The cache refresh and the history append are both best-effort:
        // the durable write already happened.
        if let Err(error) = self
            .content
            .put(&payload.document_id, &record.body, &record.title)
            .await
        {
            warn!(
                document_id = %payload.document_id,
                %error,
                "content cache refresh failed after persistence"
            );
        }

        let history = EditHistoryEntry {
            document_id: payload.document_id.clone(),
            principal_id: payload.principal_id.clone(),
            operation: "update".to_owned(),
            version: epoch_ms(),
        };
        if let Err(error) = self.documents.append_edit_history(&history).await {
            warn!(
                document_id = %payload.document_id,
                %error,
                "edit history append failed"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::cache::{MemoryCache, SharedCache};
    use cowrite_core::documents::{DocumentUpdates, MemoryDocumentGateway};
    use cowrite_core::ids::{DocumentId, PrincipalId};
    use serde_json::json;

    struct Fixture {
        queue: PersistenceQueue,
        content: ContentCache,
        documents: Arc<MemoryDocumentGateway>,
        worker: Option<QueueWorker>,
    }

    fn fixture(backoff: Duration) -> Fixture {
        let cache: SharedCache = Arc::new(MemoryCache::new());
        let queue = PersistenceQueue::new(cache.clone(), 3, backoff);
        let content = ContentCache::new(cache, Duration::from_secs(3600));
        let documents = Arc::new(MemoryDocumentGateway::new());
        let worker = QueueWorker::new(
            queue.clone(),
            documents.clone(),
            content.clone(),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        Fixture {
            queue,
            content,
            documents,
            worker: Some(worker),
        }
    }

    fn payload(document_id: &str, body: &str) -> JobPayload {
        JobPayload::DocumentUpdate(DocumentUpdatePayload {
            document_id: DocumentId::from(document_id),
            principal_id: PrincipalId::from("alice"),
            updates: DocumentUpdates {
                title: None,
                body: Some(body.to_owned()),
            },
            metadata: json!({}),
        })
    }

    async fn wait_for_stats(
        queue: &PersistenceQueue,
        check: impl Fn(cowrite_core::queue::QueueStats) -> bool,
    ) {
        for _ in 0..200 {
            if check(queue.stats().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue stats condition not met within deadline");
    }

    async fn wait_for_body(documents: &MemoryDocumentGateway, document_id: &str, body: &str) {
        for _ in 0..200 {
            let matches = documents
                .get_document(&PrincipalId::from("alice"), &DocumentId::from(document_id))
                .await
                .map(|record| record.body == body)
                .unwrap_or(false);
            if matches {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("document body condition not met within deadline");
    }

    #[tokio::test]
    async fn successful_job_persists_and_refreshes_the_cache() {
        let mut fx = fixture(Duration::from_millis(10));
        fx.documents.insert_document("d1", "Title", "old");
        fx.queue.enqueue(payload("d1", "new body")).await.unwrap();

        let handle = fx.worker.take().unwrap().start();
        wait_for_body(&fx.documents, "d1", "new body").await;
        wait_for_stats(&fx.queue, |stats| {
            stats.pending == 0 && stats.processing == 0
        })
        .await;
        handle.stop().await;

        let snapshot = fx.content.get(&DocumentId::from("d1")).await.unwrap();
        assert_eq!(snapshot.body, "new body");
        assert_eq!(snapshot.title, "Title");

        let history = fx.documents.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, "update");
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_dead_letter_queue() {
        let mut fx = fixture(Duration::from_millis(10));
        fx.documents.insert_document("d1", "Title", "old");
        // More failures than attempts: every retry fails too.
        fx.documents.fail_next_updates(10);
        fx.queue.enqueue(payload("d1", "new body")).await.unwrap();

        let handle = fx.worker.take().unwrap().start();
        wait_for_stats(&fx.queue, |stats| stats.failed == 1).await;
        handle.stop().await;

        let failed = fx.queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert!(failed[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("gateway failure"));

        // The write never landed.
        let record = fx
            .documents
            .get_document(&PrincipalId::from("alice"), &DocumentId::from("d1"))
            .await
            .unwrap();
        assert_eq!(record.body, "old");
    }

    #[tokio::test]
    async fn transient_failure_then_success_completes_on_retry() {
        let mut fx = fixture(Duration::from_millis(10));
        fx.documents.insert_document("d1", "Title", "old");
        fx.documents.fail_next_updates(1);
        fx.queue.enqueue(payload("d1", "new body")).await.unwrap();

        let handle = fx.worker.take().unwrap().start();
        wait_for_body(&fx.documents, "d1", "new body").await;
        handle.stop().await;

        assert_eq!(fx.queue.stats().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn missing_document_dead_letters_without_retry() {
        let mut fx = fixture(Duration::from_millis(200));
        fx.queue.enqueue(payload("ghost", "body")).await.unwrap();

        let handle = fx.worker.take().unwrap().start();
        wait_for_stats(&fx.queue, |stats| stats.failed == 1).await;
        handle.stop().await;

        let failed = fx.queue.failed_jobs(10).await.unwrap();
        // A single attempt: not-found is not worth retrying.
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("document not found"));
    }

    #[tokio::test]
    async fn dead_lettered_job_can_be_requeued_and_succeed() {
        let mut fx = fixture(Duration::from_millis(10));
        fx.documents.insert_document("d1", "Title", "old");
        fx.documents.fail_next_updates(10);
        fx.queue.enqueue(payload("d1", "new body")).await.unwrap();

        let handle = fx.worker.take().unwrap().start();
        wait_for_stats(&fx.queue, |stats| stats.failed == 1).await;

        let failed = fx.queue.failed_jobs(1).await.unwrap();
        fx.documents.fail_next_updates(0);
        assert!(fx.queue.retry_failed_job(&failed[0].job_id).await.unwrap());

        wait_for_body(&fx.documents, "d1", "new body").await;
        handle.stop().await;
    }
}
