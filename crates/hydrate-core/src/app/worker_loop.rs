//! WorkerLoop - 配送キューからジョブを受け取り実行するループ
//!
//! # フロー
//! 1. DeliveryQueue::pop() でメッセージ取得（`jobId` または旧形式 `legacyJobId`）
//! 2. JobStore::claim() で pending → running（取れなければ何もしない）
//! 3. kill switch を再確認。止まっていれば pending に戻す
//! 4. job type の Handler を実行（生成 → 検証 → 成果物と完了を同時に commit）
//! 5. 成果物が実際にあるかを短い backoff 付きで再確認し、なければ失敗に変える
//!
//! 失敗はすべて `last_error` と FAILED 監査の両方に残します。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use crate::domain::{
    AuditEvent, AuditRecord, DeliveryMessage, ErrorCode, Job, JobError, JobId, JobStatus,
};
use crate::ports::{
    Clock, CommitOutcome, ContentStore, DeliveryQueue, Generator, IdGenerator, JobStore,
    StoreError,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::typed::handler::store_failure;
use crate::typed::{DynHandler, HandlerContext, TypedRegistry};

use super::audit::Auditor;
use super::kill_switch::KillSwitch;
use super::legacy_adapter::LegacyAdapter;

/// What one message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Nothing arrived within the poll timeout.
    Idle,
    /// Message could not be used; it is dropped.
    Dropped(String),
    /// Already claimed elsewhere, no longer pending, or unknown.
    NotClaimed(JobId),
    /// Kill switch was on; the job went back to pending.
    Deferred(JobId),
    Completed { job_id: JobId, reused: bool },
    /// Cascade root output persisted; the reconciler takes it from here.
    ContentReady(JobId),
    /// The job left `running` while the handler worked; nothing was committed.
    Skipped { job_id: JobId, status: JobStatus },
    Failed { job_id: JobId, error: JobError },
    /// Legacy reference translated into a canonical job (delivered separately).
    Translated { legacy_id: String, job_id: JobId },
}

#[derive(Clone)]
pub struct WorkerLoop {
    pub(crate) worker_id: usize,
    pub(crate) queue_name: String,
    pub(crate) poll_timeout: Duration,
    pub(crate) generation_timeout: Duration,
    pub(crate) store_retry: RetryPolicy,
    pub(crate) evidence_retry: RetryPolicy,
    pub(crate) queue: Arc<dyn DeliveryQueue>,
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) audit: Auditor,
    pub(crate) registry: Arc<TypedRegistry>,
    pub(crate) kill_switch: Arc<KillSwitch>,
    pub(crate) legacy: Option<LegacyAdapter>,
}

/// Evidence check result that is worth retrying.
enum Evidence {
    Missing,
    Unreadable(StoreError),
}

impl WorkerLoop {
    /// Run until `shutdown` flips to true. An in-flight job always finishes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.worker_id, queue = %self.queue_name, "worker started");
        loop {
            // pop は poll_timeout で必ず戻るので、停止判定はループ先頭だけで足りる
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.run_once().await {
                Ok(WorkOutcome::Idle) => {}
                Ok(outcome) => tracing::debug!(worker = self.worker_id, ?outcome, "message handled"),
                Err(err) => {
                    tracing::error!(worker = self.worker_id, error = %err, "worker iteration failed");
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }
        tracing::info!(worker = self.worker_id, "worker stopped");
    }

    /// Pop at most one message and handle it.
    pub async fn run_once(&self) -> Result<WorkOutcome, StoreError> {
        let message = self
            .queue
            .pop(&self.queue_name, self.poll_timeout)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match message {
            None => Ok(WorkOutcome::Idle),
            Some(message) => self.handle_message(message).await,
        }
    }

    pub async fn handle_message(&self, message: serde_json::Value) -> Result<WorkOutcome, StoreError> {
        let message: DeliveryMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(worker = self.worker_id, error = %err, "dropping unreadable message");
                return Ok(WorkOutcome::Dropped(err.to_string()));
            }
        };
        match message {
            DeliveryMessage::Job { job_id } => self.process(job_id).await,
            DeliveryMessage::Legacy { legacy_job_id } => {
                let Some(adapter) = &self.legacy else {
                    tracing::warn!(worker = self.worker_id, %legacy_job_id, "legacy message without a legacy source");
                    return Ok(WorkOutcome::Dropped(format!(
                        "no legacy source for {legacy_job_id}"
                    )));
                };
                match adapter.translate(&legacy_job_id).await {
                    Ok(submission) => Ok(WorkOutcome::Translated {
                        legacy_id: legacy_job_id,
                        job_id: submission.job_id,
                    }),
                    Err(err) => {
                        tracing::warn!(worker = self.worker_id, %legacy_job_id, error = %err, "legacy translation failed");
                        Ok(WorkOutcome::Dropped(err.to_string()))
                    }
                }
            }
        }
    }

    /// Claim and execute one job.
    pub async fn process(&self, job_id: JobId) -> Result<WorkOutcome, StoreError> {
        let now = self.clock.now();
        let claimed = retry_with_backoff(&self.store_retry, StoreError::is_transient, || {
            self.jobs.claim(job_id, now)
        })
        .await;
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(worker = self.worker_id, %job_id, "not claimable; skipping");
                return Ok(WorkOutcome::NotClaimed(job_id));
            }
            Err(StoreError::JobNotFound(_)) => {
                tracing::warn!(worker = self.worker_id, %job_id, "delivered job does not exist");
                return Ok(WorkOutcome::NotClaimed(job_id));
            }
            Err(err) => return Err(err),
        };

        if self.kill_switch.is_disabled(job.job_type).await {
            self.jobs.release_claim(job_id).await?;
            tracing::info!(worker = self.worker_id, %job_id, job_type = %job.job_type, "kill switch on; job returned to pending");
            return Ok(WorkOutcome::Deferred(job_id));
        }

        self.audit
            .record(
                AuditRecord::new(job_id, AuditEvent::Started)
                    .transition(Some(JobStatus::Pending), JobStatus::Running)
                    .with_meta(json!({ "attempt": job.attempts, "worker": self.worker_id })),
            )
            .await;
        tracing::info!(worker = self.worker_id, %job_id, job = %job.label(), attempt = job.attempts, "job started");

        let Some(handler) = self.registry.get(job.job_type) else {
            let error = JobError::new(
                ErrorCode::UnknownJobType,
                format!("no handler registered for {}", job.job_type),
            );
            return self.fail(&job, error, &[JobStatus::Running]).await;
        };

        let cx = HandlerContext {
            jobs: &*self.jobs,
            content: &*self.content,
            generator: &*self.generator,
            ids: &*self.ids,
            clock: &*self.clock,
            audit: &self.audit,
            generation_timeout: self.generation_timeout,
            store_retry: &self.store_retry,
        };
        let outcome = match handler.run(&job, &cx).await {
            Ok(outcome) => outcome,
            Err(error) => return self.fail(&job, error, &[JobStatus::Running]).await,
        };

        match outcome.commit {
            CommitOutcome::Completed(transition) => {
                if let Err(error) = self.verify(&job, handler.as_ref()).await {
                    return self.fail(&job, error, &[JobStatus::Completed]).await;
                }
                self.audit
                    .transition(
                        AuditEvent::Completed,
                        &transition,
                        json!({ "reused": outcome.reused, "output": outcome.meta }),
                    )
                    .await;
                tracing::info!(worker = self.worker_id, %job_id, reused = outcome.reused, "job completed");
                Ok(WorkOutcome::Completed {
                    job_id,
                    reused: outcome.reused,
                })
            }
            CommitOutcome::ContentReady(_) => {
                if let Err(error) = self.verify(&job, handler.as_ref()).await {
                    return self.fail(&job, error, &[JobStatus::Running]).await;
                }
                tracing::info!(worker = self.worker_id, %job_id, "root output persisted; awaiting cascade");
                Ok(WorkOutcome::ContentReady(job_id))
            }
            CommitOutcome::Skipped { status } => {
                self.audit
                    .record(
                        AuditRecord::new(job_id, AuditEvent::CompletionSkipped)
                            .with_meta(json!({ "status": status })),
                    )
                    .await;
                tracing::info!(worker = self.worker_id, %job_id, %status, "job left running before commit; output discarded");
                Ok(WorkOutcome::Skipped { job_id, status })
            }
        }
    }

    /// Re-read the domain output with a short backoff for read-after-write lag.
    async fn verify(&self, job: &Job, handler: &dyn DynHandler) -> Result<(), JobError> {
        let content = &*self.content;
        let checked = retry_with_backoff(&self.evidence_retry, |_: &Evidence| true, || async move {
            match handler.verify(job, content).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(Evidence::Missing),
                Err(err) => Err(Evidence::Unreadable(err)),
            }
        })
        .await;
        match checked {
            Ok(()) => Ok(()),
            Err(Evidence::Missing) => Err(JobError::new(
                ErrorCode::NoEvidence,
                format!("handler reported success but no output exists for {}", job.label()),
            )),
            Err(Evidence::Unreadable(err)) => Err(store_failure(err)),
        }
    }

    async fn fail(
        &self,
        job: &Job,
        error: JobError,
        from: &[JobStatus],
    ) -> Result<WorkOutcome, StoreError> {
        let now = self.clock.now();
        let failed = retry_with_backoff(&self.store_retry, StoreError::is_transient, || {
            self.jobs.fail_job(job.id, &error, from, now)
        })
        .await?;
        match failed {
            Some(transition) => {
                self.audit.failed(&transition, &error).await;
                tracing::warn!(
                    worker = self.worker_id,
                    job_id = %job.id,
                    code = %error.code,
                    retryable = error.is_retryable(),
                    error = %error.message,
                    "job failed"
                );
                Ok(WorkOutcome::Failed {
                    job_id: job.id,
                    error,
                })
            }
            None => {
                let status = self
                    .jobs
                    .get_job(job.id)
                    .await?
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Cancelled);
                self.audit
                    .record(
                        AuditRecord::new(job.id, AuditEvent::CompletionSkipped).with_meta(json!({
                            "status": status,
                            "discardedError": error.to_string(),
                        })),
                    )
                    .await;
                tracing::info!(worker = self.worker_id, job_id = %job.id, %status, "failure not recorded; job already left running");
                Ok(WorkOutcome::Skipped {
                    job_id: job.id,
                    status,
                })
            }
        }
    }
}
