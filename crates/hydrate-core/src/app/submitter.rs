//! Submitter - root / ad-hoc ジョブの受付
//!
//! submit の流れ:
//! 1. (job type, entity type) の静的な対応表で検証（ストアに触る前）
//! 2. kill switch
//! 3. 対象 entity の解決（名前・祖先は観測用に outbox meta へ非正規化）
//! 4. job + outbox を 1 トランザクションで作成（pending/running の重複は既存を返す）
//! 5. best-effort の同期配送。失敗しても outbox が残る
//!
//! retry / cancel もここに置きます。

use std::sync::Arc;

use serde_json::{Value, json};

use crate::config::HydrationConfig;
use crate::domain::{
    AuditEvent, AuditRecord, Difficulty, EntityContext, EntityId, EntityType, Job, JobId,
    JobStatus, JobType, OutboxEntry,
};
use crate::ports::{Clock, ContentStore, Dedupe, IdGenerator, JobStore, StoreError};
use crate::retry::retry_with_backoff;

use super::audit::Auditor;
use super::delivery::{Delivery, DeliveryOutcome};
use super::kill_switch::KillSwitch;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job type {job_type} targets {expected} entities, not {actual}")]
    IncompatibleEntity {
        job_type: JobType,
        expected: EntityType,
        actual: EntityType,
    },

    #[error("{0} jobs require a language")]
    MissingLanguage(JobType),

    #[error("{0} jobs require a difficulty")]
    MissingDifficulty(JobType),

    #[error("{0} jobs do not take a difficulty")]
    UnexpectedDifficulty(JobType),

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("hydration of {0} jobs is disabled")]
    Disabled(JobType),

    #[error("{entity_type} {entity_id} not found")]
    EntityNotFound {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {job_id} is {status}; cannot {action}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("job {job_id} used all {max_attempts} attempts")]
    AttemptsExhausted { job_id: JobId, max_attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    /// Input problems the caller must fix; retrying the same request cannot help.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SubmitError::IncompatibleEntity { .. }
                | SubmitError::MissingLanguage(_)
                | SubmitError::MissingDifficulty(_)
                | SubmitError::UnexpectedDifficulty(_)
                | SubmitError::InvalidMaxAttempts
                | SubmitError::EntityNotFound { .. }
        )
    }
}

/// Arguments of `Submitter::submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub language: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub payload: Value,
    /// Falls back to `HydrationConfig::default_max_attempts`.
    pub max_attempts: Option<u32>,
}

impl SubmitRequest {
    pub fn new(job_type: JobType, entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            job_type,
            entity_type,
            entity_id,
            language: None,
            difficulty: None,
            payload: Value::Object(Default::default()),
            max_attempts: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    /// A pending/running job for the same target already existed.
    pub existing: bool,
    /// Status right after submission; `failed` when delivery was unresolvable.
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub job_id: JobId,
    pub prev: JobStatus,
    /// Descendants cancelled along with a root.
    pub descendants: usize,
}

#[derive(Clone)]
pub struct Submitter {
    jobs: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    audit: Auditor,
    delivery: Delivery,
    kill_switch: Arc<KillSwitch>,
    config: HydrationConfig,
}

impl Submitter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        jobs: Arc<dyn JobStore>,
        content: Arc<dyn ContentStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        audit: Auditor,
        delivery: Delivery,
        kill_switch: Arc<KillSwitch>,
        config: HydrationConfig,
    ) -> Self {
        Self {
            jobs,
            content,
            ids,
            clock,
            audit,
            delivery,
            kill_switch,
            config,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        let job_type = request.job_type;
        validate(&request)?;

        if self.kill_switch.is_disabled(job_type).await {
            tracing::info!(%job_type, entity_id = %request.entity_id, "submission rejected by kill switch");
            return Err(SubmitError::Disabled(job_type));
        }

        let entity = self
            .content
            .entity_context(request.entity_type, request.entity_id)
            .await?
            .ok_or(SubmitError::EntityNotFound {
                entity_type: request.entity_type,
                entity_id: request.entity_id,
            })?;

        let now = self.clock.now();
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        let job = Job::new_root(
            self.ids.job_id(),
            job_type,
            request.entity_id,
            max_attempts,
            now,
        )
        .with_language(request.language.clone())
        .with_difficulty(request.difficulty)
        .with_payload(request.payload.clone());
        let outbox = OutboxEntry::for_job(
            self.ids.outbox_id(),
            &self.config.queue_name,
            job.id,
            outbox_meta(&job, &entity),
            now,
        );

        let created = retry_with_backoff(&self.config.store_retry, StoreError::is_transient, || {
            self.jobs
                .create_job(job.clone(), outbox.clone(), Dedupe::ActiveTarget)
        })
        .await?;
        if created.existing {
            tracing::info!(job_id = %created.job.id, %job_type, entity_id = %request.entity_id, "reusing active job");
            return Ok(Submission {
                job_id: created.job.id,
                existing: true,
                status: created.job.status,
            });
        }

        self.audit
            .record(
                AuditRecord::new(job.id, AuditEvent::Created)
                    .transition(None, JobStatus::Pending)
                    .with_meta(json!({
                        "jobType": job_type,
                        "entity": entity.breadcrumb(),
                        "language": job.language,
                        "difficulty": job.difficulty,
                        "maxAttempts": max_attempts,
                    })),
            )
            .await;
        tracing::info!(job_id = %job.id, %job_type, entity = %entity.breadcrumb(), "job submitted");

        let status = self.deliver(&outbox, None).await;
        Ok(Submission {
            job_id: job.id,
            existing: false,
            status,
        })
    }

    /// Resubmit a failed job that still has attempts left.
    pub async fn retry(&self, job_id: JobId) -> Result<Submission, SubmitError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(SubmitError::JobNotFound(job_id))?;
        if job.status != JobStatus::Failed {
            return Err(SubmitError::InvalidState {
                job_id,
                status: job.status,
                action: "retry",
            });
        }
        if !job.can_retry() {
            return Err(SubmitError::AttemptsExhausted {
                job_id,
                max_attempts: job.max_attempts,
            });
        }
        if self.kill_switch.is_disabled(job.job_type).await {
            return Err(SubmitError::Disabled(job.job_type));
        }

        let now = self.clock.now();
        let outbox = OutboxEntry::for_job(
            self.ids.outbox_id(),
            &self.config.queue_name,
            job_id,
            json!({
                "jobId": job_id,
                "jobType": job.job_type,
                "retryOf": job.last_error,
            }),
            now,
        );
        let requeued = retry_with_backoff(&self.config.store_retry, StoreError::is_transient, || {
            self.jobs
                .requeue(job_id, JobStatus::Failed, outbox.clone(), now)
        })
        .await?;
        let Some(requeued) = requeued else {
            // 他の経路が先に再投入した
            let status = self
                .jobs
                .get_job(job_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(JobStatus::Failed);
            return Err(SubmitError::InvalidState {
                job_id,
                status,
                action: "retry",
            });
        };
        tracing::info!(%job_id, attempts = requeued.job.attempts, max_attempts = requeued.job.max_attempts, "job resubmitted");

        let status = self.deliver(&outbox, Some(requeued.prev)).await;
        Ok(Submission {
            job_id,
            existing: false,
            status,
        })
    }

    /// Cancel a non-terminal job. A root takes its non-terminal descendants with it.
    ///
    /// Running handlers are not interrupted; their commit is skipped.
    pub async fn cancel(&self, job_id: JobId) -> Result<Cancellation, SubmitError> {
        let now = self.clock.now();
        let Some(cancelled) = self.jobs.cancel_job(job_id, now).await? else {
            let job = self
                .jobs
                .get_job(job_id)
                .await?
                .ok_or(SubmitError::JobNotFound(job_id))?;
            return Err(SubmitError::InvalidState {
                job_id,
                status: job.status,
                action: "cancel",
            });
        };
        self.audit
            .transition(AuditEvent::Cancelled, &cancelled, json!({ "reason": "operator" }))
            .await;

        let mut descendants = 0;
        if cancelled.job.is_root() {
            for child in self.jobs.cancel_descendants(job_id, now).await? {
                self.audit
                    .transition(
                        AuditEvent::Cancelled,
                        &child,
                        json!({ "reason": "root cancelled", "rootJobId": job_id }),
                    )
                    .await;
                descendants += 1;
            }
        }
        tracing::info!(%job_id, prev = %cancelled.prev, descendants, "job cancelled");

        Ok(Cancellation {
            job_id,
            prev: cancelled.prev,
            descendants,
        })
    }

    /// Best-effort synchronous delivery; the outbox row is the fallback.
    async fn deliver(&self, outbox: &OutboxEntry, prev: Option<JobStatus>) -> JobStatus {
        match self.delivery.deliver(outbox, prev).await {
            Ok(DeliveryOutcome::Unresolvable(_)) => JobStatus::Failed,
            Ok(_) => JobStatus::Pending,
            Err(err) => {
                tracing::warn!(job_id = %outbox.job_id, error = %err, "synchronous delivery failed; left to the publisher");
                JobStatus::Pending
            }
        }
    }
}

fn validate(request: &SubmitRequest) -> Result<(), SubmitError> {
    let job_type = request.job_type;
    let expected = job_type.entity_type();
    if request.entity_type != expected {
        return Err(SubmitError::IncompatibleEntity {
            job_type,
            expected,
            actual: request.entity_type,
        });
    }
    if request.max_attempts == Some(0) {
        return Err(SubmitError::InvalidMaxAttempts);
    }
    let has_language = request
        .language
        .as_deref()
        .is_some_and(|l| !l.trim().is_empty());
    if job_type.requires_language() && !has_language {
        return Err(SubmitError::MissingLanguage(job_type));
    }
    match (job_type.requires_difficulty(), request.difficulty) {
        (true, None) => Err(SubmitError::MissingDifficulty(job_type)),
        (false, Some(_)) => Err(SubmitError::UnexpectedDifficulty(job_type)),
        _ => Ok(()),
    }
}

/// Routing hints and entity context denormalized into the outbox row.
pub(crate) fn outbox_meta(job: &Job, entity: &EntityContext) -> Value {
    json!({
        "jobId": job.id,
        "rootJobId": job.root_id,
        "jobType": job.job_type,
        "entityType": job.entity_type,
        "entityId": job.entity_id,
        "entityName": entity.name,
        "breadcrumb": entity.breadcrumb(),
    })
}
