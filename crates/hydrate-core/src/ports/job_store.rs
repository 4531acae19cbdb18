//! JobStore port - ジョブ・outbox・reconciliation lock の正本（source of truth）
//!
//! # 設計原則
//! - 1 メソッド = 1 トランザクション。複数行にまたがる書き込み
//!   （job + outbox、成果物 + 完了、requeue + outbox）は実装側で原子的に行う
//! - 状態遷移はすべて `WHERE status = expected` 相当の条件付き更新
//! - 条件を満たさなかった遷移はエラーではなく `None` / `Skipped` で返す

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    ContentWrite, Job, JobError, JobId, JobStatus, LevelSummary, OutboxEntry, OutboxId, Progress,
};

/// Errors surfaced by store implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("outbox entry {0} not found")]
    OutboxNotFound(OutboxId),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Serialization conflicts and connection loss are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

/// How `create_job` detects an existing job for the same work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedupe {
    /// Reuse a pending/running job with the same (job type, entity type, entity id).
    ActiveTarget,
    /// Reuse any job under the same root at the same level, entity and difficulty.
    CascadeSlot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub job: Job,
    /// `true` when an existing job was returned and nothing was written.
    pub existing: bool,
}

/// A conditional status change that went through.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub prev: JobStatus,
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Output persisted and the job is completed.
    Completed(Transition),
    /// Output persisted; cascade root stays running for the reconciler.
    ContentReady(Job),
    /// The job left `running` (cancelled, reaped) before commit; nothing written.
    Skipped { status: JobStatus },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    // ── jobs ────────────────────────────────────────────────────────────

    /// Insert `job` and `outbox` together unless `dedupe` finds an existing job.
    async fn create_job(
        &self,
        job: Job,
        outbox: OutboxEntry,
        dedupe: Dedupe,
    ) -> Result<CreateOutcome, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// pending → running, `attempts + 1`, `locked_at = now`. `None` if not pending.
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// running → pending, undoing the claim's attempt increment.
    async fn release_claim(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Persist `output` (if any) and complete the job in one step, guarded on
    /// `running`. Cascade roots are left running with `content_ready` set.
    async fn commit_output(
        &self,
        id: JobId,
        output: Option<ContentWrite>,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Move to `failed` with `last_error`, only from one of `from`.
    async fn fail_job(
        &self,
        id: JobId,
        error: &JobError,
        from: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError>;

    /// Any non-terminal status → cancelled.
    async fn cancel_job(&self, id: JobId, now: DateTime<Utc>)
    -> Result<Option<Transition>, StoreError>;

    /// Cancel every non-terminal job under `root_id` except the root itself.
    async fn cancel_descendants(
        &self,
        root_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transition>, StoreError>;

    /// Move a job that is still in `from` back to pending and append `outbox`.
    /// Clears `locked_at`; a failed job also loses `completed_at`.
    async fn requeue(
        &self,
        id: JobId,
        from: JobStatus,
        outbox: OutboxEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError>;

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    // ── cascade ─────────────────────────────────────────────────────────

    /// Root jobs (`root_id == id`) currently `running`.
    async fn running_roots(&self) -> Result<Vec<Job>, StoreError>;

    /// Jobs under `root_id` at `level` (level 1 is the root itself).
    async fn jobs_at_level(&self, root_id: JobId, level: u8) -> Result<Vec<Job>, StoreError>;

    async fn level_summary(&self, root_id: JobId, level: u8) -> Result<LevelSummary, StoreError> {
        let jobs = self.jobs_at_level(root_id, level).await?;
        Ok(LevelSummary::from_jobs(level, &jobs))
    }

    /// Failed or cancelled jobs under `root_id`, excluding the root and
    /// failures still awaiting resubmission.
    async fn failed_descendants(&self, root_id: JobId) -> Result<u32, StoreError>;

    async fn update_progress(&self, root_id: JobId, progress: Progress) -> Result<(), StoreError>;

    /// running → `status` (completed or failed) for a root. No-op when already terminal.
    async fn finalize_root(
        &self,
        root_id: JobId,
        status: JobStatus,
        error: Option<&JobError>,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, StoreError>;

    // ── outbox ──────────────────────────────────────────────────────────

    /// Undelivered entries, oldest first.
    async fn undelivered_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn outbox_for_job(&self, job_id: JobId) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_delivered(&self, id: OutboxId, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn record_delivery_failure(&self, id: OutboxId, error: &str) -> Result<(), StoreError>;

    // ── reconciliation lock ─────────────────────────────────────────────

    /// Insert-or-fail on the named lock. A lock held longer than `ttl` is taken over.
    async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete the lock if `holder` still owns it.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}
