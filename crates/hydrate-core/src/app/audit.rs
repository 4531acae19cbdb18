//! Auditor - 監査ログへの書き込み口
//!
//! 監査の書き込み失敗ではジョブを失敗させません（status が正本）。
//! 失敗は warn で残します。

use std::sync::Arc;

use serde_json::json;

use crate::domain::{AuditEvent, AuditRecord, JobError};
use crate::ports::{AuditLog, Clock, IdGenerator, Transition};

#[derive(Clone)]
pub struct Auditor {
    log: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Auditor {
    pub fn new(log: Arc<dyn AuditLog>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { log, clock, ids }
    }

    pub async fn record(&self, record: AuditRecord) {
        let job_id = record.job_id;
        let event = record.event;
        let entry = record.stamp(self.ids.audit_id(), self.clock.now());
        if let Err(err) = self.log.append(entry).await {
            tracing::warn!(%job_id, event = event.as_str(), error = %err, "audit append failed");
        }
    }

    /// Record a status change that went through, with its before/after snapshot.
    pub async fn transition(&self, event: AuditEvent, transition: &Transition, meta: serde_json::Value) {
        self.record(
            AuditRecord::new(transition.job.id, event)
                .transition(Some(transition.prev), transition.job.status)
                .with_meta(meta),
        )
        .await;
    }

    /// FAILED entry for a job that was just moved to `failed`.
    pub async fn failed(&self, transition: &Transition, error: &JobError) {
        self.transition(
            AuditEvent::Failed,
            transition,
            json!({
                "code": error.code,
                "message": error.message,
                "retryable": error.is_retryable(),
                "attempts": transition.job.attempts,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, ErrorCode, Job, JobId, JobStatus, JobType};
    use crate::impls::InMemoryStore;
    use crate::ports::{SystemClock, UlidGenerator};
    use chrono::Utc;

    #[tokio::test]
    async fn failed_entries_carry_the_structured_error() {
        let store = Arc::new(InMemoryStore::new());
        let auditor = Auditor::new(
            store.clone(),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        );
        let mut job = Job::new_root(JobId::generate(), JobType::Notes, EntityId::generate(), 3, Utc::now());
        job.status = JobStatus::Failed;
        let transition = Transition {
            prev: JobStatus::Running,
            job: job.clone(),
        };

        auditor
            .failed(&transition, &JobError::new(ErrorCode::Timeout, "slow backend"))
            .await;

        let entries = store.entries_for(job.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, AuditEvent::Failed);
        assert_eq!(entries[0].prev_status, Some(JobStatus::Running));
        assert_eq!(entries[0].new_status, Some(JobStatus::Failed));
        assert_eq!(entries[0].meta["code"], "TIMEOUT");
        assert_eq!(entries[0].meta["retryable"], true);
    }
}
