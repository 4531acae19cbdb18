//! Delivery - outbox エントリ 1 件を配送し、結果を outbox・job・監査に反映する
//!
//! Submitter の同期配送、PublisherLoop の drain、ReaperLoop の再配送が共有します。

use std::sync::Arc;

use serde_json::json;

use crate::domain::{AuditEvent, AuditRecord, ErrorCode, JobError, JobStatus, OutboxEntry};
use crate::ports::{Clock, DispatchError, Dispatcher, JobStore, StoreError};

use super::audit::Auditor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Queue outage; the entry stays undelivered for the publisher.
    Deferred(String),
    /// Routing can never succeed; the job was failed.
    Unresolvable(String),
}

#[derive(Clone)]
pub struct Delivery {
    jobs: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    audit: Auditor,
}

impl Delivery {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        audit: Auditor,
    ) -> Self {
        Self {
            jobs,
            dispatcher,
            clock,
            audit,
        }
    }

    /// Dispatch `entry`. `prev` is the status the job left to become pending,
    /// when this delivery follows a requeue.
    pub async fn deliver(
        &self,
        entry: &OutboxEntry,
        prev: Option<JobStatus>,
    ) -> Result<DeliveryOutcome, StoreError> {
        let base = |event| {
            let record = AuditRecord::new(entry.job_id, event);
            match prev {
                Some(prev) => record.transition(Some(prev), JobStatus::Pending),
                None => record,
            }
        };

        match self.dispatcher.dispatch(entry).await {
            Ok(()) => {
                self.jobs.mark_delivered(entry.id, self.clock.now()).await?;
                self.audit
                    .record(base(AuditEvent::Enqueued).with_meta(json!({
                        "outboxId": entry.id,
                        "queue": entry.queue,
                    })))
                    .await;
                tracing::debug!(job_id = %entry.job_id, outbox_id = %entry.id, "delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Err(DispatchError::Transient(reason)) => {
                self.jobs.record_delivery_failure(entry.id, &reason).await?;
                self.audit
                    .record(base(AuditEvent::EnqueueFailed).with_meta(json!({
                        "outboxId": entry.id,
                        "error": reason,
                        "retryable": true,
                    })))
                    .await;
                tracing::warn!(job_id = %entry.job_id, outbox_id = %entry.id, %reason, "delivery deferred");
                Ok(DeliveryOutcome::Deferred(reason))
            }
            Err(DispatchError::Unresolvable(reason)) => {
                let now = self.clock.now();
                self.jobs.record_delivery_failure(entry.id, &reason).await?;
                // 何度やっても届かないので outbox からは外す
                self.jobs.mark_delivered(entry.id, now).await?;
                self.audit
                    .record(base(AuditEvent::EnqueueFailed).with_meta(json!({
                        "outboxId": entry.id,
                        "error": reason,
                        "retryable": false,
                    })))
                    .await;

                let error = JobError::new(ErrorCode::EnqueueUnresolvable, reason.clone());
                if let Some(failed) = self
                    .jobs
                    .fail_job(entry.job_id, &error, &[JobStatus::Pending], now)
                    .await?
                {
                    self.audit.failed(&failed, &error).await;
                }
                tracing::error!(job_id = %entry.job_id, outbox_id = %entry.id, %reason, "delivery unresolvable; job failed");
                Ok(DeliveryOutcome::Unresolvable(reason))
            }
        }
    }
}
