//! ReaperLoop - 取りこぼしの回収
//!
//! 1. stale claim: 成果物なしで `locked_at` が古い running ジョブを pending に戻す
//!    （attempts を使い切っていれば TIMEOUT で失敗）
//! 2. 配送漏れ: 生きた配送意図のない pending ジョブに outbox を積み直す
//! 3. 自動再投入: retryable なコードで失敗し attempts が残っているジョブ

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;

use crate::domain::{ErrorCode, Job, JobError, JobStatus, OutboxEntry};
use crate::ports::{Clock, IdGenerator, JobStore, StoreError};

use super::audit::Auditor;
use super::delivery::Delivery;
use super::kill_switch::KillSwitch;
use super::submitter::{SubmitError, Submitter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale claims put back to pending.
    pub released: usize,
    /// Stale claims failed because no attempts were left.
    pub exhausted: usize,
    /// Pending jobs given a fresh delivery intent.
    pub redelivered: usize,
    /// Failed jobs resubmitted for another attempt.
    pub resubmitted: usize,
}

#[derive(Clone)]
pub struct ReaperLoop {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) audit: Auditor,
    pub(crate) delivery: Delivery,
    pub(crate) submitter: Submitter,
    pub(crate) kill_switch: Arc<KillSwitch>,
    pub(crate) queue_name: String,
    pub(crate) stale_claim_after: Duration,
    pub(crate) requeue_after: Duration,
    pub(crate) interval: Duration,
}

impl ReaperLoop {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("reaper started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.reap_once().await {
                Ok(report) if report != ReapReport::default() => {
                    tracing::info!(?report, "reaper pass");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "reaper pass failed"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("reaper stopped");
    }

    pub async fn reap_once(&self) -> Result<ReapReport, StoreError> {
        let now = self.clock.now();
        let mut report = ReapReport::default();
        self.reap_stale_claims(now, &mut report).await?;
        self.redeliver_pending(now, &mut report).await?;
        self.resubmit_failed(&mut report).await?;
        Ok(report)
    }

    async fn reap_stale_claims(
        &self,
        now: DateTime<Utc>,
        report: &mut ReapReport,
    ) -> Result<(), StoreError> {
        let cutoff = cutoff(now, self.stale_claim_after);
        for job in self.jobs.jobs_by_status(JobStatus::Running).await? {
            // content_ready の root は reconciler 待ちで、放置されているわけではない
            if job.content_ready || job.locked_at.is_none_or(|at| at > cutoff) {
                continue;
            }

            if job.attempts >= job.max_attempts {
                let error = JobError::new(
                    ErrorCode::Timeout,
                    format!("claim expired after {} of {} attempts", job.attempts, job.max_attempts),
                );
                if let Some(failed) = self
                    .jobs
                    .fail_job(job.id, &error, &[JobStatus::Running], now)
                    .await?
                {
                    self.audit.failed(&failed, &error).await;
                    tracing::warn!(job_id = %job.id, attempts = job.attempts, "stale claim with no attempts left; failed");
                    report.exhausted += 1;
                }
                continue;
            }

            let outbox = self.outbox(&job, "stale_claim", now);
            if let Some(released) = self
                .jobs
                .requeue(job.id, JobStatus::Running, outbox.clone(), now)
                .await?
            {
                tracing::warn!(job_id = %job.id, locked_at = ?job.locked_at, attempts = released.job.attempts, "stale claim released");
                // ENQUEUED / ENQUEUE_FAILED に running → pending の遷移が残る
                self.delivery.deliver(&outbox, Some(released.prev)).await?;
                report.released += 1;
            }
        }
        Ok(())
    }

    async fn redeliver_pending(
        &self,
        now: DateTime<Utc>,
        report: &mut ReapReport,
    ) -> Result<(), StoreError> {
        let cutoff = cutoff(now, self.requeue_after);
        for job in self.jobs.jobs_by_status(JobStatus::Pending).await? {
            let outbox = self.jobs.outbox_for_job(job.id).await?;
            if outbox.iter().any(|e| !e.is_delivered()) {
                continue;
            }
            let last_intent = outbox
                .iter()
                .map(|e| e.delivered_at.unwrap_or(e.created_at))
                .max()
                .unwrap_or(job.created_at);
            if last_intent > cutoff {
                continue;
            }
            // 止まっている間は積み直さない。解除後の次のパスで拾う
            if self.kill_switch.is_disabled(job.job_type).await {
                continue;
            }

            let entry = self.outbox(&job, "redelivery", now);
            if self
                .jobs
                .requeue(job.id, JobStatus::Pending, entry.clone(), now)
                .await?
                .is_some()
            {
                tracing::info!(job_id = %job.id, last_intent = %last_intent, "pending job redelivered");
                self.delivery.deliver(&entry, None).await?;
                report.redelivered += 1;
            }
        }
        Ok(())
    }

    async fn resubmit_failed(&self, report: &mut ReapReport) -> Result<(), StoreError> {
        for job in self.jobs.jobs_by_status(JobStatus::Failed).await? {
            if !job.awaits_retry() {
                continue;
            }
            // root が終わっていれば子を再投入しても結果に反映されない
            if !job.is_root()
                && let Some(root) = self.jobs.get_job(job.root_id).await?
                && root.status.is_terminal()
            {
                tracing::debug!(job_id = %job.id, root_id = %job.root_id, root_status = %root.status, "root already settled; not resubmitting");
                continue;
            }
            match self.submitter.retry(job.id).await {
                Ok(_) => report.resubmitted += 1,
                Err(SubmitError::Disabled(_)) | Err(SubmitError::InvalidState { .. }) => {}
                Err(SubmitError::Store(err)) => return Err(err),
                Err(err) => tracing::warn!(job_id = %job.id, error = %err, "automatic resubmission failed"),
            }
        }
        Ok(())
    }

    fn outbox(&self, job: &Job, reason: &str, now: DateTime<Utc>) -> OutboxEntry {
        OutboxEntry::for_job(
            self.ids.outbox_id(),
            &self.queue_name,
            job.id,
            json!({ "jobId": job.id, "jobType": job.job_type, "reason": reason }),
            now,
        )
    }
}

/// `now - age`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::kill_switch::GLOBAL_KEY;
    use crate::app::submitter::SubmitRequest;
    use crate::domain::{EntityType, JobId, JobType};
    use crate::ports::DeliveryQueue;
    use crate::testing::Harness;

    async fn claimed_notes_job(h: &Harness, max_attempts: u32) -> JobId {
        let topic = h.seed_topic("Photosynthesis").await;
        let job_id = h
            .app
            .submitter()
            .submit(
                SubmitRequest::new(JobType::Notes, EntityType::Topic, topic)
                    .with_language("en")
                    .with_max_attempts(max_attempts),
            )
            .await
            .unwrap()
            .job_id;
        h.store.claim(job_id, h.clock.now()).await.unwrap().unwrap();
        job_id
    }

    #[tokio::test]
    async fn stale_claims_go_back_to_pending_with_a_new_delivery() {
        let h = Harness::new().await;
        let job_id = claimed_notes_job(&h, 3).await;
        let reaper = h.app.reaper();

        assert_eq!(reaper.reap_once().await.unwrap(), ReapReport::default());

        h.clock.advance(chrono::Duration::minutes(11));
        let report = reaper.reap_once().await.unwrap();
        assert_eq!(report.released, 1);

        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.locked_at.is_none());
        assert_eq!(h.store.outbox_for_job(job_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_claims_without_attempts_left_fail() {
        let h = Harness::new().await;
        let job_id = claimed_notes_job(&h, 1).await;

        h.clock.advance(chrono::Duration::minutes(11));
        let report = h.app.reaper().reap_once().await.unwrap();
        assert_eq!(report.exhausted, 1);

        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().starts_with("TIMEOUT::"));
    }

    #[tokio::test]
    async fn pending_jobs_without_a_live_intent_are_redelivered_after_the_switch_clears() {
        let h = Harness::new().await;
        let topic = h.seed_topic("Photosynthesis").await;
        let job_id = h
            .app
            .submitter()
            .submit(SubmitRequest::new(JobType::Notes, EntityType::Topic, topic).with_language("en"))
            .await
            .unwrap()
            .job_id;
        // 配送済みのメッセージが消えた状況
        h.queue.pop("hydration", Duration::from_millis(10)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(3));

        h.store.set_setting(GLOBAL_KEY, "true").await;
        assert_eq!(h.app.reaper().reap_once().await.unwrap().redelivered, 0);

        h.store.remove_setting(GLOBAL_KEY).await;
        assert_eq!(h.app.reaper().reap_once().await.unwrap().redelivered, 1);
        assert_eq!(h.queue.len("hydration"), 1);
        assert_eq!(h.store.outbox_for_job(job_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn only_retryable_failures_are_resubmitted() {
        let h = Harness::new().await;
        let transient = claimed_notes_job(&h, 3).await;
        let now = h.clock.now();
        h.store
            .fail_job(transient, &JobError::new(ErrorCode::Transport, "reset"), &[JobStatus::Running], now)
            .await
            .unwrap();

        let topic = h.seed_topic("Respiration").await;
        let invalid = h
            .app
            .submitter()
            .submit(SubmitRequest::new(JobType::Notes, EntityType::Topic, topic).with_language("en"))
            .await
            .unwrap()
            .job_id;
        h.store.claim(invalid, now).await.unwrap();
        h.store
            .fail_job(invalid, &JobError::new(ErrorCode::PlaceholderContent, "tbd"), &[JobStatus::Running], now)
            .await
            .unwrap();

        let report = h.app.reaper().reap_once().await.unwrap();
        assert_eq!(report.resubmitted, 1);
        assert_eq!(
            h.store.get_job(transient).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            h.store.get_job(invalid).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn children_of_a_settled_root_are_not_resubmitted() {
        let h = Harness::new().await;
        let root = h.running_root(2).await;
        let topics = h.reconcile_until_level(&root, 2).await;
        let child = topics[0].id;
        let now = h.clock.now();
        h.store.claim(child, now).await.unwrap();
        h.store
            .fail_job(child, &JobError::new(ErrorCode::Transport, "reset"), &[JobStatus::Running], now)
            .await
            .unwrap();
        h.app.submitter().cancel(root.id).await.unwrap();

        let report = h.app.reaper().reap_once().await.unwrap();
        assert_eq!(report.resubmitted, 0);
        assert_eq!(
            h.store.get_job(child).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }
}
