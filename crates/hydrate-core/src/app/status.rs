//! Status - ジョブの状態照会
//!
//! 1 つのジョブについて「いまどこにいて、なぜそうなったか」を返します。
//! cascade root なら level ごとの集計も付けます。

use std::sync::Arc;

use serde::Serialize;

use crate::domain::{
    AuditEntry, DEEPEST_LEVEL, ErrorCode, Job, JobError, JobId, LevelSummary, ROOT_LEVEL,
};
use crate::ports::{AuditLog, JobStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl From<JobError> for ErrorSummary {
    fn from(error: JobError) -> Self {
        Self {
            retryable: error.is_retryable(),
            code: error.code,
            message: error.message,
        }
    }
}

/// StatusReport は 1 ジョブのスナップショット
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub job: Job,
    pub error: Option<ErrorSummary>,
    /// Per-level histograms; empty unless the job is a cascade root.
    pub levels: Vec<LevelSummary>,
    pub trail: Vec<AuditEntry>,
}

impl StatusReport {
    /// Levels that exist but are not resolved yet.
    pub fn open_levels(&self) -> impl Iterator<Item = &LevelSummary> {
        self.levels.iter().filter(|l| l.total() > 0 && !l.is_resolved())
    }
}

#[derive(Clone)]
pub struct StatusService {
    pub(crate) jobs: Arc<dyn JobStore>,
    pub(crate) audit_log: Arc<dyn AuditLog>,
}

impl StatusService {
    /// `None` when the job does not exist.
    pub async fn report(&self, job_id: JobId) -> Result<Option<StatusReport>, StoreError> {
        let Some(job) = self.jobs.get_job(job_id).await? else {
            return Ok(None);
        };

        let mut levels = Vec::new();
        if job.is_cascade_root() {
            for level in ROOT_LEVEL..=DEEPEST_LEVEL {
                levels.push(self.jobs.level_summary(job.id, level).await?);
            }
        }
        let trail = self.audit_log.entries_for(job.id).await?;
        let error = job
            .last_error
            .as_deref()
            .map(|raw| ErrorSummary::from(JobError::parse(raw)));

        Ok(Some(StatusReport {
            job,
            error,
            levels,
            trail,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::submitter::SubmitRequest;
    use crate::domain::{AuditEvent, EntityType, JobStatus, JobType};
    use crate::impls::StubReply;
    use crate::ports::GenerationError;
    use crate::testing::Harness;

    #[tokio::test]
    async fn unknown_job_has_no_report() {
        let h = Harness::new().await;
        assert!(h.app.status().report(JobId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_reports_its_parsed_error_and_trail() {
        let h = Harness::new().await;
        let topic = h.seed_topic("Photosynthesis").await;
        h.generator.set_reply(
            JobType::Notes,
            StubReply::Fail(GenerationError::Transport("connection reset".into())),
        );
        let job_id = h
            .app
            .submitter()
            .submit(SubmitRequest::new(JobType::Notes, EntityType::Topic, topic).with_language("en"))
            .await
            .unwrap()
            .job_id;
        h.app.worker(0).run_once().await.unwrap();

        let report = h.app.status().report(job_id).await.unwrap().unwrap();
        assert_eq!(report.job.status, JobStatus::Failed);
        let error = report.error.clone().unwrap();
        assert_eq!(error.code, ErrorCode::Transport);
        assert!(error.retryable);
        assert!(report.levels.is_empty());
        assert_eq!(report.trail.first().map(|e| e.event), Some(AuditEvent::Created));
        assert_eq!(report.trail.last().map(|e| e.event), Some(AuditEvent::Failed));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"]["code"], "TRANSPORT");
    }

    #[tokio::test]
    async fn cascade_root_reports_every_level() {
        let h = Harness::new().await;
        let root = h.running_root(3).await;
        h.reconcile_until_level(&root, 2).await;

        let report = h.app.status().report(root.id).await.unwrap().unwrap();
        assert_eq!(report.levels.len(), DEEPEST_LEVEL as usize);
        assert_eq!(report.levels[0].content_ready, 1);
        assert_eq!(report.levels[1].pending, 3);
        let open: Vec<u8> = report.open_levels().map(|l| l.level).collect();
        assert_eq!(open, vec![2]);
    }
}
