//! Audit - ジョブごとの追記専用イベント列
//!
//! 監査ログは「何が起きたか」の正本、Job の `status` は「次に何をするか」の正本。
//! 一度書いたエントリは更新しません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AuditId, JobId};
use super::job::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    Created,
    Enqueued,
    EnqueueFailed,
    Started,
    ResponseReceived,
    ValidationPassed,
    ValidationFailed,
    Completed,
    Failed,
    CompletionSkipped,
    /// Operator cancellation, or cascade cancellation from a root.
    Cancelled,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Created => "CREATED",
            AuditEvent::Enqueued => "ENQUEUED",
            AuditEvent::EnqueueFailed => "ENQUEUE_FAILED",
            AuditEvent::Started => "STARTED",
            AuditEvent::ResponseReceived => "RESPONSE_RECEIVED",
            AuditEvent::ValidationPassed => "VALIDATION_PASSED",
            AuditEvent::ValidationFailed => "VALIDATION_FAILED",
            AuditEvent::Completed => "COMPLETED",
            AuditEvent::Failed => "FAILED",
            AuditEvent::CompletionSkipped => "COMPLETION_SKIPPED",
            AuditEvent::Cancelled => "CANCELLED",
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub job_id: JobId,
    pub event: AuditEvent,
    pub prev_status: Option<JobStatus>,
    pub new_status: Option<JobStatus>,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Unstamped audit record; the sink assigns id and timestamp on append.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub event: AuditEvent,
    pub prev_status: Option<JobStatus>,
    pub new_status: Option<JobStatus>,
    pub meta: serde_json::Value,
}

impl AuditRecord {
    pub fn new(job_id: JobId, event: AuditEvent) -> Self {
        Self {
            job_id,
            event,
            prev_status: None,
            new_status: None,
            meta: serde_json::Value::Null,
        }
    }

    pub fn transition(mut self, prev: Option<JobStatus>, new: JobStatus) -> Self {
        self.prev_status = prev;
        self.new_status = Some(new);
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn stamp(self, id: AuditId, at: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            id,
            job_id: self.job_id,
            event: self.event,
            prev_status: self.prev_status,
            new_status: self.new_status,
            meta: self.meta,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_as_screaming_snake_case() {
        let s = serde_json::to_string(&AuditEvent::EnqueueFailed).unwrap();
        assert_eq!(s, "\"ENQUEUE_FAILED\"");
        assert_eq!(AuditEvent::CompletionSkipped.as_str(), "COMPLETION_SKIPPED");
    }

    #[test]
    fn stamping_keeps_the_snapshot() {
        let job_id = JobId::generate();
        let entry = AuditRecord::new(job_id, AuditEvent::Started)
            .transition(Some(JobStatus::Pending), JobStatus::Running)
            .with_meta(serde_json::json!({ "attempt": 1 }))
            .stamp(AuditId::generate(), Utc::now());
        assert_eq!(entry.job_id, job_id);
        assert_eq!(entry.prev_status, Some(JobStatus::Pending));
        assert_eq!(entry.new_status, Some(JobStatus::Running));
        assert_eq!(entry.meta["attempt"], 1);
    }
}
