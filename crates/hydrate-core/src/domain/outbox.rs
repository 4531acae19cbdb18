//! Outbox - ジョブ作成と配送意図を同一トランザクションで記録する
//!
//! Job がコミットされていれば、ブローカーが落ちていても必ず配送意図が残ります。
//! 配送（drain）は `PublisherLoop` が担当し、再配送は claim 側で重複排除されます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, OutboxId};

/// Wire payload carried on the delivery queue.
///
/// Canonical messages carry a hydration job id; legacy messages carry an
/// externally-created job reference that is translated on first sight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeliveryMessage {
    Job {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    Legacy {
        #[serde(rename = "legacyJobId")]
        legacy_job_id: String,
    },
}

impl DeliveryMessage {
    pub fn job(job_id: JobId) -> Self {
        DeliveryMessage::Job { job_id }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            DeliveryMessage::Job { job_id } => serde_json::json!({ "jobId": job_id }),
            DeliveryMessage::Legacy { legacy_job_id } => {
                serde_json::json!({ "legacyJobId": legacy_job_id })
            }
        }
    }
}

/// One delivery intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub queue: String,
    /// Opaque to the store; a serialized `DeliveryMessage`.
    pub payload: serde_json::Value,
    /// Denormalized routing hints (linked job id, job type, entity context).
    #[serde(default)]
    pub meta: serde_json::Value,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn for_job(
        id: OutboxId,
        queue: impl Into<String>,
        job_id: JobId,
        meta: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            payload: DeliveryMessage::job(job_id).to_value(),
            meta,
            job_id,
            created_at: now,
            delivered_at: None,
            delivery_attempts: 0,
            last_error: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_message_accepts_both_shapes() {
        let job_id = JobId::generate();
        let canonical: DeliveryMessage =
            serde_json::from_value(serde_json::json!({ "jobId": job_id.to_string() })).unwrap();
        assert_eq!(canonical, DeliveryMessage::job(job_id));

        let legacy: DeliveryMessage =
            serde_json::from_value(serde_json::json!({ "legacyJobId": "gen-42" })).unwrap();
        assert_eq!(
            legacy,
            DeliveryMessage::Legacy {
                legacy_job_id: "gen-42".into()
            }
        );
    }

    #[test]
    fn outbox_payload_is_a_canonical_message() {
        let job_id = JobId::generate();
        let entry = OutboxEntry::for_job(
            OutboxId::generate(),
            "hydration",
            job_id,
            serde_json::Value::Null,
            Utc::now(),
        );
        let message: DeliveryMessage = serde_json::from_value(entry.payload.clone()).unwrap();
        assert_eq!(message, DeliveryMessage::job(job_id));
        assert!(!entry.is_delivered());
    }
}
