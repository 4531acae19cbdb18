//! LegacyAdapter - 旧形式メッセージ（`legacyJobId`）を正規のジョブへ変換する
//!
//! 配送キューの受け口にだけ置き、claim / dispatch 側は正規の job だけを扱います。
//! 変換は通常の submit を通すので、同じ対象の pending/running ジョブがあれば
//! それを再利用します（冪等）。

use std::sync::Arc;

use serde_json::Value;
use ulid::Ulid;

use crate::domain::{Difficulty, EntityId, EntityType, JobType};
use crate::ports::{LegacyJob, LegacyJobSource, StoreError};

use super::submitter::{SubmitError, SubmitRequest, Submission, Submitter};

#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("legacy job {0} not found")]
    NotFound(String),

    #[error("legacy job {id} cannot be translated: {reason}")]
    Untranslatable { id: String, reason: String },

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct LegacyAdapter {
    source: Arc<dyn LegacyJobSource>,
    submitter: Submitter,
}

impl LegacyAdapter {
    pub fn new(source: Arc<dyn LegacyJobSource>, submitter: Submitter) -> Self {
        Self { source, submitter }
    }

    pub async fn translate(&self, legacy_id: &str) -> Result<Submission, LegacyError> {
        let legacy = self
            .source
            .find(legacy_id)
            .await?
            .ok_or_else(|| LegacyError::NotFound(legacy_id.to_string()))?;
        let request = to_request(&legacy)?;
        let submission = self.submitter.submit(request).await?;
        tracing::info!(
            legacy_id,
            job_id = %submission.job_id,
            existing = submission.existing,
            "legacy job translated"
        );
        Ok(submission)
    }
}

fn to_request(legacy: &LegacyJob) -> Result<SubmitRequest, LegacyError> {
    let untranslatable = |reason: String| LegacyError::Untranslatable {
        id: legacy.id.clone(),
        reason,
    };

    let job_type: JobType = legacy
        .job_type
        .parse()
        .map_err(|e| untranslatable(format!("{e}")))?;
    let entity_type: EntityType = legacy
        .entity_type
        .parse()
        .map_err(|e| untranslatable(format!("{e}")))?;
    let entity_id = parse_entity_id(&legacy.entity_id)
        .ok_or_else(|| untranslatable(format!("bad entity id '{}'", legacy.entity_id)))?;

    let mut payload = match &legacy.payload {
        Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    payload.insert("legacyJobId".to_string(), Value::String(legacy.id.clone()));

    let mut request = SubmitRequest::new(job_type, entity_type, entity_id)
        .with_payload(Value::Object(payload));
    if let Some(language) = &legacy.language {
        request = request.with_language(language.clone());
    }
    if let Some(difficulty) = &legacy.difficulty {
        let difficulty: Difficulty = difficulty
            .parse()
            .map_err(|e| untranslatable(format!("{e}")))?;
        request = request.with_difficulty(difficulty);
    }
    Ok(request)
}

/// Legacy rows carry either a prefixed id or a bare ULID.
fn parse_entity_id(raw: &str) -> Option<EntityId> {
    raw.parse::<EntityId>()
        .ok()
        .or_else(|| Ulid::from_string(raw).ok().map(EntityId::from))
}
