//! LegacyJobSource port - 旧形式で外部作成されたジョブの参照
//!
//! 旧ジョブは型付けされていないので、文字列のまま返して変換側で検証します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::job_store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyJob {
    pub id: String,
    pub job_type: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait LegacyJobSource: Send + Sync {
    async fn find(&self, legacy_id: &str) -> Result<Option<LegacyJob>, StoreError>;
}
