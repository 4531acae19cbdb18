//! InMemoryLegacyJobs - 旧形式ジョブの参照元（開発・テスト用）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ports::{LegacyJob, LegacyJobSource, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryLegacyJobs {
    jobs: RwLock<HashMap<String, LegacyJob>>,
}

impl InMemoryLegacyJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: LegacyJob) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }
}

#[async_trait]
impl LegacyJobSource for InMemoryLegacyJobs {
    async fn find(&self, legacy_id: &str) -> Result<Option<LegacyJob>, StoreError> {
        Ok(self.jobs.read().await.get(legacy_id).cloned())
    }
}
