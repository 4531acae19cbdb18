//! AuditLog port - 追記専用の監査ログ

use async_trait::async_trait;

use crate::domain::{AuditEntry, JobId};

use super::job_store::StoreError;

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one entry. Entries are never updated afterwards.
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Entries for one job in insertion order.
    async fn entries_for(&self, job_id: JobId) -> Result<Vec<AuditEntry>, StoreError>;
}
