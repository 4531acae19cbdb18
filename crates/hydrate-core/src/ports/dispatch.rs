//! Dispatcher port - outbox エントリを配送キューへ届ける
//!
//! Submitter の同期配送（best-effort）と PublisherLoop の drain の両方が使います。

use async_trait::async_trait;

use crate::domain::OutboxEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Queue outage; the outbox row stays and is retried later.
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// Routing cannot succeed no matter how often it is retried.
    #[error("unresolvable dispatch: {0}")]
    Unresolvable(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, entry: &OutboxEntry) -> Result<(), DispatchError>;
}
