//! QueueDispatcher - outbox エントリを DeliveryQueue に流す Dispatcher
//!
//! ルーティングは outbox の `queue` 名をそのまま namespace として使います。
//! 知らない queue 名や壊れた payload は何度やっても届かないので Unresolvable。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{DeliveryMessage, OutboxEntry};
use crate::ports::{DeliveryQueue, DispatchError, Dispatcher};

pub struct QueueDispatcher {
    queue: Arc<dyn DeliveryQueue>,
    routes: HashSet<String>,
}

impl QueueDispatcher {
    pub fn new<I, S>(queue: Arc<dyn DeliveryQueue>, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue,
            routes: routes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(&self, entry: &OutboxEntry) -> Result<(), DispatchError> {
        if !self.routes.contains(&entry.queue) {
            return Err(DispatchError::Unresolvable(format!(
                "no route for queue '{}'",
                entry.queue
            )));
        }
        serde_json::from_value::<DeliveryMessage>(entry.payload.clone()).map_err(|e| {
            DispatchError::Unresolvable(format!("payload is not a delivery message: {e}"))
        })?;
        self.queue
            .push(&entry.queue, entry.payload.clone())
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, OutboxId};
    use crate::impls::InMemoryDeliveryQueue;
    use chrono::Utc;
    use std::time::Duration;

    fn entry(queue: &str) -> OutboxEntry {
        OutboxEntry::for_job(
            OutboxId::generate(),
            queue,
            JobId::generate(),
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn known_queue_is_delivered() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let dispatcher = QueueDispatcher::new(queue.clone(), ["hydration"]);
        let entry = entry("hydration");

        dispatcher.dispatch(&entry).await.unwrap();
        let popped = queue.pop("hydration", Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped, Some(entry.payload));
    }

    #[tokio::test]
    async fn unknown_queue_is_unresolvable() {
        let dispatcher = QueueDispatcher::new(Arc::new(InMemoryDeliveryQueue::new()), ["hydration"]);
        let err = dispatcher.dispatch(&entry("legacy-gen")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unresolvable(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_unresolvable() {
        let dispatcher = QueueDispatcher::new(Arc::new(InMemoryDeliveryQueue::new()), ["hydration"]);
        let mut entry = entry("hydration");
        entry.payload = serde_json::json!({ "what": "ever" });
        let err = dispatcher.dispatch(&entry).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unresolvable(_)));
    }
}
