//! InMemoryDeliveryQueue - 開発用の配送キュー
//!
//! - Mutex + Condvar による blocking pop
//! - async からは spawn_blocking 経由で触る
//! - namespace ごとにキューを分ける

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::ports::{DeliveryQueue, QueueError};

type Queues = HashMap<String, VecDeque<serde_json::Value>>;

/// InMemoryDeliveryQueue は開発用の配送キュー
///
/// ```ignore
/// let queue = InMemoryDeliveryQueue::new();
/// queue.push("hydration", json!({ "jobId": job_id })).await?;
/// let message = queue.pop("hydration", Duration::from_secs(5)).await?;
/// ```
pub struct InMemoryDeliveryQueue {
    queues: Arc<Mutex<Queues>>,
    /// push 時の通知用
    condvar: Arc<Condvar>,
    /// ブローカー停止の再現用。閉じている間 push は失敗する
    closed: AtomicBool,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            condvar: Arc::new(Condvar::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reject pushes until `reopen`, as a broker outage would.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Messages currently waiting in `ns`.
    pub fn len(&self, ns: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(ns).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, ns: &str) -> bool {
        self.len(ns) == 0
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::OperationFailed("queue mutex poisoned".to_string())
}

#[async_trait::async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push(&self, ns: &str, message: serde_json::Value) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(ns.to_string()));
        }
        let queues = self.queues.clone();
        let condvar = self.condvar.clone();
        let ns = ns.to_string();

        tokio::task::spawn_blocking(move || {
            let mut queues = queues.lock().map_err(poisoned)?;
            queues.entry(ns).or_default().push_back(message);
            // 別 namespace で待っている pop もあるので全員起こす
            condvar.notify_all();
            Ok(())
        })
        .await
        .map_err(|e| QueueError::OperationFailed(format!("push failed: {e}")))?
    }

    async fn pop(
        &self,
        ns: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        let queues = self.queues.clone();
        let condvar = self.condvar.clone();
        let ns = ns.to_string();
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let mut guard = queues.lock().map_err(poisoned)?;
            loop {
                if let Some(queue) = guard.get_mut(&ns)
                    && let Some(message) = queue.pop_front()
                {
                    return Ok(Some(message));
                }
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Ok(None);
                }
                let (next, _) = condvar
                    .wait_timeout(guard, timeout - elapsed)
                    .map_err(poisoned)?;
                guard = next;
            }
        })
        .await
        .map_err(|e| QueueError::OperationFailed(format!("pop failed: {e}")))?
    }
}
