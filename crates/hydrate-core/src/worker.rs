//! WorkerGroup - spawn したループ群のハンドル
//!
//! すべてのループは同じ `watch` チャネルで停止要求を受け取ります。

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Worker group handle.
/// - `request_shutdown()` で全ループに停止を通知する
/// - `shutdown_and_join()` で全ループの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    /// Spawn one loop. It receives its own shutdown receiver.
    pub fn spawn<F, Fut>(&mut self, make: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(make(shutdown_rx)));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all loops.
    /// In-flight handler execution is not cancelled; loops stop taking new work.
    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all loops.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "loop task panicked or was aborted");
            }
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}
