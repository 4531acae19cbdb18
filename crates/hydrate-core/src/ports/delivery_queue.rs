//! DeliveryQueue port - 配送キュー（Redis または InMemory）
//!
//! DeliveryQueue は不透明な JSON メッセージだけを流します。
//! 状態は JobStore にあり、重複配送は claim 側で排除されるので at-least-once で十分です。

use std::time::Duration;

use async_trait::async_trait;

/// DeliveryQueue は namespace ごとのキュー
///
/// # 設計原則
/// - メッセージは `DeliveryMessage` を serialize したもの（job id のみ）
/// - blocking pop（timeout 付き）
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn push(&self, ns: &str, message: serde_json::Value) -> Result<(), QueueError>;

    async fn pop(&self, ns: &str, timeout: Duration)
    -> Result<Option<serde_json::Value>, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}
