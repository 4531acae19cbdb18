//! Generator port - 外部の生成バックエンド
//!
//! 出力は常に信頼しない前提で扱います（JSON 抽出 → 厳格な検証は `validation` 側）。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Raw generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Free text; may wrap the JSON in prose or markdown fences.
    pub content: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend rejected the request: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// `timeout` is advisory for the backend; callers also enforce it.
    async fn generate(
        &self,
        prompt: &str,
        meta: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Generation, GenerationError>;
}
