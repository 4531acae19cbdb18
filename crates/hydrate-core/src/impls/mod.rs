//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: JobStore / ContentStore / AuditLog / SettingsSource
//! - **InMemoryDeliveryQueue**: 開発用の配送キュー
//! - **QueueDispatcher**: outbox → 配送キュー
//! - **StubGenerator**: 決定的な生成バックエンド
//! - **InMemoryLegacyJobs**: 旧形式ジョブの参照元
//!
//! 本番用の実装（DB・ブローカー・LLM クライアント）は別クレートに置く想定です。

pub mod inmem_delivery;
pub mod inmem_store;
pub mod legacy;
pub mod queue_dispatch;
pub mod stub_generator;

pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_store::InMemoryStore;
pub use self::legacy::InMemoryLegacyJobs;
pub use self::queue_dispatch::QueueDispatcher;
pub use self::stub_generator::{StubGenerator, StubReply};
