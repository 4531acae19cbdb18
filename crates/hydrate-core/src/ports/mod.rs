//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（DB、配送キュー、生成バックエンド、設定ストア）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - JobStore が source of truth（正本）
//! - 配送キューは job id だけを運ぶ
//! - 生成バックエンドの出力は信頼しない

pub mod audit_log;
pub mod clock;
pub mod content_store;
pub mod delivery_queue;
pub mod dispatch;
pub mod generator;
pub mod id_generator;
pub mod job_store;
pub mod legacy;
pub mod settings;

// 主要な trait を再エクスポート
pub use self::audit_log::AuditLog;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::content_store::{ContentCounts, ContentStore};
pub use self::delivery_queue::{DeliveryQueue, QueueError};
pub use self::dispatch::{DispatchError, Dispatcher};
pub use self::generator::{Generation, GenerationError, Generator, Usage};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{CommitOutcome, CreateOutcome, Dedupe, JobStore, StoreError, Transition};
pub use self::legacy::{LegacyJob, LegacyJobSource};
pub use self::settings::SettingsSource;
