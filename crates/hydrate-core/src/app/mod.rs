//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **Submitter**: 検証・kill switch・dedupe 付きのジョブ投入、retry / cancel
//! - **WorkerLoop**: pop → claim → handler → commit → evidence 検証
//! - **PublisherLoop**: outbox の配送
//! - **ReaperLoop**: stale claim の回収、配送漏れの再送、retryable 失敗の再投入
//! - **Reconciler**: level barrier を見て cascade を fan-out し、root を確定
//! - **StatusService**: ジョブの状態照会

pub mod audit;
pub mod builder;
pub mod delivery;
pub mod kill_switch;
pub mod legacy_adapter;
pub mod publisher_loop;
pub mod reaper_loop;
pub mod reconciler;
pub mod status;
pub mod submitter;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::audit::Auditor;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::delivery::{Delivery, DeliveryOutcome};
pub use self::kill_switch::KillSwitch;
pub use self::legacy_adapter::{LegacyAdapter, LegacyError};
pub use self::publisher_loop::{PublishReport, PublisherLoop};
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::reconciler::{ReconcileReport, Reconciler, ReconcilerLoop};
pub use self::status::{ErrorSummary, StatusReport, StatusService};
pub use self::submitter::{Cancellation, SubmitError, SubmitRequest, Submission, Submitter};
pub use self::worker_loop::{WorkOutcome, WorkerLoop};
