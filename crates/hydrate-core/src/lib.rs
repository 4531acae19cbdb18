//! hydrate-core
//!
//! カリキュラム生成ジョブ（syllabus → topics → notes → questions）の実行エンジン。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, cascade, audit, outbox, content, errors）
//! - **ports**: 抽象化レイヤー（JobStore, ContentStore, AuditLog, DeliveryQueue, Generator, など）
//! - **app**: アプリケーションロジック（builder, submitter, worker_loop, reconciler, など）
//! - **typed**: 型付き Handler API（Handler trait, TypedRegistry）
//! - **handlers**: job type ごとの生成ハンドラ
//! - **impls**: 実装（InMemoryStore など開発用）
//!
//! 共通部品:
//! - config: `HydrationConfig`（`HYDRATE_*` 環境変数）
//! - retry: 指数バックオフ
//! - validation: 生成出力の抽出・検証
//! - worker: spawn したループ群のハンドル

pub mod app;
pub mod config;
pub mod domain;
pub mod handlers;
pub mod impls;
pub mod ports;
pub mod retry;
pub mod typed;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod testing;

pub use self::app::{App, AppBuilder};
pub use self::config::HydrationConfig;
pub use self::worker::WorkerGroup;
