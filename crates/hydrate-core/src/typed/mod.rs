//! Typed - 型付き Handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `Handler` trait - draft 型と job type を静的に対応付ける
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod handler;
pub mod registry;

pub use self::handler::{DynHandler, Handler, HandlerContext, HandlerOutcome, Target};
pub use self::registry::{RegistryError, TypedRegistry};
