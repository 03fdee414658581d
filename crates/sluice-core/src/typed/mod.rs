//! Typed - 型付き Task API
//!
//! task_type の typo を型で排除し、Handler との対応付けを静的に保証する。
//!
//! # 二層構造
//! - **表層（Typed）**: `TaskKind` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `queue::Processor` - object-safe, type erasure

mod codec;
mod handler;
mod registry;
mod task;

pub use self::codec::{decode, encode};
pub use self::handler::{Handler, TypedProcessor};
pub use self::task::TaskKind;
