//! Handler trait - 型付き payload を処理する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`)
//! - Type erasure パターン (`TypedProcessor<T, H>` → `dyn Processor`)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec;
use super::task::TaskKind;
use crate::domain::Task;
use crate::error::SluiceError;
use crate::queue::Processor;

/// Handles decoded payloads of one [`TaskKind`].
///
/// `Handler<RenderChart>` は `RenderChart` しか受け取れないので、
/// task_type と payload 型の対応はコンパイル時に決まる。
#[async_trait]
pub trait Handler<T: TaskKind>: Send + Sync {
    async fn handle(&self, payload: T, task: &Task) -> Result<serde_json::Value, SluiceError>;
}

/// Adapts a [`Handler<T>`] to the queue's object-safe [`Processor`].
pub struct TypedProcessor<T: TaskKind, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskKind, H: Handler<T>> TypedProcessor<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskKind, H: Handler<T>> Processor for TypedProcessor<T, H> {
    async fn process(&self, task: &Task) -> Result<serde_json::Value, SluiceError> {
        let payload: T = codec::decode(task)?;
        self.handler.handle(payload, task).await
    }
}
