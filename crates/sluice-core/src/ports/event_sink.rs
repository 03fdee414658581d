//! EventSink port - イベント通知の抽象化
//!
//! 実装は `impls::event_sinks` を参照。

use crate::domain::Event;

/// EventSink はドメインイベントを受け取る observer
///
/// emit はロック保持中に呼ばれないが、待たずに戻ること。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}
