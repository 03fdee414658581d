//! EventSink の実装
//!
//! - NoopEventSink: 何もしない
//! - ChannelEventSink: tokio mpsc で監視側に流す
//! - MemoryEventSink: テスト用に全件保持

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::domain::Event;
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to an unbounded channel the monitoring side drains.
///
/// ```ignore
/// let (sink, mut rx) = ChannelEventSink::channel();
/// tokio::spawn(async move {
///     while let Some(event) = rx.recv().await {
///         tracing::info!(?event);
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        // receiver が drop 済みならイベントは捨てる
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
