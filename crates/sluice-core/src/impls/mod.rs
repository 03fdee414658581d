//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **NoopEventSink / ChannelEventSink / MemoryEventSink**: イベント通知
//! - **TcpHealthProbe**: TCP 接続によるヘルスチェック

pub mod event_sinks;
pub mod tcp_probe;

pub use self::event_sinks::{ChannelEventSink, MemoryEventSink, NoopEventSink};
pub use self::tcp_probe::TcpHealthProbe;
