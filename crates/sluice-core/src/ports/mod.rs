//! Ports - 抽象化レイヤー
//!
//! 時刻・ID・イベント通知・ヘルスチェックを trait で差し替え可能にします。

pub mod clock;
pub mod event_sink;
pub mod health_probe;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::health_probe::HealthProbe;
pub use self::id_generator::{IdGenerator, UlidGenerator};
