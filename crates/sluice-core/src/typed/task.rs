//! TaskKind - payload 型と task_type の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// A payload type bound to one task type.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RenderChart {
///     dataset: String,
/// }
///
/// impl TaskKind for RenderChart {
///     const TYPE: &'static str = "viz.chart.render.v1";
/// }
/// ```
///
/// 命名規約: `{namespace}.{domain}.{action}.v{major}`
pub trait TaskKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }
}
