//! Payload codec: typed values <-> JSON task payloads.

use super::task::TaskKind;
use crate::domain::{NewTask, Task};
use crate::error::SluiceError;

/// Build a [`NewTask`] of `T::TYPE` carrying `value` as its payload.
pub fn encode<T: TaskKind>(value: &T) -> Result<NewTask, SluiceError> {
    let payload = serde_json::to_value(value)
        .map_err(|e| SluiceError::Payload(format!("encode {}: {e}", T::TYPE)))?;
    Ok(NewTask::new(T::task_type(), payload))
}

/// Decode a task payload into `T`, checking the task type first.
pub fn decode<T: TaskKind>(task: &Task) -> Result<T, SluiceError> {
    if task.task_type.as_str() != T::TYPE {
        return Err(SluiceError::Payload(format!(
            "expected task_type={}, got {}",
            T::TYPE,
            task.task_type
        )));
    }
    serde_json::from_value(task.payload.clone())
        .map_err(|e| SluiceError::Payload(format!("decode {}: {e}", T::TYPE)))
}
