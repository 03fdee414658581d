use std::time::Duration;

use thiserror::Error;

use crate::domain::TaskType;
use crate::governance::circuit_breaker::CircuitOpenError;

/// Errors raised by the admission layer, the task queue and processors.
#[derive(Debug, Clone, Error)]
pub enum SluiceError {
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("no healthy server available")]
    NoHealthyServer,

    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("processor not registered for task_type={0}")]
    UnregisteredTaskType(TaskType),

    #[error("duplicate processor for task_type={0}")]
    DuplicateProcessor(TaskType),

    #[error("priority {priority} out of range (levels={levels})")]
    InvalidPriority { priority: u8, levels: u8 },

    #[error("server already registered: {0}")]
    DuplicateServer(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("processor error: {0}")]
    Processor(String),

    #[error("payload codec: {0}")]
    Payload(String),

    #[error("health probe failed: {0}")]
    Probe(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("queue is shutting down")]
    ShuttingDown,
}

impl SluiceError {
    /// Shorthand for a processor-raised failure.
    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor(message.into())
    }

    /// Processor failures and timeouts are retried by the queue; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Processor(_) | Self::TaskTimeout(_))
    }

    /// Errors the governance layer surfaces to the caller without retrying.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::CircuitOpen(_) | Self::NoHealthyServer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::processor(SluiceError::processor("boom"), true, false)]
    #[case::timeout(SluiceError::TaskTimeout(Duration::from_secs(1)), true, false)]
    #[case::rate_limited(
        SluiceError::RateLimitExceeded { retry_after: Duration::from_millis(10) },
        false,
        true
    )]
    #[case::no_server(SluiceError::NoHealthyServer, false, true)]
    #[case::unregistered(SluiceError::UnregisteredTaskType(TaskType::new("x")), false, false)]
    #[case::bad_payload(SluiceError::Payload("missing field".into()), false, false)]
    fn classification(
        #[case] err: SluiceError,
        #[case] retryable: bool,
        #[case] admission: bool,
    ) {
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.is_admission(), admission);
    }

    #[test]
    fn unregistered_message_names_the_type() {
        let err = SluiceError::UnregisteredTaskType(TaskType::new("render.chart"));
        assert!(err.to_string().contains("render.chart"));
    }
}
