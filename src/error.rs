use std::sync::Arc;

use thiserror::Error;

/// Terminal error delivered to every waiter of a failed operation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Timeout, connection reset or 5xx response. Retried up to the
    /// configured limit before becoming terminal.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// 4xx response or malformed URL. Never retried.
    #[error("permanent network failure: {0}")]
    NetworkPermanent(String),

    /// The filesystem rejected the cache write. Partial data is discarded.
    #[error("cache write failed: {0}")]
    WriteFailure(Arc<std::io::Error>),

    /// The request withdrew before the fetch completed.
    #[error("fetch cancelled")]
    Cancelled,

    /// Engine is shutting down; no new work is accepted.
    #[error("engine shut down")]
    ShutDown,
}

impl EngineError {
    pub fn write_failure(err: std::io::Error) -> Self {
        Self::WriteFailure(Arc::new(err))
    }

    /// Whether the fetch pipeline should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkTransient(_))
    }
}
