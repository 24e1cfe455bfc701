use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transport layer.
///
/// None of these are fatal to a container: consumer loops and RPC calls
/// treat every variant except `Cancelled`, `DeadlineExceeded` and
/// `Shutdown` as "log and retry".
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    /// An exclusive queue is already held by another connection.
    #[error("resource locked: queue `{queue}` is held by another consumer")]
    ResourceLocked { queue: String },

    /// A mandatory publish could not be routed to any queue.
    #[error("message to `{exchange}`/`{routing_key}` was returned unroutable")]
    Unroutable { exchange: String, routing_key: String },

    #[error("broker refused the message (nack)")]
    Nacked,

    #[error("operation `{0}` timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("call was cancelled")]
    Cancelled,

    #[error("call deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The reply channel went away while a call was waiting on it.
    #[error("reply stream lost before a reply arrived")]
    ReplyLost,

    /// The bus was shut down; nothing will be sent or resolved any more.
    #[error("bus is shut down")]
    Shutdown,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid broker settings: {0}")]
    Settings(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BusError {
    /// Exclusive-queue contention, expected to clear once the other
    /// instance goes away.
    pub fn is_resource_locked(&self) -> bool {
        matches!(self, BusError::ResourceLocked { .. })
    }

    /// Whether the RPC client should run another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BusError::Cancelled
                | BusError::DeadlineExceeded(_)
                | BusError::Shutdown
                | BusError::Serialization(_)
        )
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let locked = BusError::ResourceLocked { queue: "apollo_payload_build".into() };
        assert!(locked.is_resource_locked());
        assert!(locked.is_retryable());
        assert!(BusError::Timeout("rpc reply", Duration::from_secs(1)).is_retryable());
        assert!(!BusError::Cancelled.is_retryable());
        assert!(!BusError::DeadlineExceeded(Duration::from_secs(3)).is_retryable());
        assert!(!BusError::Shutdown.is_retryable());
        assert!(BusError::ReplyLost.is_retryable());
    }
}
