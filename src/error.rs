//! Error types surfaced to producers.
//!
//! Producer-thread failures come back synchronously as [`ClientError`].
//! Background failures (upload retries exhausted, poller fetches) never
//! propagate here; they are delivered to the `on_error` callback and logged.

use thiserror::Error;

use crate::transport::TransportError;

/// Rejections raised while normalizing a message, before it is queued.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The distinct id rendered to an empty string.
    #[error("distinct_id must not be empty")]
    EmptyDistinctId,
    /// The serialized record exceeds the per-message size limit.
    #[error("serialized message is {size} bytes, above the 32 KiB limit")]
    Oversized { size: usize },
    /// A supplied value could not be rendered as JSON.
    #[error("message is not JSON-serializable")]
    NotSerializable,
}

/// Failures reported by the client's producer-facing operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client could not be constructed from the supplied options.
    #[error("configuration error: {0}")]
    Config(String),
    /// The message was rejected before it reached the queue.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),
    /// The queue is at capacity; the message was dropped.
    #[error("queue full")]
    QueueFull,
    /// The client has been shut down and no longer accepts messages.
    #[error("client is shut down")]
    Closed,
    /// Synchronous-mode delivery failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
