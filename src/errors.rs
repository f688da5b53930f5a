use thiserror::Error;

use crate::sink::EmitError;

/// Possible errors surfaced by a broker [`crate::Consumer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A blocking `poll` or `commit_sync` was cut short by
    /// [`crate::Consumer::wakeup`]. Control-flow signal, never surfaced
    /// downstream.
    #[error("Consumer woken up")]
    Wakeup,

    /// Transient broker-side failure: the operation may succeed if retried.
    #[error("Retriable broker error: {0}")]
    Retriable(String),

    /// Non-retriable failure.
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Possible errors emitted downstream by the receiver event loop.
///
/// All of these are terminal for the stream, except [`ReceiverError::Commit`]
/// delivered to a caller-requested commit completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiverError {
    /// Establishing the subscription (or manual assignment) failed.
    #[error("Subscription failed: {0}")]
    Subscription(#[source] ConsumerError),

    /// A poll iteration failed with something other than a wakeup.
    #[error("Poll failed: {0}")]
    Poll(#[source] ConsumerError),

    /// A commit gave up after `attempts` consecutive failures.
    #[error("Commit failed after {attempts} attempt(s): {source}")]
    Commit {
        #[source]
        source: ConsumerError,
        attempts: u32,
    },

    /// Delivering to the downstream sink failed; the item was dropped.
    #[error("Emission failed: {0}")]
    Emit(#[source] EmitError),

    /// Closing the consumer failed.
    #[error("Consumer close failed: {0}")]
    Close(#[source] ConsumerError),

    /// The event loop stopped before the requested operation could complete.
    #[error("Receiver stopped")]
    Stopped,
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;
