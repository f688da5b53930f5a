use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::errors::{ReceiverError, ReceiverResult};
use crate::kafka_types::RecordBatch;

/// How long to back off before re-attempting a [`EmitError::Busy`] emission.
const BUSY_BACKOFF: Duration = Duration::from_millis(1);

/// Why an emission could not be completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// Transient: the downstream buffer is momentarily full.
    #[error("Downstream buffer full")]
    Busy,
    /// Terminal: the receiving side is gone.
    #[error("Downstream receiver dropped")]
    Terminated,
}

/// Decides whether a failed emission should be re-attempted.
pub type EmitRetryPolicy<'a> = dyn Fn(EmitError) -> bool + 'a;

/// Downstream edge of the event loop.
///
/// Implementations must be callable from the executor thread; the event loop
/// never emits from anywhere else.
pub trait BatchSink: Send + Sync {
    /// Deliver one batch, consulting `retry` on transient failures.
    fn emit_next(&self, batch: RecordBatch, retry: &EmitRetryPolicy<'_>) -> Result<(), EmitError>;

    /// Deliver a terminal error, consulting `retry` on transient failures.
    fn emit_error(&self, error: ReceiverError, retry: &EmitRetryPolicy<'_>) -> Result<(), EmitError>;
}

/// [`BatchSink`] over a bounded [`mpsc::channel`].
///
/// The channel capacity is a safety margin, not the flow-control mechanism:
/// outstanding demand is what bounds how many batches are in flight. A full
/// channel therefore only happens when downstream requested more than it is
/// draining, and emission backs off until capacity frees up.
pub struct ChannelSink {
    tx: mpsc::Sender<ReceiverResult<RecordBatch>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ReceiverResult<RecordBatch>>) -> Self {
        Self { tx }
    }

    fn emit(
        &self,
        mut item: ReceiverResult<RecordBatch>,
        retry: &EmitRetryPolicy<'_>,
    ) -> Result<(), EmitError> {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(it)) => {
                    if !retry(EmitError::Busy) {
                        return Err(EmitError::Busy);
                    }
                    item = it;
                    thread::sleep(BUSY_BACKOFF);
                }
                Err(TrySendError::Closed(_)) => {
                    // Nobody left to deliver to; retrying cannot help.
                    return Err(EmitError::Terminated);
                }
            }
        }
    }
}

impl BatchSink for ChannelSink {
    fn emit_next(&self, batch: RecordBatch, retry: &EmitRetryPolicy<'_>) -> Result<(), EmitError> {
        self.emit(Ok(batch), retry)
    }

    fn emit_error(&self, error: ReceiverError, retry: &EmitRetryPolicy<'_>) -> Result<(), EmitError> {
        self.emit(Err(error), retry)
    }
}
