use std::time::Instant;

use super::ConsumerEventLoop;
use crate::config::AckMode;
use crate::errors::{ConsumerError, ConsumerResult, ReceiverError};

/// How many times a close interrupted by a stray wakeup is re-attempted.
const CLOSE_ATTEMPTS: u32 = 3;

impl ConsumerEventLoop {
    /// Orderly shutdown, on the executor thread: revoke manual assignments,
    /// flush commits, wait for in-flight async commits, close the consumer.
    /// Every remaining step is capped by the wall-clock `deadline`.
    pub(crate) fn run_close(&self, deadline: Instant) {
        if self.consumer_handle().is_none() {
            return;
        }

        if let Some(manual_assignment) = self.options.manual_assignment() {
            // No group protocol will ever revoke these: run the revocation
            // protocol ourselves before the consumer goes away.
            self.on_partitions_revoked(manual_assignment);
        }

        if let Err(e) = self.try_close(deadline) {
            error!("Unexpected exception during close: {e}");
            self.emit_terminal_error(ReceiverError::Close(e));
        }
    }

    fn try_close(&self, deadline: Instant) -> ConsumerResult<()> {
        // A recent wakeup from user code can interrupt the wait_for polls
        // while async commit results are still outstanding; retry a bounded
        // number of times before letting it through.
        for attempt in 1..=CLOSE_ATTEMPTS {
            let Some(consumer) = self.consumer_handle() else {
                return Ok(());
            };

            let result = (|| -> ConsumerResult<()> {
                let force_commit = match self.options.ack_mode {
                    AckMode::AtMostOnce => {
                        self.atmost_once_offsets.undo_commit_ahead(&self.commit_batch)
                    }
                    _ => true,
                };
                // Exactly-once offsets travel with the transactional
                // producer: the consumer may be closed immediately.
                if self.options.ack_mode != AckMode::ExactlyOnce {
                    self.run_commit_if_required(force_commit);
                    self.wait_for_commits(deadline, &consumer)?;
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                consumer.close(remaining)
            })();

            match result {
                Ok(()) => {
                    *self.consumer.write() = None;
                    return Ok(());
                }
                Err(ConsumerError::Wakeup) if attempt < CLOSE_ATTEMPTS => {
                    debug!("Close interrupted by wakeup, attempt {attempt}/{CLOSE_ATTEMPTS}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
