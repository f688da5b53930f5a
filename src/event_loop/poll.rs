use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{produced_one, ConsumerEventLoop};
use crate::config::AckMode;
use crate::consumer::Consumer;
use crate::errors::{ConsumerError, ReceiverError};
use crate::kafka_types::{RecordBatch, TopicPartition};

/// Poll-side flags.
///
/// `scheduled` guarantees at most one poll task sits in the executor queue;
/// `paused_by_us` tracks whether the loop itself paused the whole assignment
/// because of an internal gate (no demand, deferred commits, commit retry,
/// transaction in flight).
pub(crate) struct PollState {
    pub(crate) paused_by_us: AtomicBool,
    pub(crate) scheduled: AtomicBool,
}

impl PollState {
    pub(crate) fn new() -> Self {
        Self {
            paused_by_us: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused_by_us.load(Ordering::SeqCst)
    }
}

impl ConsumerEventLoop {
    /// One iteration of the poll loop: evaluate the flow-control gates,
    /// pause or resume accordingly, poll, reschedule, emit.
    pub(crate) fn run_poll(self: Arc<Self>) {
        self.poll.scheduled.store(false, Ordering::SeqCst);
        if !self.is_active() {
            return;
        }
        let Some(consumer) = self.consumer_handle() else {
            return;
        };

        if let Err(e) = self.poll_once(&consumer) {
            if self.is_active() {
                error!("Unexpected exception in poll loop: {e}");
                self.emit_terminal_error(e);
            }
        }
    }

    fn poll_once(&self, consumer: &Arc<dyn Consumer>) -> Result<(), ReceiverError> {
        // Commits must not queue behind however many polls downstream demand
        // is worth: run a due one right now.
        self.run_commit_if_required(false);

        let mut requested = self.requested.load(Ordering::SeqCst);
        let max_deferred = self.options.max_deferred_commits;
        let pause_for_deferred =
            max_deferred > 0 && self.commit_batch.deferred_count() >= max_deferred;
        if pause_for_deferred || self.commit.is_retrying() {
            requested = 0;
        }

        if requested > 0 {
            if !self.awaiting_transaction.load(Ordering::SeqCst) {
                if self.poll.paused_by_us.swap(false, Ordering::SeqCst) {
                    let mut to_resume: HashSet<TopicPartition> =
                        consumer.assignment().map_err(ReceiverError::Poll)?;
                    {
                        let paused_by_user = self.paused_by_user.lock();
                        to_resume.retain(|partition| !paused_by_user.contains(partition));
                    }
                    let to_resume: Vec<TopicPartition> = to_resume.into_iter().collect();
                    consumer.resume(&to_resume).map_err(ReceiverError::Poll)?;
                    debug!("Resumed partitions: {to_resume:?}");
                }
            } else if self.check_and_set_paused_by_us(consumer) {
                self.pause_assignment(consumer)?;
                debug!("Paused - awaiting transaction");
            }
        } else if self.check_and_set_paused_by_us(consumer) {
            self.pause_assignment(consumer)?;
            if pause_for_deferred {
                debug!("Paused - too many deferred commits");
            } else if self.commit.is_retrying() {
                debug!("Paused - commits are retrying");
            } else {
                debug!("Paused - back pressure");
            }
        }

        let batch = match consumer.poll(self.options.poll_timeout) {
            Ok(batch) => batch,
            Err(ConsumerError::Wakeup) => {
                debug!("Consumer woken");
                RecordBatch::empty()
            }
            Err(e) => return Err(ReceiverError::Poll(e)),
        };

        // A subsequent executor tick runs the next iteration, keeping the
        // loop cooperative with commits and shutdown.
        if self.is_active() {
            self.schedule_poll();
        }

        if !batch.is_empty() {
            self.commit_batch.add_uncommitted(&batch);
            let at_most_once = self.options.ack_mode == AckMode::AtMostOnce;
            if at_most_once {
                self.commit_ahead(&batch);
            }
            produced_one(&self.requested);
            debug!("Emitting {} records, requested now {requested}", batch.count());
            let last_offsets = at_most_once.then(|| batch.last_offsets());
            if self.emit_batch(batch).is_ok() {
                for (partition, next) in last_offsets.into_iter().flatten() {
                    self.atmost_once_offsets.on_dispatch(&partition, next - 1);
                }
            }
        }
        Ok(())
    }

    /// At-most-once: offsets move forward before the records flow. The whole
    /// batch is acknowledged and synchronously committed ahead of emission.
    fn commit_ahead(&self, batch: &RecordBatch) {
        for record in batch.records() {
            self.commit_batch
                .acknowledge(&record.topic_partition(), record.offset);
        }
        self.run_commit_if_required(true);

        if log_enabled!(log::Level::Trace) {
            for partition in batch.partitions() {
                trace!(
                    "{partition} committed ahead: {:?}",
                    self.atmost_once_offsets.committed_offset(&partition)
                );
            }
        }
    }

    /// Transition into paused-by-us.
    ///
    /// On the 0→1 edge, re-check demand that may have arrived after
    /// `requested` was read and wake the consumer, so the pause about to be
    /// installed cannot swallow it.
    fn check_and_set_paused_by_us(&self, consumer: &Arc<dyn Consumer>) -> bool {
        let paused_now = !self.poll.paused_by_us.swap(true, Ordering::SeqCst);
        if paused_now
            && self.requested.load(Ordering::SeqCst) > 0
            && !self.commit.is_retrying()
        {
            consumer.wakeup();
        }
        paused_now
    }

    fn pause_assignment(&self, consumer: &Arc<dyn Consumer>) -> Result<(), ReceiverError> {
        let assignment: Vec<TopicPartition> = consumer
            .assignment()
            .map_err(ReceiverError::Poll)?
            .into_iter()
            .collect();
        consumer.pause(&assignment).map_err(ReceiverError::Poll)?;
        Ok(())
    }
}
