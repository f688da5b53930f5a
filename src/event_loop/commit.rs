use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::ConsumerEventLoop;
use crate::config::AckMode;
use crate::consumer::Consumer;
use crate::errors::{ConsumerError, ConsumerResult, ReceiverError};
use crate::kafka_types::OffsetMap;
use crate::offsets::CommitArgs;

/// Timeout of the short polls that drive async commit callbacks during close.
const WAIT_FOR_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Commit-side state.
///
/// `is_pending` is a single-bit gate collapsing arbitrarily many arming
/// signals into one dispatch; `in_progress` counts async commit callbacks not
/// yet delivered; `retrying` holds the loop in its backoff window between a
/// failed commit and its replay.
pub(crate) struct CommitState {
    pub(crate) is_pending: AtomicBool,
    pub(crate) in_progress: AtomicUsize,
    pub(crate) consecutive_failures: AtomicU32,
    pub(crate) retrying: AtomicBool,
}

impl CommitState {
    pub(crate) fn new() -> Self {
        Self {
            is_pending: AtomicBool::new(false),
            in_progress: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            retrying: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::SeqCst)
    }

    pub(crate) fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }
}

impl ConsumerEventLoop {
    /// One commit dispatch, on the executor thread.
    ///
    /// The entry CAS makes dispatches idempotent: however many arming signals
    /// accumulated since the last run collapse into this one, and an arming
    /// that lands during the body re-arms for the next.
    pub(crate) fn run_commit(&self) {
        if self
            .commit
            .is_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(args) = self.commit_batch.get_and_clear_offsets() else {
            return;
        };
        self.dispatch_commit(args);
    }

    fn dispatch_commit(&self, args: CommitArgs) {
        if args.offsets.is_empty() {
            // Nothing to move on the broker, but pending emitters still get
            // their completion.
            self.commit_success(args, &OffsetMap::new());
            return;
        }

        let Some(consumer) = self.consumer_handle() else {
            self.commit_failure(args, ConsumerError::Fatal("consumer closed".to_string()));
            return;
        };

        match self.options.ack_mode {
            AckMode::AtMostOnce => {
                debug!("Sync committing: {:?}", args.offsets);
                let offsets = args.offsets.clone();
                match consumer.commit_sync(&offsets) {
                    Ok(()) => {
                        self.commit_success(args, &offsets);
                        self.atmost_once_offsets.on_commit(&offsets);
                    }
                    Err(e) => {
                        error!("Unexpected exception committing offsets: {e}");
                        self.commit_failure(args, e);
                    }
                }
            }
            AckMode::ExactlyOnce => {
                // Offsets travel with the transactional producer; nothing to
                // do here.
            }
            AckMode::AutoAck | AckMode::ManualAck => {
                self.commit.in_progress.fetch_add(1, Ordering::SeqCst);
                debug!("Async committing: {:?}", args.offsets);
                let Some(event_loop) = self.shared() else {
                    self.commit.in_progress.fetch_sub(1, Ordering::SeqCst);
                    return;
                };
                consumer.commit_async(
                    args.offsets.clone(),
                    Box::new(move |offsets, error| {
                        // Broker-client thread: drop the in-flight count here,
                        // hop onto the executor for the handlers.
                        event_loop.commit.in_progress.fetch_sub(1, Ordering::SeqCst);
                        let offsets = offsets.clone();
                        let handler = Arc::clone(&event_loop);
                        event_loop.executor.execute(move || match error {
                            None => handler.commit_success(args, &offsets),
                            Some(e) => handler.commit_failure(args, e),
                        });
                    }),
                );
                // Commit callbacks only make progress while the client is
                // polled.
                self.schedule_poll();
            }
        }
    }

    fn commit_success(&self, args: CommitArgs, committed: &OffsetMap) {
        if !committed.is_empty() {
            self.commit.consecutive_failures.store(0, Ordering::SeqCst);
        }
        self.schedule_poll_after_retry();
        for emitter in args.emitters {
            let _ = emitter.send(Ok(()));
        }
    }

    fn commit_failure(&self, mut args: CommitArgs, error: ConsumerError) {
        warn!("Commit failed: {error}");

        let retriable_exception = (self.options.is_retriable)(&error);
        let consumer_present = self.consumer_handle().is_some();
        let failures = if retriable_exception && consumer_present {
            self.commit.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.commit.consecutive_failures.load(Ordering::SeqCst) + 1
        };
        let may_retry =
            retriable_exception && consumer_present && failures < self.options.max_commit_attempts;

        if !may_retry {
            debug!("Cannot retry");
            self.schedule_poll_after_retry();
            let error = ReceiverError::Commit {
                source: error,
                attempts: failures,
            };
            if !args.emitters.is_empty() {
                // The failure belongs to whoever asked for this commit, not
                // to the stream.
                self.commit.is_pending.store(false, Ordering::SeqCst);
                self.commit_batch.restore_offsets(&mut args, false);
                for emitter in args.emitters {
                    let _ = emitter.send(Err(error.clone()));
                }
            } else {
                self.emit_terminal_error(error);
            }
        } else {
            self.commit_batch.restore_offsets(&mut args, true);
            warn!(
                "Commit failed with {error}, retries remaining {}",
                self.options.max_commit_attempts - failures
            );
            self.commit.is_pending.store(true, Ordering::SeqCst);
            self.commit.retrying.store(true, Ordering::SeqCst);
            // The poll loop needs to run once to park itself behind the
            // retrying gate.
            self.schedule_poll();
            if let Some(event_loop) = self.shared() {
                self.executor
                    .execute_after(self.options.commit_retry_interval, move || {
                        event_loop.run_commit()
                    });
            }
        }
    }

    fn schedule_poll_after_retry(&self) {
        if self.commit.retrying.swap(false, Ordering::SeqCst) {
            self.schedule_poll();
        }
    }

    /// Run a commit dispatch right here if one is due; with `force`, arm it
    /// first. Executor thread only.
    pub(crate) fn run_commit_if_required(&self, force: bool) {
        if force {
            self.commit.is_pending.store(true, Ordering::SeqCst);
        }
        if !self.commit.is_retrying() && self.commit.is_pending.load(Ordering::SeqCst) {
            self.run_commit();
        }
    }

    /// Arm the pending flag and enqueue a dispatch, unless one is already
    /// armed or the loop is retrying. Thread-safe: this is the path the
    /// periodic committer and acknowledgements use.
    pub(crate) fn schedule_commit_if_required(&self) {
        if self.is_active()
            && !self.commit.is_retrying()
            && self
                .commit
                .is_pending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if let Some(event_loop) = self.shared() {
                self.executor.execute(move || event_loop.run_commit());
            }
        }
    }

    /// Drive async commit callbacks with short polls until none are in
    /// flight or `deadline` passes. Only ever called by the close task.
    pub(crate) fn wait_for_commits(
        &self,
        deadline: Instant,
        consumer: &Arc<dyn Consumer>,
    ) -> ConsumerResult<()> {
        while self.commit.in_progress() > 0 && Instant::now() < deadline {
            consumer.poll(WAIT_FOR_POLL_TIMEOUT)?;
        }
        Ok(())
    }
}
