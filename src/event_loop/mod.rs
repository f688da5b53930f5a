//! The event-serialization core: a broker consumer does not support
//! multi-threaded access, so everything we do with it is serialized onto one
//! [`SerialExecutor`] thread, and every cross-thread signal (demand, user
//! pause/resume, acknowledgements, stop) is reduced to atomics plus tasks
//! scheduled onto that executor. The only consumer call ever made off the
//! executor is `wakeup`, the one documented thread-safe operation.

// Inner modules
mod close;
mod commit;
mod poll;
#[cfg(test)]
pub(crate) mod tests;

// Imports
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{AckMode, PartitionListener, ReceiverOptions, Subscription};
use crate::consumer::{Consumer, RebalanceListener, SeekablePartition};
use crate::errors::ReceiverError;
use crate::executor::SerialExecutor;
use crate::kafka_types::{RecordBatch, TopicPartition};
use crate::offsets::{AtmostOnceOffsets, CommittableBatch};
use crate::sink::{BatchSink, EmitError};

use commit::CommitState;
use poll::PollState;

/// Timeout of the diagnostic `position`/`committed` lookups after assignment.
const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes every action on a non-thread-safe broker consumer, multiplexing
/// demand-driven polling, flow control, offset commits and shutdown onto one
/// executor thread.
pub(crate) struct ConsumerEventLoop {
    /// One-shot liveness flag: `true` from construction until `stop`.
    pub(crate) active: AtomicBool,

    /// Outstanding batch-level demand from downstream. Saturating; the
    /// maximum value means unbounded and is never decremented.
    pub(crate) requested: AtomicU64,

    /// While `true`, polls keep the whole assignment paused (a transactional
    /// send is in flight elsewhere).
    pub(crate) awaiting_transaction: Arc<AtomicBool>,

    /// Partitions explicitly paused by external code; they stay paused across
    /// rebalances for as long as they remain assigned.
    pub(crate) paused_by_user: Mutex<HashSet<TopicPartition>>,

    /// The confined consumer handle. Nulled exactly once, by the close task.
    pub(crate) consumer: RwLock<Option<Arc<dyn Consumer>>>,

    pub(crate) sink: Box<dyn BatchSink>,
    pub(crate) options: ReceiverOptions,
    pub(crate) executor: SerialExecutor,
    pub(crate) commit_batch: CommittableBatch,
    pub(crate) atmost_once_offsets: AtmostOnceOffsets,
    pub(crate) poll: PollState,
    pub(crate) commit: CommitState,

    /// Stops the periodic committer task together with the loop.
    pub(crate) periodic_commit_token: CancellationToken,

    /// Back-reference for scheduling ourselves onto the executor.
    weak: Weak<ConsumerEventLoop>,
}

impl ConsumerEventLoop {
    /// Build the loop and schedule the subscribe task as the executor's first
    /// unit of work.
    pub(crate) fn start(
        consumer: Arc<dyn Consumer>,
        options: ReceiverOptions,
        sink: Box<dyn BatchSink>,
        executor: SerialExecutor,
        awaiting_transaction: Arc<AtomicBool>,
        periodic_commit_token: CancellationToken,
    ) -> Arc<Self> {
        let out_of_order_commits = options.max_deferred_commits > 0;
        let event_loop = Arc::new_cyclic(|weak| Self {
            active: AtomicBool::new(true),
            requested: AtomicU64::new(0),
            awaiting_transaction,
            paused_by_user: Mutex::new(HashSet::new()),
            consumer: RwLock::new(Some(consumer)),
            sink,
            options,
            executor,
            commit_batch: CommittableBatch::new(out_of_order_commits),
            atmost_once_offsets: AtmostOnceOffsets::new(),
            poll: PollState::new(),
            commit: CommitState::new(),
            periodic_commit_token,
            weak: weak.clone(),
        });

        let subscriber = Arc::clone(&event_loop);
        event_loop.executor.execute(move || subscriber.run_subscribe());

        event_loop
    }

    /// The strong reference behind `self`, for handing to scheduled tasks.
    /// `None` only during the final teardown, when nothing should be
    /// scheduled anymore anyway.
    fn shared(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    pub(crate) fn consumer_handle(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.read().clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------ off-executor signals

    /// Signal downstream demand for `to_add` more batches. Thread-safe.
    pub(crate) fn on_request(&self, to_add: u64) {
        debug!("on_request.to_add {}, paused {}", to_add, self.poll.is_paused());
        add_cap(&self.requested, to_add);
        if self.poll.is_paused() {
            if let Some(consumer) = self.consumer_handle() {
                consumer.wakeup();
            }
        }
        self.schedule_poll();
    }

    /// Record partitions as paused-by-user. Thread-safe; the broker-side
    /// pause is applied by a separate executor task.
    pub(crate) fn paused(&self, partitions: &[TopicPartition]) {
        self.paused_by_user.lock().extend(partitions.iter().cloned());
    }

    /// Forget partitions as paused-by-user. Thread-safe.
    pub(crate) fn resumed(&self, partitions: &[TopicPartition]) {
        let mut paused_by_user = self.paused_by_user.lock();
        for partition in partitions {
            paused_by_user.remove(partition);
        }
    }

    pub(crate) fn set_awaiting_transaction(&self, awaiting: bool) {
        self.awaiting_transaction.store(awaiting, Ordering::SeqCst);
        if !awaiting {
            self.schedule_poll();
        }
    }

    /// Stop the loop: flip `active` exactly once, silence the periodic
    /// committer, cut any blocking poll short and enqueue the close task.
    ///
    /// Idempotent. The returned channel resolves once the consumer is closed
    /// (immediately, on every call after the first).
    pub(crate) fn stop(&self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();

        debug!("dispose, active {}", self.is_active());
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = done_tx.send(());
            return done_rx;
        }

        self.periodic_commit_token.cancel();

        match (self.consumer_handle(), self.shared()) {
            (Some(consumer), Some(event_loop)) => {
                consumer.wakeup();
                let deadline = Instant::now() + self.options.close_timeout;
                self.executor.execute(move || {
                    event_loop.run_close(deadline);
                    let _ = done_tx.send(());
                });
            }
            _ => {
                let _ = done_tx.send(());
            }
        }

        done_rx
    }

    // ------------------------------------------------------------ executor-side tasks

    /// Enqueue a poll iteration, unless one is already pending.
    pub(crate) fn schedule_poll(&self) {
        if !self.poll.scheduled.swap(true, Ordering::SeqCst) {
            if let Some(event_loop) = self.shared() {
                self.executor.execute(move || event_loop.run_poll());
            }
        }
    }

    /// Runs once, as the executor's first task: installs the rebalance
    /// listener and establishes the subscription.
    fn run_subscribe(self: Arc<Self>) {
        let Some(consumer) = self.consumer_handle() else {
            return;
        };

        let listener = LoopRebalanceListener {
            event_loop: Arc::downgrade(&self),
        };
        let result = match &self.options.subscription {
            Subscription::Topics(topics) => consumer.subscribe(topics, Box::new(listener)),
            Subscription::Partitions(partitions) => consumer.assign(partitions),
        };

        if let Err(e) = result {
            if self.is_active() {
                error!("Unexpected exception establishing subscription: {e}");
                self.emit_terminal_error(ReceiverError::Subscription(e));
            }
        }
    }

    /// Assignment hook. Runs inside a broker poll, on the executor thread.
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
        debug!("on_partitions_assigned {partitions:?}");
        let Some(consumer) = self.consumer_handle() else {
            return;
        };

        // The loop throttled fetching before the rebalance: new assignments
        // must not leak records past that gate.
        let mut repaused_all = false;
        if !partitions.is_empty() && self.poll.is_paused() {
            debug!("Rebalance during back pressure, re-pausing new assignments");
            if let Err(e) = consumer.pause(partitions) {
                error!("Failed to re-pause {partitions:?}: {e}");
            }
            repaused_all = true;
        }

        {
            let mut paused_by_user = self.paused_by_user.lock();
            if !paused_by_user.is_empty() {
                let assigned: HashSet<&TopicPartition> = partitions.iter().collect();
                paused_by_user.retain(|partition| assigned.contains(partition));
                if !repaused_all && !paused_by_user.is_empty() {
                    let to_repause: Vec<TopicPartition> =
                        paused_by_user.iter().cloned().collect();
                    if let Err(e) = consumer.pause(&to_repause) {
                        error!("Failed to re-pause {to_repause:?}: {e}");
                    }
                }
            }
        }

        // Listeners may seek. Safe: we are inside a poll() on the executor.
        invoke_partition_listeners(
            &self.options.assign_listeners,
            consumer.as_ref(),
            partitions,
        );

        if log_enabled!(log::Level::Trace) {
            for partition in partitions {
                match consumer.position(partition, DIAGNOSTICS_TIMEOUT) {
                    Ok(position) => trace!("{partition} pos: {position}"),
                    Err(e) => error!("Failed to get position of {partition}: {e}"),
                }
            }
            let partition_set: HashSet<TopicPartition> = partitions.iter().cloned().collect();
            match consumer.committed(&partition_set, DIAGNOSTICS_TIMEOUT) {
                Ok(committed) => trace!("committed: {committed:?}"),
                Err(e) => error!("Failed to get committed offsets: {e}"),
            }
        }
    }

    /// Revocation hook. Runs inside a broker poll, on the executor thread, so
    /// direct consumer use (forced commits, drain polls) is safe.
    pub(crate) fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        debug!("on_partitions_revoked {partitions:?}");
        if partitions.is_empty() {
            return;
        }

        if self.options.ack_mode != AckMode::AtMostOnce {
            self.run_commit_if_required(true);
            self.drain_in_pipeline();
        }

        if let Some(consumer) = self.consumer_handle() {
            invoke_partition_listeners(
                &self.options.revoke_listeners,
                consumer.as_ref(),
                partitions,
            );
        }
    }

    /// Hold the revocation up to `max_delay_rebalance`, forcing a commit at
    /// every tick, until nothing is left in the pipeline and no transaction
    /// is pending.
    fn drain_in_pipeline(&self) {
        let max_delay = self.options.max_delay_rebalance;
        if !self.is_active() || max_delay.is_zero() {
            return;
        }

        let interval = self.options.commit_interval_during_delay;
        let mut in_pipeline = self.commit_batch.in_pipeline();
        if in_pipeline == 0 && !self.awaiting_transaction.load(Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + max_delay;
        loop {
            debug!("Rebalancing; waiting for {in_pipeline} records in pipeline");
            thread::sleep(interval);
            self.run_commit_if_required(true);

            in_pipeline = self.commit_batch.in_pipeline();
            let gates_clear =
                in_pipeline == 0 && !self.awaiting_transaction.load(Ordering::SeqCst);
            if !self.is_active() || gates_clear || Instant::now() >= deadline {
                break;
            }
        }
    }

    // ------------------------------------------------------------ emission

    /// Deliver a batch downstream. Transient sink contention is retried for
    /// as long as the loop is active; anything else drops the batch and
    /// reports the [`ReceiverError::Emit`] it was dropped with.
    pub(crate) fn emit_batch(&self, batch: RecordBatch) -> Result<(), ReceiverError> {
        let retry = |e: EmitError| self.is_active() && e == EmitError::Busy;
        self.sink.emit_next(batch, &retry).map_err(|e| {
            let error = ReceiverError::Emit(e);
            debug!("Dropping batch: {error}");
            error
        })
    }

    pub(crate) fn emit_terminal_error(&self, error: ReceiverError) {
        let retry = |e: EmitError| self.is_active() && e == EmitError::Busy;
        if let Err(e) = self.sink.emit_error(error, &retry) {
            debug!("Dropping terminal error: {}", ReceiverError::Emit(e));
        }
    }
}

/// The listener installed by the subscribe task; everything it does runs
/// inside a broker poll on the executor thread.
struct LoopRebalanceListener {
    event_loop: Weak<ConsumerEventLoop>,
}

impl RebalanceListener for LoopRebalanceListener {
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.on_partitions_assigned(partitions);
        }
    }

    fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.on_partitions_revoked(partitions);
            event_loop.commit_batch.partitions_revoked(partitions);
        }
    }
}

fn invoke_partition_listeners(
    listeners: &[PartitionListener],
    consumer: &dyn Consumer,
    partitions: &[TopicPartition],
) {
    if listeners.is_empty() {
        return;
    }
    let seekable: Vec<SeekablePartition<'_>> = partitions
        .iter()
        .map(|partition| SeekablePartition::new(consumer, partition.clone()))
        .collect();
    for listener in listeners {
        listener(&seekable);
    }
}

/// Saturating add on the shared demand counter; returns the previous value.
/// Once the counter hits the maximum it stays there (unbounded demand).
pub(crate) fn add_cap(counter: &AtomicU64, to_add: u64) -> u64 {
    let mut current = counter.load(Ordering::SeqCst);
    loop {
        if current == u64::MAX {
            return current;
        }
        let next = current.saturating_add(to_add);
        match counter.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Decrement the demand counter after one emission, never below zero and
/// never out of the unbounded state.
pub(crate) fn produced_one(counter: &AtomicU64) {
    let mut current = counter.load(Ordering::SeqCst);
    loop {
        if current == 0 || current == u64::MAX {
            return;
        }
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
