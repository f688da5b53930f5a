use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{AckMode, ReceiverOptions};
use crate::consumer::Consumer;
use crate::errors::{ReceiverError, ReceiverResult};
use crate::event_loop::ConsumerEventLoop;
use crate::executor::SerialExecutor;
use crate::kafka_types::{RecordBatch, TopicPartition};
use crate::sink::ChannelSink;

const CHANNEL_SIZE: usize = 1000;

const EXECUTOR_THREAD_NAME: &str = "konveyor-event-loop";

/// Entry point: wires a [`Consumer`] to a demand-driven batch stream.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use konveyor::{Consumer, KafkaReceiver, ReceiverOptions, Subscription};
/// # async fn example(consumer: Arc<dyn Consumer>) {
/// let options = ReceiverOptions::new(Subscription::Topics(vec!["events".to_string()]));
/// let (mut batches, handle) = KafkaReceiver::new(consumer, options).spawn();
///
/// handle.request(1);
/// while let Some(batch) = batches.recv().await {
///     let batch = batch.expect("stream failed");
///     for record in batch.records() {
///         handle.acknowledge(&record.topic_partition(), record.offset);
///     }
///     handle.request(1);
/// }
/// # }
/// ```
pub struct KafkaReceiver {
    consumer: Arc<dyn Consumer>,
    options: ReceiverOptions,
}

impl KafkaReceiver {
    pub fn new(consumer: Arc<dyn Consumer>, options: ReceiverOptions) -> Self {
        Self { consumer, options }
    }

    /// Start the event loop and hand back the batch stream plus its control
    /// handle.
    ///
    /// Must be called within a tokio runtime: the periodic committer (when
    /// enabled) is spawned onto it. The stream yields nothing until demand is
    /// signalled via [`ReceiverHandle::request`].
    pub fn spawn(self) -> (mpsc::Receiver<ReceiverResult<RecordBatch>>, ReceiverHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        let executor = SerialExecutor::spawn(EXECUTOR_THREAD_NAME);
        let shutdown_token = CancellationToken::new();
        let awaiting_transaction = Arc::new(AtomicBool::new(false));

        let event_loop = ConsumerEventLoop::start(
            self.consumer,
            self.options,
            Box::new(ChannelSink::new(tx)),
            executor,
            awaiting_transaction,
            shutdown_token.clone(),
        );

        Self::spawn_periodic_committer(&event_loop, shutdown_token);

        (rx, ReceiverHandle { event_loop })
    }

    /// The commit timer only arms the pending flag: the dispatch itself
    /// always happens on the executor.
    fn spawn_periodic_committer(
        event_loop: &Arc<ConsumerEventLoop>,
        shutdown_token: CancellationToken,
    ) {
        let commit_interval = event_loop.options.commit_interval;
        if commit_interval.is_zero() {
            return;
        }
        match event_loop.options.ack_mode {
            AckMode::AutoAck | AckMode::ManualAck => {}
            // At-most-once commits inline with every poll; exactly-once never
            // commits from the loop at all.
            AckMode::AtMostOnce | AckMode::ExactlyOnce => return,
        }

        let event_loop = Arc::clone(event_loop);
        tokio::spawn(async move {
            let mut interval = interval(commit_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; //< completes immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        event_loop.schedule_commit_if_required();
                    },
                    _ = shutdown_token.cancelled() => {
                        debug!("Periodic committer received shutdown signal");
                        break;
                    },
                }
            }
        });
    }
}

/// Thread-safe control surface of a running receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    event_loop: Arc<ConsumerEventLoop>,
}

impl ReceiverHandle {
    /// Signal downstream demand for `n` more batches (saturating; pass
    /// `u64::MAX` for unbounded).
    pub fn request(&self, n: u64) {
        self.event_loop.on_request(n);
    }

    /// Stop fetching from `partitions` until [`ReceiverHandle::resume`].
    /// Survives rebalances for as long as the partitions stay assigned.
    pub fn pause(&self, partitions: &[TopicPartition]) {
        self.event_loop.paused(partitions);
        let event_loop = Arc::clone(&self.event_loop);
        let partitions = partitions.to_vec();
        self.event_loop.executor.execute(move || {
            if let Some(consumer) = event_loop.consumer_handle() {
                if let Err(e) = consumer.pause(&partitions) {
                    error!("Failed to pause {partitions:?}: {e}");
                }
            }
        });
    }

    /// Resume fetching from `partitions`.
    pub fn resume(&self, partitions: &[TopicPartition]) {
        self.event_loop.resumed(partitions);
        let event_loop = Arc::clone(&self.event_loop);
        let partitions = partitions.to_vec();
        self.event_loop.executor.execute(move || {
            // While the poll loop has the whole assignment paused it owns the
            // broker-side pause state; these partitions resume with the rest
            // once the gates clear.
            if event_loop.poll.is_paused() {
                return;
            }
            if let Some(consumer) = event_loop.consumer_handle() {
                if let Err(e) = consumer.resume(&partitions) {
                    error!("Failed to resume {partitions:?}: {e}");
                }
            }
        });
    }

    /// Mark the record at `offset` on `partition` as processed, making its
    /// offset eligible for the next commit.
    pub fn acknowledge(&self, partition: &TopicPartition, offset: i64) {
        self.event_loop.commit_batch.acknowledge(partition, offset);
        self.event_loop.schedule_commit_if_required();
    }

    /// Commit everything acknowledged so far; resolves once the commit
    /// settles on the broker.
    pub async fn commit(&self) -> ReceiverResult<()> {
        let (tx, rx) = oneshot::channel();
        self.event_loop.commit_batch.add_commit_emitter(tx);
        self.event_loop.schedule_commit_if_required();
        match rx.await {
            Ok(result) => result,
            // The loop shut down before the dispatch picked the emitter up.
            Err(_) => Err(ReceiverError::Stopped),
        }
    }

    /// Gate polling while a transactional send is in flight elsewhere.
    pub fn set_awaiting_transaction(&self, awaiting: bool) {
        self.event_loop.set_awaiting_transaction(awaiting);
    }

    /// Stop the loop: flush commits and close the consumer within the
    /// configured close timeout. Idempotent; resolves once the consumer is
    /// closed.
    pub async fn stop(&self) {
        let done = self.event_loop.stop();
        let _ = done.await;
    }
}
