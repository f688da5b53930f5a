use std::collections::HashSet;
use std::time::Duration;

use crate::errors::{ConsumerError, ConsumerResult};
use crate::kafka_types::{OffsetMap, RecordBatch, TopicPartition};

/// Callback handed to [`Consumer::commit_async`].
///
/// Invoked exactly once, from an arbitrary broker-client thread, with the
/// offsets the commit covered and the failure, if any.
pub type CommitCallback = Box<dyn FnOnce(&OffsetMap, Option<ConsumerError>) + Send>;

/// Target of a [`Consumer::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTo {
    /// An absolute offset within the partition.
    Offset(i64),
    /// The earliest offset still available on the broker.
    Beginning,
    /// One past the last produced offset.
    End,
}

/// Hooks invoked by the broker client when group membership changes.
///
/// Both hooks run _inside_ a [`Consumer::poll`], on the thread that called it,
/// so implementations may use the consumer directly.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]);
    fn on_partitions_revoked(&self, partitions: &[TopicPartition]);
}

/// The polling broker consumer this crate serializes access to.
///
/// Mirrors the subset of a Kafka consumer client the event loop needs.
/// Apart from [`Consumer::wakeup`] (and `close`), implementations are NOT
/// expected to tolerate concurrent calls: the event loop confines every other
/// operation to its executor thread.
pub trait Consumer: Send + Sync {
    /// Block up to `timeout` waiting for records.
    ///
    /// Returns [`ConsumerError::Wakeup`] when interrupted by
    /// [`Consumer::wakeup`]. Rebalance listener hooks run inside this call.
    fn poll(&self, timeout: Duration) -> ConsumerResult<RecordBatch>;

    /// Stop fetching from `partitions` until resumed. Idempotent.
    fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()>;

    /// Resume fetching from `partitions`. Idempotent.
    fn resume(&self, partitions: &[TopicPartition]) -> ConsumerResult<()>;

    /// The set of partitions currently assigned to this consumer.
    fn assignment(&self) -> ConsumerResult<HashSet<TopicPartition>>;

    /// Blocking commit; returns once the broker acknowledged (or refused) it.
    fn commit_sync(&self, offsets: &OffsetMap) -> ConsumerResult<()>;

    /// Fire-and-forget commit; `callback` is eventually invoked on a
    /// broker-client internal thread.
    fn commit_async(&self, offsets: OffsetMap, callback: CommitCallback);

    /// Thread-safe: causes an in-progress (or the next) blocking `poll` or
    /// `commit_sync` to return [`ConsumerError::Wakeup`].
    fn wakeup(&self);

    /// Blocking close with bounded wait.
    fn close(&self, timeout: Duration) -> ConsumerResult<()>;

    /// Join the Consumer Group for `topics`; `listener` receives assignment
    /// changes inside subsequent polls.
    fn subscribe(
        &self,
        topics: &[String],
        listener: Box<dyn RebalanceListener>,
    ) -> ConsumerResult<()>;

    /// Take `partitions` without group membership (no rebalance callbacks).
    fn assign(&self, partitions: &[TopicPartition]) -> ConsumerResult<()>;

    /// Move the fetch position of `partition`.
    fn seek(&self, partition: &TopicPartition, to: SeekTo) -> ConsumerResult<()>;

    /// Current fetch position of `partition`.
    fn position(&self, partition: &TopicPartition, timeout: Duration) -> ConsumerResult<i64>;

    /// Last committed offsets for `partitions`.
    fn committed(
        &self,
        partitions: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> ConsumerResult<OffsetMap>;
}

/// A partition view handed to assign/revoke listeners.
///
/// Only valid for the duration of the callback: seeks go straight to the
/// consumer, which is safe because listeners run inside a `poll()` on the
/// executor thread.
pub struct SeekablePartition<'a> {
    consumer: &'a dyn Consumer,
    partition: TopicPartition,
}

impl<'a> SeekablePartition<'a> {
    pub(crate) fn new(consumer: &'a dyn Consumer, partition: TopicPartition) -> Self {
        Self {
            consumer,
            partition,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn seek(&self, to: SeekTo) -> ConsumerResult<()> {
        self.consumer.seek(&self.partition, to)
    }

    pub fn position(&self, timeout: Duration) -> ConsumerResult<i64> {
        self.consumer.position(&self.partition, timeout)
    }
}
