use std::time::Duration;

use crate::consumer::SeekablePartition;
use crate::errors::ConsumerError;
use crate::kafka_types::TopicPartition;

/// The default timeout of one consumer poll.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The default period of the commit timer; zero disables periodic commits.
const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// The default backoff between retries of a failed commit.
const DEFAULT_COMMIT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// The default cap on consecutive commit failures before surfacing the error.
const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 100;

/// The default commit cadence while a rebalance is being delayed.
const DEFAULT_COMMIT_INTERVAL_DURING_DELAY: Duration = Duration::from_millis(100);

/// The default wall-clock cap on an orderly shutdown.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Policy governing when and how offsets are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Offsets are committed synchronously ahead of record delivery.
    AtMostOnce,
    /// Offsets travel with a transactional producer; the loop never commits.
    ExactlyOnce,
    /// Offsets are committed asynchronously once downstream consumed a batch.
    AutoAck,
    /// Offsets are committed asynchronously once downstream acknowledged
    /// individual records.
    ManualAck,
}

/// How the consumer obtains its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Join the Consumer Group for these topics; partitions arrive and leave
    /// through rebalances.
    Topics(Vec<String>),
    /// Take exactly these partitions, with no group membership.
    Partitions(Vec<TopicPartition>),
}

/// Callback over the partitions just assigned to (or about to be revoked
/// from) the consumer. Runs inside a poll, on the executor thread; seeks
/// through the provided views are safe.
pub type PartitionListener = Box<dyn Fn(&[SeekablePartition<'_>]) + Send + Sync>;

/// Decides whether a failed commit may be retried.
pub type IsRetriablePredicate = Box<dyn Fn(&ConsumerError) -> bool + Send + Sync>;

/// Configuration of a [`crate::KafkaReceiver`].
///
/// Durations set to zero disable the corresponding behaviour, where
/// documented.
pub struct ReceiverOptions {
    /// How the consumer obtains its partitions.
    pub subscription: Subscription,

    /// Offset commit policy.
    pub ack_mode: AckMode,

    /// Timeout of one consumer poll.
    pub poll_timeout: Duration,

    /// Period of the commit timer. Zero disables periodic commits.
    pub commit_interval: Duration,

    /// Backoff before a failed commit is retried.
    pub commit_retry_interval: Duration,

    /// Consecutive commit failures tolerated before the error surfaces.
    pub max_commit_attempts: u32,

    /// When > 0, fetching pauses while this many delivered records still
    /// await acknowledgement (deferred-commit backpressure gate).
    pub max_deferred_commits: usize,

    /// When > 0, partition revocation waits up to this long for in-pipeline
    /// records to drain before completing.
    pub max_delay_rebalance: Duration,

    /// Commit cadence while a rebalance is being delayed.
    pub commit_interval_during_delay: Duration,

    /// Wall-clock cap on an orderly shutdown.
    pub close_timeout: Duration,

    /// Invoked with the partitions just assigned, inside a poll.
    pub assign_listeners: Vec<PartitionListener>,

    /// Invoked with the partitions about to be revoked, inside a poll.
    pub revoke_listeners: Vec<PartitionListener>,

    /// Decides whether a failed commit may be retried.
    pub is_retriable: IsRetriablePredicate,
}

impl ReceiverOptions {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            ack_mode: AckMode::ManualAck,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            commit_retry_interval: DEFAULT_COMMIT_RETRY_INTERVAL,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            max_deferred_commits: 0,
            max_delay_rebalance: Duration::ZERO,
            commit_interval_during_delay: DEFAULT_COMMIT_INTERVAL_DURING_DELAY,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            assign_listeners: Vec::new(),
            revoke_listeners: Vec::new(),
            is_retriable: Box::new(|e| matches!(e, ConsumerError::Retriable(_))),
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_commit_interval(mut self, commit_interval: Duration) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    pub fn with_commit_retry_interval(mut self, commit_retry_interval: Duration) -> Self {
        self.commit_retry_interval = commit_retry_interval;
        self
    }

    pub fn with_max_commit_attempts(mut self, max_commit_attempts: u32) -> Self {
        self.max_commit_attempts = max_commit_attempts;
        self
    }

    pub fn with_max_deferred_commits(mut self, max_deferred_commits: usize) -> Self {
        self.max_deferred_commits = max_deferred_commits;
        self
    }

    pub fn with_max_delay_rebalance(mut self, max_delay_rebalance: Duration) -> Self {
        self.max_delay_rebalance = max_delay_rebalance;
        self
    }

    pub fn with_commit_interval_during_delay(mut self, interval: Duration) -> Self {
        self.commit_interval_during_delay = interval;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn with_assign_listener(mut self, listener: PartitionListener) -> Self {
        self.assign_listeners.push(listener);
        self
    }

    pub fn with_revoke_listener(mut self, listener: PartitionListener) -> Self {
        self.revoke_listeners.push(listener);
        self
    }

    pub fn with_is_retriable(mut self, is_retriable: IsRetriablePredicate) -> Self {
        self.is_retriable = is_retriable;
        self
    }

    /// The manually assigned partitions, if the subscription is manual.
    pub(crate) fn manual_assignment(&self) -> Option<&[TopicPartition]> {
        match &self.subscription {
            Subscription::Partitions(partitions) if !partitions.is_empty() => Some(partitions),
            _ => None,
        }
    }
}
