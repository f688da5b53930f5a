use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::ReceiverResult;
use crate::kafka_types::{OffsetMap, RecordBatch, TopicPartition};

/// Completion for a caller-requested commit: resolved with the outcome of the
/// dispatch that picked it up.
pub(crate) type CommitEmitter = oneshot::Sender<ReceiverResult<()>>;

/// Snapshot taken by [`CommittableBatch::get_and_clear_offsets`]: what to
/// commit, and who to notify once the commit settles.
pub(crate) struct CommitArgs {
    pub(crate) offsets: OffsetMap,
    pub(crate) emitters: Vec<CommitEmitter>,
}

/// Per-partition bookkeeping of delivered-but-unacknowledged offsets.
/// Only fed in out-of-order mode.
#[derive(Default)]
struct PartitionAcks {
    /// Offsets delivered downstream, in delivery order, awaiting
    /// acknowledgement.
    delivered: VecDeque<i64>,
    /// Acknowledged out of order: parked until the gap below them closes.
    deferred: BTreeSet<i64>,
}

#[derive(Default)]
struct BatchState {
    /// Next offset to commit, per partition (highest contiguous ack + 1).
    consumed: OffsetMap,
    /// Out-of-order acknowledgement tracking, per partition.
    acks: HashMap<TopicPartition, PartitionAcks>,
    /// Completions waiting for the next commit dispatch.
    emitters: Vec<CommitEmitter>,
    /// Records delivered downstream and not yet acknowledged, per partition.
    pipeline: HashMap<TopicPartition, usize>,
}

/// Accumulates uncommitted offsets between commit dispatches.
///
/// Every operation takes one internal lock, so snapshot-and-clear is atomic
/// with respect to concurrent acknowledgements: an acknowledgement lands
/// either in the snapshot being dispatched or in the state the next dispatch
/// will see, never in both and never in neither.
pub(crate) struct CommittableBatch {
    state: Mutex<BatchState>,
    /// Set iff the deferred-commit gate is configured (`max_deferred_commits
    /// > 0`); enables the per-offset tracking out-of-order acks need.
    out_of_order_commits: bool,
}

impl CommittableBatch {
    pub(crate) fn new(out_of_order_commits: bool) -> Self {
        Self {
            state: Mutex::new(BatchState::default()),
            out_of_order_commits,
        }
    }

    /// Record a just-polled batch as in-pipeline.
    pub(crate) fn add_uncommitted(&self, batch: &RecordBatch) {
        let mut state = self.state.lock();
        for record in batch.records() {
            let partition = record.topic_partition();
            *state.pipeline.entry(partition.clone()).or_insert(0) += 1;
            if self.out_of_order_commits {
                state
                    .acks
                    .entry(partition)
                    .or_default()
                    .delivered
                    .push_back(record.offset);
            }
        }
    }

    /// Downstream finished processing `offset` on `partition`.
    ///
    /// In-order mode simply advances the committable offset. In out-of-order
    /// mode the offset only becomes committable once everything below it has
    /// been acknowledged too; until then it is parked as deferred.
    pub(crate) fn acknowledge(&self, partition: &TopicPartition, offset: i64) {
        let mut state = self.state.lock();
        if let Some(count) = state.pipeline.get_mut(partition) {
            *count = count.saturating_sub(1);
        }

        if !self.out_of_order_commits {
            Self::advance_consumed(&mut state.consumed, partition, offset + 1);
            return;
        }

        let mut advanced_to = None;
        if let Some(acks) = state.acks.get_mut(partition) {
            match acks.delivered.front() {
                Some(&head) if head == offset => {
                    acks.delivered.pop_front();
                    let mut last = offset;
                    // Drain previously deferred acks that are now contiguous.
                    while let Some(&next) = acks.delivered.front() {
                        if !acks.deferred.remove(&next) {
                            break;
                        }
                        acks.delivered.pop_front();
                        last = next;
                    }
                    advanced_to = Some(last + 1);
                }
                Some(&head) if head > offset => {
                    trace!("Acknowledge of {partition}@{offset} below {head}: already covered");
                }
                Some(_) => {
                    acks.deferred.insert(offset);
                }
                None => {
                    trace!("Acknowledge of {partition}@{offset} with nothing delivered: ignoring");
                }
            }
        }
        if let Some(next) = advanced_to {
            Self::advance_consumed(&mut state.consumed, partition, next);
        }
    }

    fn advance_consumed(consumed: &mut OffsetMap, partition: &TopicPartition, next: i64) {
        let entry = consumed.entry(partition.clone()).or_insert(next);
        if *entry < next {
            *entry = next;
        }
    }

    /// Records delivered downstream and not yet acknowledged.
    pub(crate) fn in_pipeline(&self) -> usize {
        self.state.lock().pipeline.values().sum()
    }

    /// Offsets whose commit is still blocked on acknowledgements; drives the
    /// deferred-commit backpressure gate. Always 0 in in-order mode.
    pub(crate) fn deferred_count(&self) -> usize {
        self.state
            .lock()
            .acks
            .values()
            .map(|acks| acks.delivered.len())
            .sum()
    }

    /// Register a completion to resolve with the outcome of the next commit
    /// dispatch.
    pub(crate) fn add_commit_emitter(&self, emitter: CommitEmitter) {
        self.state.lock().emitters.push(emitter);
    }

    /// Atomically snapshot and reset what there is to commit.
    ///
    /// Returns `None` when there are neither offsets nor pending emitters.
    pub(crate) fn get_and_clear_offsets(&self) -> Option<CommitArgs> {
        let mut state = self.state.lock();
        if state.consumed.is_empty() && state.emitters.is_empty() {
            return None;
        }
        Some(CommitArgs {
            offsets: std::mem::take(&mut state.consumed),
            emitters: std::mem::take(&mut state.emitters),
        })
    }

    /// Put a snapshot back after a failed dispatch.
    ///
    /// Offsets never regress a value that advanced since the snapshot was
    /// taken. With `retry` the emitters go back too (the retry dispatch will
    /// pick them up); without it the caller keeps them, to fail directly.
    pub(crate) fn restore_offsets(&self, args: &mut CommitArgs, retry: bool) {
        let mut state = self.state.lock();
        for (partition, offset) in args.offsets.drain() {
            Self::advance_consumed(&mut state.consumed, &partition, offset);
        }
        if retry {
            state.emitters.append(&mut args.emitters);
        }
    }

    /// Overwrite the committable offset of `partition`, regressions included.
    /// Used to compensate commit-ahead on close.
    pub(crate) fn force_consumed(&self, partition: TopicPartition, offset: i64) {
        self.state.lock().consumed.insert(partition, offset);
    }

    /// Drop all bookkeeping for partitions we no longer own.
    pub(crate) fn partitions_revoked(&self, partitions: &[TopicPartition]) {
        let mut state = self.state.lock();
        for partition in partitions {
            state.acks.remove(partition);
            state.pipeline.remove(partition);
            state.consumed.remove(partition);
        }
    }
}
