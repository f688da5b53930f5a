use parking_lot::Mutex;

use super::committable_batch::CommittableBatch;
use crate::kafka_types::{OffsetMap, TopicPartition};

/// Tracks how far commits have run ahead of record delivery under
/// at-most-once semantics.
///
/// At-most-once commits offsets _before_ their records are handed downstream,
/// so a shutdown can leave offsets committed for records nobody ever saw.
/// [`AtmostOnceOffsets::undo_commit_ahead`] re-registers the delivered
/// position for such partitions so the final commit walks the group back to
/// the first undelivered record.
#[derive(Default)]
pub(crate) struct AtmostOnceOffsets {
    /// Next offset committed on the broker, per partition.
    committed: Mutex<OffsetMap>,
    /// Offset of the last record actually handed downstream, per partition.
    dispatched: Mutex<OffsetMap>,
}

impl AtmostOnceOffsets {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a successful synchronous commit.
    pub(crate) fn on_commit(&self, offsets: &OffsetMap) {
        let mut committed = self.committed.lock();
        for (partition, &offset) in offsets {
            let entry = committed.entry(partition.clone()).or_insert(offset);
            if *entry < offset {
                *entry = offset;
            }
        }
    }

    /// Record that the record at `offset` was handed downstream.
    pub(crate) fn on_dispatch(&self, partition: &TopicPartition, offset: i64) {
        let mut dispatched = self.dispatched.lock();
        let entry = dispatched.entry(partition.clone()).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    /// Next offset committed for `partition`, if any commit happened.
    pub(crate) fn committed_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.committed.lock().get(partition).copied()
    }

    /// Compensate commit-ahead: for every partition whose committed offset ran
    /// past the last dispatched record + 1, force the delivered position back
    /// into `batch`. Returns whether a compensating commit is required.
    pub(crate) fn undo_commit_ahead(&self, batch: &CommittableBatch) -> bool {
        let committed = self.committed.lock();
        let dispatched = self.dispatched.lock();
        let mut undone = false;
        for (partition, &committed_next) in committed.iter() {
            let dispatched_next = dispatched
                .get(partition)
                .map_or(0, |&offset| offset + 1);
            if committed_next > dispatched_next {
                batch.force_consumed(partition.clone(), dispatched_next);
                undone = true;
            }
        }
        undone
    }
}
