use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::topic_partition::{OffsetMap, TopicPartition};

/// A single record fetched from the Cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: u32,
    /// Offset of the record within its partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Record payload; `None` for tombstones
    pub payload: Option<Vec<u8>>,
    /// [`DateTime<Utc>`] when this record was read from the Cluster
    pub read_datetime: DateTime<Utc>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// The unit returned by one consumer poll: zero or more [`Record`]s across
/// one or more assigned partitions.
///
/// Within a partition, records appear in broker delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of records in the batch.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The set of partitions this batch spans.
    pub fn partitions(&self) -> HashSet<TopicPartition> {
        self.records.iter().map(Record::topic_partition).collect()
    }

    /// What committing this whole batch means: per partition, the highest
    /// offset seen plus one.
    pub fn last_offsets(&self) -> OffsetMap {
        let mut offsets = OffsetMap::new();
        for record in &self.records {
            let next = record.offset + 1;
            let entry = offsets.entry(record.topic_partition()).or_insert(next);
            if *entry < next {
                *entry = next;
            }
        }
        offsets
    }
}

impl IntoIterator for RecordBatch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
