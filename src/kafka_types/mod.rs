// Inner modules
mod record;
mod topic_partition;

// Exports
pub use record::{Record, RecordBatch};
pub use topic_partition::{OffsetMap, TopicPartition};
