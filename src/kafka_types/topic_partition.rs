use std::collections::HashMap;
use std::fmt;

/// Represents a single Topic-Partition pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Offsets to commit, per Topic-Partition.
///
/// The value is the offset of the _next_ record the Consumer Group should
/// receive on that partition (i.e. last processed offset + 1), matching
/// what brokers expect in a commit request.
pub type OffsetMap = HashMap<TopicPartition, i64>;
