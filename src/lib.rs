//! Demand-driven, backpressure-aware bridge between a polling broker consumer
//! and an async stream of record batches.
//!
//! A broker consumer handle does not support multi-threaded access: `konveyor`
//! confines every call on it to a single serial executor thread, and
//! multiplexes on top of that thread the fetching of record batches under
//! downstream demand, pause/resume flow control, periodic and on-demand
//! offset commits, rebalance coordination, and orderly shutdown.
//!
//! The entry point is [`KafkaReceiver`]: give it a [`Consumer`] implementation
//! and [`ReceiverOptions`], and it hands back a `tokio` channel of
//! [`RecordBatch`]es plus a [`ReceiverHandle`] to signal demand, acknowledge
//! processed records, pause/resume partitions and stop the loop.

#[macro_use]
extern crate log;

// Inner modules
mod config;
mod consumer;
mod errors;
mod event_loop;
mod executor;
mod kafka_types;
mod offsets;
mod receiver;
mod sink;

// Exports
pub use config::{AckMode, IsRetriablePredicate, PartitionListener, ReceiverOptions, Subscription};
pub use consumer::{CommitCallback, Consumer, RebalanceListener, SeekTo, SeekablePartition};
pub use errors::{ConsumerError, ConsumerResult, ReceiverError, ReceiverResult};
pub use kafka_types::{OffsetMap, Record, RecordBatch, TopicPartition};
pub use receiver::{KafkaReceiver, ReceiverHandle};
pub use sink::{BatchSink, ChannelSink, EmitError};
