// Inner modules
mod atmost_once;
mod committable_batch;

// Exports
pub(crate) use atmost_once::AtmostOnceOffsets;
pub(crate) use committable_batch::{CommitArgs, CommittableBatch};
