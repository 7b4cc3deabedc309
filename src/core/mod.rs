//! Data model: timestamps, timestamp batches, and worker control state.

pub mod control;
pub mod timestamp;

pub use control::WorkerControlInfo;
pub use timestamp::{NANOS_PER_MICRO, Timestamp, TimestampBatch};
