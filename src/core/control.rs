//! Control state broadcast from the controller to every worker.

use serde::{Deserialize, Serialize};

use super::timestamp::NANOS_PER_MICRO;

/// The controller's directives to a worker.
///
/// The controller owns the authoritative copy; each worker holds a replica
/// that is replaced wholesale by every broadcast, in order, between client
/// requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerControlInfo {
    /// Whether this worker may issue timestamps at all.
    pub is_ready_to_issue_ts: bool,
    /// Distance between consecutive timestamps of one worker, in
    /// nanoseconds. Equal to the number of workers, so the workers stripe
    /// the 1000 sub-microsecond slots without collisions.
    pub tbe_nano_sec_step: u8,
    /// Signed delta to add to a local monotonic clock reading to obtain
    /// TAI nanoseconds.
    pub tbe_adjustment: i64,
    /// Size of the batch uncertainty window, in nanoseconds.
    pub ts_delta: u16,
    /// Upper bound (TAI ns) beyond which this instance has no durable
    /// reservation; no issued timestamp may exceed it.
    pub reserved_time_threshold: u64,
    /// Client-side expiry for unused batch entries, in nanoseconds.
    pub batch_ttl: u16,
}

impl Default for WorkerControlInfo {
    fn default() -> Self {
        Self {
            is_ready_to_issue_ts: false,
            tbe_nano_sec_step: 0,
            tbe_adjustment: 0,
            ts_delta: 0,
            reserved_time_threshold: 0,
            batch_ttl: 0,
        }
    }
}

impl WorkerControlInfo {
    /// How many timestamps one worker can issue per microsecond.
    pub fn slots_per_micro(&self) -> u16 {
        if self.tbe_nano_sec_step == 0 {
            return 0;
        }
        (NANOS_PER_MICRO / u64::from(self.tbe_nano_sec_step)) as u16
    }
}
