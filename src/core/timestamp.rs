//! Transaction timestamps and the batch encoding workers hand to clients.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub const NANOS_PER_MICRO: u64 = 1_000;

/// A single transaction timestamp.
///
/// Represents the real-time uncertainty window
/// `[t_end_tai - uncertainty_delta, t_end_tai]` in TAI nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub t_end_tai: u64,
    pub uncertainty_delta: u16,
    pub tso_id: u32,
    pub step_size: u8,
}

impl Timestamp {
    /// Lower bound of the uncertainty window.
    pub fn t_start_tai(&self) -> u64 {
        self.t_end_tai.saturating_sub(u64::from(self.uncertainty_delta))
    }
}

// Timestamps from one oracle are totally ordered by window end, then by
// issuing instance.
impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.t_end_tai
            .cmp(&other.t_end_tai)
            .then_with(|| self.tso_id.cmp(&other.tso_id))
            // remaining fields only keep Ord consistent with Eq
            .then_with(|| self.uncertainty_delta.cmp(&other.uncertainty_delta))
            .then_with(|| self.step_size.cmp(&other.step_size))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A contiguous range of timestamps issued by one worker within one request.
///
/// Entry `i` decodes to `t_end_tai = tbe_base + (start_count + i) * step_size`.
/// Holds `start_count + batch_size <= 1000 / step_size`: a worker never packs
/// more than its share of the sub-microsecond slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampBatch {
    pub tbe_base: u64,
    pub uncertainty_delta: u16,
    pub tso_id: u32,
    pub step_size: u8,
    pub start_count: u16,
    pub batch_size: u16,
    /// Client-side expiry for unused entries, in nanoseconds.
    pub ttl: u16,
}

impl TimestampBatch {
    pub fn len(&self) -> usize {
        usize::from(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }

    /// The largest `t_end_tai` this batch contains, if any.
    pub fn tbe_end(&self) -> Option<u64> {
        if self.batch_size == 0 {
            return None;
        }
        let last = u64::from(self.start_count) + u64::from(self.batch_size) - 1;
        Some(self.tbe_base + last * u64::from(self.step_size))
    }

    pub fn timestamp_at(&self, index: u16) -> Option<Timestamp> {
        if index >= self.batch_size {
            return None;
        }
        let slot = u64::from(self.start_count) + u64::from(index);
        Some(Timestamp {
            t_end_tai: self.tbe_base + slot * u64::from(self.step_size),
            uncertainty_delta: self.uncertainty_delta,
            tso_id: self.tso_id,
            step_size: self.step_size,
        })
    }

    /// Decode the batch into its timestamps, in issue order.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        (0..self.batch_size).map(|i| self.timestamp_at(i).expect("index in range"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn batch(base: u64, step: u8, start: u16, size: u16) -> TimestampBatch {
        TimestampBatch {
            tbe_base: base,
            uncertainty_delta: 100,
            tso_id: 1,
            step_size: step,
            start_count: start,
            batch_size: size,
            ttl: 8000,
        }
    }

    #[test]
    fn decodes_exactly_batch_size_distinct_timestamps() {
        let b = batch(1_700_000_000_000_000_000, 4, 10, 50);
        let decoded: Vec<_> = b.timestamps().collect();
        assert_eq!(decoded.len(), 50);

        let distinct: HashSet<u64> = decoded.iter().map(|t| t.t_end_tai).collect();
        assert_eq!(distinct.len(), 50);

        for (i, ts) in decoded.iter().enumerate() {
            assert_eq!(ts.t_end_tai, b.tbe_base + (10 + i as u64) * 4);
            assert_eq!(ts.uncertainty_delta, 100);
            assert_eq!(ts.tso_id, 1);
            assert_eq!(ts.step_size, 4);
        }
    }

    #[test]
    fn tbe_end_matches_last_decoded_entry() {
        let b = batch(2_000_000, 2, 3, 7);
        let last = b.timestamps().last().expect("non-empty");
        assert_eq!(b.tbe_end(), Some(last.t_end_tai));
    }

    #[test]
    fn empty_batch_has_no_end() {
        let b = batch(2_000_000, 2, 0, 0);
        assert!(b.is_empty());
        assert_eq!(b.tbe_end(), None);
        assert_eq!(b.timestamps().count(), 0);
    }

    #[test]
    fn ordered_by_window_end_then_instance() {
        let a = Timestamp {
            t_end_tai: 100,
            uncertainty_delta: 0,
            tso_id: 1,
            step_size: 1,
        };
        let b = Timestamp { t_end_tai: 101, ..a };
        let c = Timestamp { tso_id: 2, ..a };
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn uncertainty_window_contains_end() {
        let ts = Timestamp {
            t_end_tai: 5_000,
            uncertainty_delta: 200,
            tso_id: 1,
            step_size: 1,
        };
        assert_eq!(ts.t_start_tai(), 4_800);
    }
}
