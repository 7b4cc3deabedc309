//! Local monotonic clock and the external time-authority source.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

static MONOTONIC_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed on the process-wide monotonic clock.
///
/// Strictly non-decreasing; every core reads the same anchor, so a TAI
/// adjustment computed on the controller core applies on worker cores.
pub fn monotonic_now_ns() -> u64 {
    MONOTONIC_ANCHOR
        .get_or_init(Instant::now)
        .elapsed()
        .as_nanos() as u64
}

/// Convert a local monotonic reading to TAI nanoseconds.
pub fn tai_from_local(local_ns: u64, adjustment: i64) -> u64 {
    let tai = i128::from(local_ns) + i128::from(adjustment);
    tai.max(0) as u64
}

/// Nanoseconds of TAI (approximated by the system clock) since the Unix
/// epoch.
pub fn system_tai_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// One reading of the time authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockReading {
    /// Signed difference between TAI and the local monotonic clock at the
    /// instant of the reading.
    pub tai_delta: i64,
    /// Uncertainty window of the reading, in nanoseconds.
    pub uncertainty_ns: u64,
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time authority unavailable: {0}")]
    Unavailable(String),
}

/// The atomic/GPS clock the controller syncs against.
///
/// Implementations must bound the read with a deadline no longer than the
/// heartbeat interval; a slow authority surfaces as `Unavailable`, never as
/// a stalled controller.
pub trait ClockSource: Send {
    fn read(&mut self) -> Result<ClockReading, ClockError>;
}

/// Derives TAI from the system realtime clock.
///
/// Stands in for a real atomic/GPS time authority; the uncertainty is a
/// fixed configured bound rather than a measured one.
pub struct SystemClockSource {
    uncertainty_ns: u64,
}

impl SystemClockSource {
    pub const DEFAULT_UNCERTAINTY_NS: u64 = 1_000;

    pub fn new(uncertainty_ns: u64) -> Self {
        Self { uncertainty_ns }
    }
}

impl Default for SystemClockSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_UNCERTAINTY_NS)
    }
}

impl ClockSource for SystemClockSource {
    fn read(&mut self) -> Result<ClockReading, ClockError> {
        let local_ns = monotonic_now_ns();
        let tai_ns = system_tai_now_ns();
        let tai_delta = i64::try_from(i128::from(tai_ns) - i128::from(local_ns))
            .map_err(|_| ClockError::Unavailable("TAI delta out of range".to_string()))?;
        Ok(ClockReading {
            tai_delta,
            uncertainty_ns: self.uncertainty_ns,
        })
    }
}
