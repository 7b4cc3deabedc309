//! Worker role: issues timestamp batches on the hot path.
//!
//! One worker per core. The worker thread owns all of its state; the
//! controller reaches it only through the control channel, clients only
//! through the request channel. Control updates are drained before every
//! client request, so each request observes a prefix of the controller's
//! control-info sequence.

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use serde::Serialize;
use thiserror::Error;

use crate::core::{NANOS_PER_MICRO, TimestampBatch, WorkerControlInfo};
use crate::error::Transience;

use super::clock;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker cannot serve right now (paused, threshold exhausted, or
    /// not yet primed). Retry later.
    #[error("not ready to issue timestamps, retry later")]
    NotReady,
    #[error("service is shutting down")]
    ShuttingDown,
}

impl WorkerError {
    pub fn transience(&self) -> Transience {
        match self {
            WorkerError::NotReady => Transience::Retryable,
            WorkerError::ShuttingDown => Transience::Permanent,
        }
    }
}

/// Counters a worker accumulates between stats collections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub batches_issued: u64,
    pub timestamps_issued: u64,
    pub rejected_not_ready: u64,
    pub control_updates: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.batches_issued += other.batches_issued;
        self.timestamps_issued += other.timestamps_issued;
        self.rejected_not_ready += other.rejected_not_ready;
        self.control_updates += other.control_updates;
    }
}

/// Client-plane messages, served at normal (batches) and low (stats)
/// priority.
pub enum WorkerRequest {
    IssueBatch {
        batch_size: u16,
        respond: Sender<Result<TimestampBatch, WorkerError>>,
    },
    ReportStats {
        respond: Sender<WorkerStats>,
    },
    Urls {
        respond: Sender<Vec<String>>,
    },
}

/// Control-plane messages from the controller; applied before any queued
/// client request.
pub enum ControlMsg {
    Apply {
        info: WorkerControlInfo,
        ack: Sender<()>,
    },
    /// Out-of-band pause: the master lost its lease and is about to die.
    Pause {
        ack: Sender<()>,
    },
    Stop,
}

enum ControlOutcome {
    Continue,
    Shutdown,
}

pub struct Worker {
    tso_id: u32,
    /// Residue class of this worker's TBEs modulo 1000 (its index among the
    /// workers).
    slot_offset: u8,
    urls: Vec<String>,
    control: WorkerControlInfo,
    /// TBE of the last served batch, microsecond-rounded for this worker's
    /// residue class.
    last_tbe_micro_rounded: u64,
    /// Sub-microsecond slots consumed at `last_tbe_micro_rounded`.
    last_timestamp_count: u16,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(tso_id: u32, slot_offset: u8, urls: Vec<String>) -> Self {
        Self {
            tso_id,
            slot_offset,
            urls,
            control: WorkerControlInfo::default(),
            last_tbe_micro_rounded: 0,
            last_timestamp_count: 0,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn control(&self) -> &WorkerControlInfo {
        &self.control
    }

    /// Replace the local control replica.
    ///
    /// A lowered threshold never rolls anything back: already-issued
    /// timestamps stand, future requests fail the threshold check instead.
    pub fn apply_control_info(&mut self, info: WorkerControlInfo) {
        if info.is_ready_to_issue_ts != self.control.is_ready_to_issue_ts {
            tracing::info!(
                worker = self.slot_offset,
                ready = info.is_ready_to_issue_ts,
                threshold = info.reserved_time_threshold,
                "worker readiness changed"
            );
        }
        self.control = info;
        self.stats.control_updates += 1;
    }

    pub fn pause(&mut self) {
        if self.control.is_ready_to_issue_ts {
            tracing::warn!(worker = self.slot_offset, "worker paused out of band");
        }
        self.control.is_ready_to_issue_ts = false;
        self.stats.control_updates += 1;
    }

    /// Issue a batch against the current local clock.
    pub fn issue_batch(&mut self, batch_size: u16) -> Result<TimestampBatch, WorkerError> {
        self.issue_batch_at(clock::monotonic_now_ns(), batch_size)
    }

    /// Issue a batch as of the given local monotonic reading.
    ///
    /// Split out from `issue_batch` so the clock is controllable in tests;
    /// the algebra itself never consults the environment.
    pub fn issue_batch_at(
        &mut self,
        now_local_ns: u64,
        batch_size: u16,
    ) -> Result<TimestampBatch, WorkerError> {
        let ctrl = self.control;
        let slots = ctrl.slots_per_micro();
        if !ctrl.is_ready_to_issue_ts || slots == 0 {
            self.stats.rejected_not_ready += 1;
            return Err(WorkerError::NotReady);
        }

        let now_tai = clock::tai_from_local(now_local_ns, ctrl.tbe_adjustment);
        let mut micro_rounded =
            now_tai / NANOS_PER_MICRO * NANOS_PER_MICRO + u64::from(self.slot_offset);

        // Local clock observed behind the last served microsecond: keep
        // packing the microsecond we already committed to.
        if micro_rounded < self.last_tbe_micro_rounded {
            micro_rounded = self.last_tbe_micro_rounded;
        }

        let mut start_count: u16 = 0;
        if micro_rounded == self.last_tbe_micro_rounded {
            let available = slots.saturating_sub(self.last_timestamp_count);
            if available == 0 {
                // this microsecond is exhausted, move to the next one
                micro_rounded += NANOS_PER_MICRO;
            } else {
                start_count = self.last_timestamp_count;
            }
        }

        if batch_size == 0 {
            return Ok(self.batch(micro_rounded, start_count, 0));
        }

        let issued = batch_size.min(slots - start_count);
        let last_slot = u64::from(start_count) + u64::from(issued) - 1;
        let tbe_end_of_batch = micro_rounded + last_slot * u64::from(ctrl.tbe_nano_sec_step);

        // Never hand out time the controller has not durably reserved. Fail
        // instead of waiting; the client retries after the next heartbeat.
        if tbe_end_of_batch > ctrl.reserved_time_threshold {
            self.stats.rejected_not_ready += 1;
            return Err(WorkerError::NotReady);
        }

        self.last_tbe_micro_rounded = micro_rounded;
        self.last_timestamp_count = start_count + issued;
        self.stats.batches_issued += 1;
        self.stats.timestamps_issued += u64::from(issued);

        Ok(self.batch(micro_rounded, start_count, issued))
    }

    fn batch(&self, tbe_base: u64, start_count: u16, batch_size: u16) -> TimestampBatch {
        TimestampBatch {
            tbe_base,
            uncertainty_delta: self.control.ts_delta,
            tso_id: self.tso_id,
            step_size: self.control.tbe_nano_sec_step,
            start_count,
            batch_size,
            ttl: self.control.batch_ttl,
        }
    }

    fn handle_control(&mut self, msg: ControlMsg) -> ControlOutcome {
        match msg {
            ControlMsg::Apply { info, ack } => {
                self.apply_control_info(info);
                let _ = ack.send(());
                ControlOutcome::Continue
            }
            ControlMsg::Pause { ack } => {
                self.pause();
                let _ = ack.send(());
                ControlOutcome::Continue
            }
            ControlMsg::Stop => ControlOutcome::Shutdown,
        }
    }

    fn handle_request(&mut self, req: WorkerRequest) {
        match req {
            WorkerRequest::IssueBatch {
                batch_size,
                respond,
            } => {
                let _ = respond.send(self.issue_batch(batch_size));
            }
            WorkerRequest::ReportStats { respond } => {
                let _ = respond.send(self.stats);
            }
            WorkerRequest::Urls { respond } => {
                let _ = respond.send(self.urls.clone());
            }
        }
    }
}

/// Run-to-completion loop of a worker core.
pub fn run_worker_loop(
    mut worker: Worker,
    control_rx: Receiver<ControlMsg>,
    request_rx: Receiver<WorkerRequest>,
) {
    loop {
        // Control updates outrank queued client requests: drain them all
        // before serving anything else.
        loop {
            match control_rx.try_recv() {
                Ok(msg) => match worker.handle_control(msg) {
                    ControlOutcome::Continue => {}
                    ControlOutcome::Shutdown => return,
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        crossbeam::select! {
            recv(control_rx) -> msg => match msg {
                Ok(msg) => match worker.handle_control(msg) {
                    ControlOutcome::Continue => {}
                    ControlOutcome::Shutdown => return,
                },
                Err(_) => return,
            },
            recv(request_rx) -> req => match req {
                Ok(req) => worker.handle_request(req),
                Err(_) => return,
            },
        }
    }
}
