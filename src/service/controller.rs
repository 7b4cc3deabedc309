//! Controller role: cluster membership, lease, time sync, control fan-out.
//!
//! Exactly one core runs this. All the complex logic rides the heartbeat:
//! role changes, threshold extension, worker updates, and lost-lease
//! suicide all happen inside heartbeat processing, which the message loop
//! serializes with everything else. Time sync only touches the pending
//! control info in memory; the next heartbeat ships it, so workers never
//! observe a clock adjustment that outruns the reserved threshold.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;

use crate::core::WorkerControlInfo;
use crate::error::Transience;

use super::clock::{self, ClockReading, ClockSource};
use super::consensus::{ConsensusClient, ConsensusError, InstanceId};
use super::metrics;
use super::run::StartError;
use super::timer::{self, PeriodicTask};
use super::worker::{ControlMsg, WorkerRequest, WorkerStats};

/// Tolerated consecutive consensus (or clock) failures before the
/// controller gives up on the affected duty.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Slack added past the previous master's reservation before the deferred
/// handover broadcast fires.
const HANDOVER_EPSILON: Duration = Duration::from_micros(100);

const WORKER_QUERY_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_COLLECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("master lease lost")]
    LeaseLost,
    #[error("controller thread crashed")]
    Crashed,
}

impl ControllerError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}

/// The controller's answer to `GET_TSO_MASTER_URL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterView {
    Master { url: String },
    Standby { master_url: Option<String> },
}

/// Messages accepted by the controller loop besides its own timer ticks.
pub(crate) enum ControllerMsg {
    /// Re-broadcast after the safe-handover wait-out elapsed.
    DeferredBroadcast,
    MasterUrl { respond: Sender<MasterView> },
    WorkersUrls { respond: Sender<Vec<Vec<String>>> },
    Stop { respond: Sender<()> },
}

/// The controller's channels to one worker core.
pub(crate) struct WorkerLink {
    pub control_tx: Sender<ControlMsg>,
    pub request_tx: Sender<WorkerRequest>,
}

pub(crate) struct ControllerParams {
    pub instance: InstanceId,
    pub own_url: String,
    pub heart_beat_interval: Duration,
    pub time_sync_interval: Duration,
    pub stats_update_interval: Duration,
    /// Floor for the batch uncertainty window, in nanoseconds.
    pub default_window_ns: u64,
}

pub(crate) struct Controller {
    params: ControllerParams,
    consensus: Box<dyn ConsensusClient>,
    clock_source: Box<dyn ClockSource>,
    workers: Vec<WorkerLink>,
    /// Loops deferred work back onto our own message channel.
    msg_tx: Sender<ControllerMsg>,

    is_master: bool,
    master_url: Option<String>,
    workers_urls: Vec<Vec<String>>,
    /// Difference between TAI and the local monotonic clock, refreshed by
    /// time sync.
    diff_tai_local: i64,
    /// The previous master's reservation; nothing is issued until TAI-now
    /// passes it.
    prev_reserved_time_threshold: u64,
    my_lease: u64,
    stop_requested: bool,
    /// Control info accumulating updates until the next broadcast.
    pending: WorkerControlInfo,
    last_sent: WorkerControlInfo,
    consensus_failures: u32,
    clock_failures: u32,
}

impl Controller {
    pub(crate) fn new(
        params: ControllerParams,
        consensus: Box<dyn ConsensusClient>,
        clock_source: Box<dyn ClockSource>,
        workers: Vec<WorkerLink>,
        msg_tx: Sender<ControllerMsg>,
    ) -> Self {
        Self {
            params,
            consensus,
            clock_source,
            workers,
            msg_tx,
            is_master: false,
            master_url: None,
            workers_urls: Vec::new(),
            diff_tai_local: 0,
            prev_reserved_time_threshold: u64::MAX,
            my_lease: 0,
            stop_requested: false,
            pending: WorkerControlInfo::default(),
            last_sent: WorkerControlInfo::default(),
            consensus_failures: 0,
            clock_failures: 0,
        }
    }

    /// Bootstrap: control-info defaults, worker URLs, first time sync, join
    /// the cluster, take the assigned role.
    pub(crate) fn start(&mut self) -> Result<(), StartError> {
        self.init_control_info();
        self.collect_worker_urls()?;

        let reading = self.clock_source.read().map_err(StartError::Clock)?;
        self.apply_clock_reading(reading);

        let proposal = self.gen_lease_proposal();
        let outcome = self
            .consensus
            .join_cluster(self.params.instance, &self.params.own_url, proposal)
            .map_err(StartError::Consensus)?;
        self.my_lease = outcome.lease;
        tracing::info!(
            instance = %self.params.instance,
            is_master = outcome.is_master,
            prev_threshold = outcome.prev_reserved_time_threshold,
            "joined cluster"
        );
        self.set_role(outcome.is_master, outcome.prev_reserved_time_threshold);
        Ok(())
    }

    fn init_control_info(&mut self) {
        // worker count bounded by run::MAX_CORES, always fits the u8
        let step = self.workers.len() as u8;
        let window = saturate_ns(self.params.default_window_ns);
        self.pending = WorkerControlInfo {
            is_ready_to_issue_ts: false,
            tbe_nano_sec_step: step,
            tbe_adjustment: 0,
            ts_delta: window,
            reserved_time_threshold: 0,
            batch_ttl: window,
        };
        self.last_sent = self.pending;
    }

    fn collect_worker_urls(&mut self) -> Result<(), StartError> {
        let mut urls = Vec::with_capacity(self.workers.len());
        for (i, link) in self.workers.iter().enumerate() {
            let (tx, rx) = bounded(1);
            link.request_tx
                .send(WorkerRequest::Urls { respond: tx })
                .map_err(|_| StartError::Worker(format!("worker {i} unavailable")))?;
            let worker_urls = rx
                .recv_timeout(WORKER_QUERY_TIMEOUT)
                .map_err(|_| StartError::Worker(format!("worker {i} did not report its URLs")))?;
            urls.push(worker_urls);
        }
        self.workers_urls = urls;
        Ok(())
    }

    /// Current TAI time as this controller knows it.
    fn tai_now(&self) -> u64 {
        clock::tai_from_local(clock::monotonic_now_ns(), self.diff_tai_local)
    }

    /// Lease horizon: three missed heartbeats plus a millisecond of slack.
    fn gen_lease_proposal(&self) -> u64 {
        let hb_ns = self.params.heart_beat_interval.as_nanos() as u64;
        self.tai_now() + 3 * hb_ns + 1_000_000
    }

    /// Heartbeat tick. Master renews the lease and extends the reservation;
    /// standby watches the master and takes over if it is gone.
    pub(crate) fn heart_beat(&mut self) -> Result<(), ControllerError> {
        if self.stop_requested {
            return Ok(());
        }
        if self.is_master {
            self.master_heart_beat()
        } else {
            self.standby_heart_beat();
            Ok(())
        }
    }

    fn master_heart_beat(&mut self) -> Result<(), ControllerError> {
        let started = Instant::now();
        let proposal = self.gen_lease_proposal();
        match self.consensus.renew_lease(proposal, proposal) {
            Ok(grant) => {
                self.consensus_failures = 0;
                self.my_lease = grant.lease;
                if grant.reserved_time_threshold > self.pending.reserved_time_threshold {
                    self.pending.reserved_time_threshold = grant.reserved_time_threshold;
                }
                self.broadcast_control_info();
                metrics::heartbeat_ok(started.elapsed());
                Ok(())
            }
            Err(ConsensusError::LeaseLost) => {
                metrics::heartbeat_err();
                self.suicide();
                Err(ControllerError::LeaseLost)
            }
            Err(err @ ConsensusError::Unavailable(_)) => {
                self.consensus_failures += 1;
                metrics::heartbeat_err();
                tracing::warn!(failures = self.consensus_failures, "lease renewal failed: {err}");
                if self.consensus_failures >= MAX_CONSECUTIVE_FAILURES {
                    self.suicide();
                    Err(ControllerError::LeaseLost)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn standby_heart_beat(&mut self) {
        match self.consensus.standby_heartbeat() {
            Ok(view) => {
                self.consensus_failures = 0;
                if view.master_url.is_some() {
                    self.master_url = view.master_url.clone();
                }
                if !view.master_alive {
                    let proposal = self.gen_lease_proposal();
                    match self.consensus.try_promote(proposal) {
                        Ok(Some(promotion)) => {
                            self.my_lease = proposal;
                            tracing::info!(
                                prev_threshold = promotion.prev_reserved_time_threshold,
                                "master gone, taking over"
                            );
                            self.set_role(true, promotion.prev_reserved_time_threshold);
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!("takeover attempt failed: {err}"),
                    }
                }
            }
            Err(err) => {
                self.consensus_failures += 1;
                tracing::warn!(
                    failures = self.consensus_failures,
                    "standby heartbeat failed: {err}"
                );
            }
        }
    }

    /// Take the master or standby role.
    ///
    /// Assumes the consensus store already reflects the change. A new
    /// master resumes exactly at the previous master's reservation and, if
    /// TAI has not passed it yet, defers the enabling broadcast until it
    /// has.
    pub(crate) fn set_role(&mut self, is_master: bool, prev_reserved_time_threshold: u64) {
        self.is_master = is_master;
        tracing::info!(is_master, prev_reserved_time_threshold, "role change");
        if is_master {
            self.master_url = Some(self.params.own_url.clone());
            self.prev_reserved_time_threshold = prev_reserved_time_threshold;
            self.pending.reserved_time_threshold = prev_reserved_time_threshold;
            let now = self.tai_now();
            self.broadcast_control_info();
            if now <= prev_reserved_time_threshold {
                let wait = Duration::from_nanos(prev_reserved_time_threshold - now)
                    + HANDOVER_EPSILON;
                tracing::info!(
                    wait_ns = wait.as_nanos() as u64,
                    "waiting out previous master's reservation"
                );
                timer::send_after(wait, self.msg_tx.clone(), ControllerMsg::DeferredBroadcast);
            }
        } else {
            self.broadcast_control_info();
        }
    }

    /// Fan the pending control info out to every worker and wait until each
    /// one has applied it. Readiness is computed here, from the state at
    /// broadcast time.
    pub(crate) fn broadcast_control_info(&mut self) {
        let started = Instant::now();
        let mut info = self.pending;
        info.is_ready_to_issue_ts = self.is_master
            && self.tai_now() > self.prev_reserved_time_threshold
            && !self.stop_requested
            && self.clock_failures < MAX_CONSECUTIVE_FAILURES;

        let (ack_tx, ack_rx) = bounded(self.workers.len());
        for link in &self.workers {
            let _ = link.control_tx.send(ControlMsg::Apply {
                info,
                ack: ack_tx.clone(),
            });
        }
        drop(ack_tx);
        // complete only once every worker has acknowledged the update
        while ack_rx.recv().is_ok() {}

        self.last_sent = info;
        metrics::broadcast_ok(started.elapsed());
        tracing::debug!(
            ready = info.is_ready_to_issue_ts,
            threshold = info.reserved_time_threshold,
            "control info broadcast"
        );
    }

    /// Time-sync tick: refresh the TAI adjustment and the uncertainty
    /// window in memory. Not broadcast here; the next heartbeat ships it.
    pub(crate) fn time_sync(&mut self) {
        match self.clock_source.read() {
            Ok(reading) => self.apply_clock_reading(reading),
            Err(err) => {
                self.clock_failures += 1;
                metrics::time_sync_err();
                tracing::warn!(failures = self.clock_failures, "time sync failed: {err}");
            }
        }
    }

    fn apply_clock_reading(&mut self, reading: ClockReading) {
        self.clock_failures = 0;
        self.diff_tai_local = reading.tai_delta;
        self.pending.tbe_adjustment = reading.tai_delta;
        let window = reading.uncertainty_ns.max(self.params.default_window_ns);
        self.pending.ts_delta = saturate_ns(window);
    }

    /// Stats tick: pull counters from every worker, aggregate, report.
    pub(crate) fn collect_and_report_stats(&mut self) -> WorkerStats {
        let mut totals = WorkerStats::default();
        for (i, link) in self.workers.iter().enumerate() {
            let (tx, rx) = bounded(1);
            if link
                .request_tx
                .send(WorkerRequest::ReportStats { respond: tx })
                .is_err()
            {
                continue;
            }
            match rx.recv_timeout(STATS_COLLECT_TIMEOUT) {
                Ok(stats) => {
                    tracing::debug!(worker = i, ?stats, "worker stats");
                    totals.merge(&stats);
                }
                Err(_) => tracing::warn!(worker = i, "stats collection timed out"),
            }
        }
        metrics::report_worker_totals(&totals);
        tracing::info!(
            is_master = self.is_master,
            batches = totals.batches_issued,
            timestamps = totals.timestamps_issued,
            rejected = totals.rejected_not_ready,
            "worker stats collected"
        );
        totals
    }

    /// We are master and lost authority: pause every worker synchronously,
    /// without consulting consensus, then let the loop terminate the
    /// process.
    fn suicide(&mut self) {
        tracing::error!("master lease lost, pausing all workers and terminating");
        let (ack_tx, ack_rx) = bounded(self.workers.len());
        for link in &self.workers {
            let _ = link.control_tx.send(ControlMsg::Pause { ack: ack_tx.clone() });
        }
        drop(ack_tx);
        while ack_rx.recv().is_ok() {}
    }

    /// Graceful stop: one final not-ready broadcast, then leave the
    /// cluster. The reservation stays behind for the next master to wait
    /// out.
    pub(crate) fn shutdown(&mut self) {
        self.stop_requested = true;
        self.broadcast_control_info();
        if let Err(err) = self.consensus.exit_cluster() {
            tracing::warn!("exit from cluster failed: {err}");
        }
        tracing::info!("controller stopped");
    }

    pub(crate) fn master_view(&self) -> MasterView {
        if self.is_master {
            MasterView::Master {
                url: self.params.own_url.clone(),
            }
        } else {
            MasterView::Standby {
                master_url: self.master_url.clone(),
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> &WorkerControlInfo {
        &self.pending
    }

    #[cfg(test)]
    fn last_sent(&self) -> &WorkerControlInfo {
        &self.last_sent
    }
}

fn saturate_ns(ns: u64) -> u16 {
    u16::try_from(ns).unwrap_or(u16::MAX)
}

/// Run-to-completion loop of the controller core.
///
/// Bootstraps, arms the three timers, then serializes ticks, deferred
/// broadcasts, client queries, and stop. A new tick cannot begin while a
/// prior one is in flight: ticks are consumed here one at a time and the
/// timers coalesce.
pub(crate) fn run_controller_loop(
    mut controller: Controller,
    msg_rx: Receiver<ControllerMsg>,
    ready_tx: Sender<Result<(), StartError>>,
) -> Result<(), ControllerError> {
    if let Err(err) = controller.start() {
        let _ = ready_tx.send(Err(err));
        return Ok(());
    }

    let (_hb_task, hb_rx) =
        PeriodicTask::spawn("tso-heartbeat", controller.params.heart_beat_interval);
    let (_ts_task, ts_rx) =
        PeriodicTask::spawn("tso-timesync", controller.params.time_sync_interval);
    let (_st_task, st_rx) =
        PeriodicTask::spawn("tso-stats", controller.params.stats_update_interval);

    let _ = ready_tx.send(Ok(()));

    loop {
        crossbeam::select! {
            recv(hb_rx) -> _ => controller.heart_beat()?,
            recv(ts_rx) -> _ => controller.time_sync(),
            recv(st_rx) -> _ => { controller.collect_and_report_stats(); },
            recv(msg_rx) -> msg => match msg {
                Ok(ControllerMsg::DeferredBroadcast) => controller.broadcast_control_info(),
                Ok(ControllerMsg::MasterUrl { respond }) => {
                    let _ = respond.send(controller.master_view());
                }
                Ok(ControllerMsg::WorkersUrls { respond }) => {
                    let _ = respond.send(controller.workers_urls.clone());
                }
                Ok(ControllerMsg::Stop { respond }) => {
                    controller.shutdown();
                    let _ = respond.send(());
                    return Ok(());
                }
                Err(_) => return Ok(()),
            },
        }
    }
}
