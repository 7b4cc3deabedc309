//! Process bootstrap: role assignment, channel wiring, lifecycle.
//!
//! Core 0 runs the controller, every other core a worker. Cores share no
//! mutable state; each one is an OS thread owning its role and reachable
//! only through its channels.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded, unbounded};
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::error::Transience;

use super::clock::{ClockError, ClockSource};
use super::consensus::{ConsensusClient, ConsensusError, InstanceId};
use super::controller::{
    Controller, ControllerError, ControllerMsg, ControllerParams, WorkerLink, run_controller_loop,
};
use super::handle::ServiceHandle;
use super::proto::{TransportProto, endpoint_url};
use super::worker::{ControlMsg, Worker, run_worker_loop};

/// The per-worker step is a u8; more cores than this cannot stripe the
/// microsecond.
const MAX_CORES: usize = 256;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("need at least two cores, have {available}")]
    NotEnoughCores { available: usize },
    #[error("joining the cluster failed: {0}")]
    Consensus(#[source] ConsensusError),
    #[error("initial time sync failed: {0}")]
    Clock(#[source] ClockError),
    #[error("worker bootstrap failed: {0}")]
    Worker(String),
}

impl StartError {
    pub fn transience(&self) -> Transience {
        match self {
            StartError::NotEnoughCores { .. } => Transience::Permanent,
            StartError::Consensus(_) | StartError::Clock(_) => Transience::Retryable,
            StartError::Worker(_) => Transience::Unknown,
        }
    }
}

#[derive(Serialize)]
struct ServiceMeta {
    version: String,
    pid: u32,
    tso_id: u32,
    controller_url: String,
    workers_urls: Vec<Vec<String>>,
}

/// A running TSO process: one controller core plus its workers.
pub struct Service {
    handle: ServiceHandle,
    accepting: Arc<AtomicBool>,
    controller_tx: Sender<ControllerMsg>,
    controller: Option<JoinHandle<Result<(), ControllerError>>>,
    worker_control_txs: Vec<Sender<ControlMsg>>,
    workers: Vec<JoinHandle<()>>,
    meta_path: Option<PathBuf>,
}

impl Service {
    /// Boot the service: spawn workers, bootstrap the controller (worker
    /// URLs, time sync, cluster join, role), then open the client surface.
    pub fn start(
        config: &Config,
        consensus: Box<dyn ConsensusClient>,
        clock_source: Box<dyn ClockSource>,
    ) -> Result<Self, StartError> {
        let cores = config.cores.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        if cores < 2 {
            return Err(StartError::NotEnoughCores { available: cores });
        }
        let cores = cores.min(MAX_CORES);
        let n_workers = cores - 1;

        let controller_url = endpoint_url(
            TransportProto::Tcp,
            &config.endpoints.host,
            config.endpoints.tcp_base_port,
        );

        let accepting = Arc::new(AtomicBool::new(false));
        let mut links = Vec::with_capacity(n_workers);
        let mut worker_control_txs = Vec::with_capacity(n_workers);
        let mut worker_request_txs = Vec::with_capacity(n_workers);
        let mut workers = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let (control_tx, control_rx) = unbounded();
            let (request_tx, request_rx) = unbounded();
            let worker = Worker::new(config.tso_id, i as u8, worker_urls(config, i));
            let handle = thread::Builder::new()
                .name(format!("tso-worker-{i}"))
                .spawn(move || run_worker_loop(worker, control_rx, request_rx))
                .map_err(|e| StartError::Worker(format!("spawn worker {i}: {e}")))?;
            links.push(WorkerLink {
                control_tx: control_tx.clone(),
                request_tx: request_tx.clone(),
            });
            worker_control_txs.push(control_tx);
            worker_request_txs.push(request_tx);
            workers.push(handle);
        }

        let (controller_tx, controller_rx) = unbounded();
        let params = ControllerParams {
            instance: InstanceId::generate(),
            own_url: controller_url.clone(),
            heart_beat_interval: config.controller.heart_beat_interval(),
            time_sync_interval: config.controller.time_sync_interval(),
            stats_update_interval: config.controller.stats_update_interval(),
            default_window_ns: config.controller.ts_batch_win_size_ns(),
        };
        let controller = Controller::new(
            params,
            consensus,
            clock_source,
            links,
            controller_tx.clone(),
        );
        let (ready_tx, ready_rx) = bounded(1);
        let controller_handle = thread::Builder::new()
            .name("tso-controller".to_string())
            .spawn(move || run_controller_loop(controller, controller_rx, ready_tx))
            .map_err(|e| StartError::Worker(format!("spawn controller: {e}")))?;

        let handle = ServiceHandle::new(
            accepting.clone(),
            controller_tx.clone(),
            worker_request_txs,
        );
        let mut service = Self {
            handle,
            accepting,
            controller_tx,
            controller: Some(controller_handle),
            worker_control_txs,
            workers,
            meta_path: None,
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = service.finish();
                return Err(err);
            }
            Err(_) => {
                let _ = service.finish();
                return Err(StartError::Worker("controller died during bootstrap".to_string()));
            }
        }

        service.accepting.store(true, Ordering::SeqCst);
        service.write_meta(config, &controller_url, n_workers);
        tracing::info!(cores, workers = n_workers, url = %controller_url, "service started");
        Ok(service)
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// True once the controller loop has exited (graceful stop or suicide).
    pub fn controller_finished(&self) -> bool {
        self.controller
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Graceful stop: close the client surface, let the in-flight heartbeat
    /// cycle finish, exit the cluster, then tear down the workers.
    pub fn stop(mut self) -> crate::Result<()> {
        self.request_stop();
        self.finish()
    }

    /// Wait for the controller to exit on its own (lost lease), then tear
    /// down. Returns the controller's verdict.
    pub fn join(mut self) -> crate::Result<()> {
        let result = match self.controller.take() {
            Some(handle) => join_controller(handle),
            None => Ok(()),
        };
        self.accepting.store(false, Ordering::SeqCst);
        self.teardown_workers();
        self.remove_meta();
        result?;
        Ok(())
    }

    fn request_stop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        if self
            .controller_tx
            .send(ControllerMsg::Stop { respond: tx })
            .is_ok()
        {
            let _ = rx.recv_timeout(STOP_TIMEOUT);
        }
    }

    fn finish(&mut self) -> crate::Result<()> {
        let result = match self.controller.take() {
            Some(handle) => join_controller(handle),
            None => Ok(()),
        };
        self.teardown_workers();
        self.remove_meta();
        result?;
        Ok(())
    }

    fn teardown_workers(&mut self) {
        for tx in &self.worker_control_txs {
            let _ = tx.send(ControlMsg::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn write_meta(&mut self, config: &Config, controller_url: &str, n_workers: usize) {
        let meta = ServiceMeta {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            tso_id: config.tso_id,
            controller_url: controller_url.to_string(),
            workers_urls: (0..n_workers).map(|i| worker_urls(config, i)).collect(),
        };
        let path = std::env::temp_dir().join(format!(
            "tsod.{}.meta.json",
            config.endpoints.tcp_base_port
        ));
        let _ = std::fs::write(
            &path,
            serde_json::to_vec_pretty(&meta).unwrap_or_else(|_| b"{}".to_vec()),
        );
        self.meta_path = Some(path);
    }

    fn remove_meta(&mut self) {
        if let Some(path) = self.meta_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.controller.is_some() {
            self.request_stop();
            let _ = self.finish();
        }
    }
}

fn join_controller(handle: JoinHandle<Result<(), ControllerError>>) -> Result<(), ControllerError> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(ControllerError::Crashed),
    }
}

fn worker_urls(config: &Config, index: usize) -> Vec<String> {
    let host = &config.endpoints.host;
    let port_offset = index as u16 + 1;
    let mut urls = vec![endpoint_url(
        TransportProto::Tcp,
        host,
        config.endpoints.tcp_base_port.saturating_add(port_offset),
    )];
    if let Some(rdma_base) = config.endpoints.rdma_base_port {
        urls.push(endpoint_url(
            TransportProto::Rdma,
            host,
            rdma_base.saturating_add(port_offset),
        ));
    }
    urls
}
