//! Client-facing surface of a running service.
//!
//! Any transport fronts the service through a cloned handle: typed methods
//! for in-process callers, `dispatch_*` adapters for wire payloads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};

use crate::core::TimestampBatch;

use super::controller::{ControllerMsg, MasterView};
use super::proto::{ErrorCode, ErrorPayload, Request, Response};
use super::worker::{WorkerError, WorkerRequest};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ServiceHandle {
    accepting: Arc<AtomicBool>,
    controller_tx: Sender<ControllerMsg>,
    worker_txs: Vec<Sender<WorkerRequest>>,
}

impl ServiceHandle {
    pub(crate) fn new(
        accepting: Arc<AtomicBool>,
        controller_tx: Sender<ControllerMsg>,
        worker_txs: Vec<Sender<WorkerRequest>>,
    ) -> Self {
        Self {
            accepting,
            controller_tx,
            worker_txs,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_txs.len()
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// `GET_TSO_MASTER_URL`: who is master, as this instance knows it.
    pub fn master_url(&self) -> Result<MasterView, WorkerError> {
        if !self.accepting() {
            return Err(WorkerError::ShuttingDown);
        }
        let (tx, rx) = bounded(1);
        self.controller_tx
            .send(ControllerMsg::MasterUrl { respond: tx })
            .map_err(|_| WorkerError::ShuttingDown)?;
        rx.recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| WorkerError::ShuttingDown)
    }

    /// `GET_TSO_WORKERS_URLS`: per worker, its URLs across every transport.
    pub fn workers_urls(&self) -> Result<Vec<Vec<String>>, WorkerError> {
        if !self.accepting() {
            return Err(WorkerError::ShuttingDown);
        }
        let (tx, rx) = bounded(1);
        self.controller_tx
            .send(ControllerMsg::WorkersUrls { respond: tx })
            .map_err(|_| WorkerError::ShuttingDown)?;
        rx.recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| WorkerError::ShuttingDown)
    }

    /// `GET_TIMESTAMP_BATCH` against one worker core.
    ///
    /// Panics if `worker` is out of range; valid indexes are
    /// `0..worker_count()`.
    pub fn timestamp_batch(
        &self,
        worker: usize,
        batch_size: u16,
    ) -> Result<TimestampBatch, WorkerError> {
        if !self.accepting() {
            return Err(WorkerError::ShuttingDown);
        }
        let (tx, rx) = bounded(1);
        self.worker_txs[worker]
            .send(WorkerRequest::IssueBatch {
                batch_size,
                respond: tx,
            })
            .map_err(|_| WorkerError::ShuttingDown)?;
        rx.recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| WorkerError::ShuttingDown)?
    }

    /// Serve a wire request addressed to the controller core.
    pub fn dispatch_controller(&self, req: &Request) -> Response {
        match req {
            Request::GetTsoMasterUrl => match self.master_url() {
                Ok(MasterView::Master { url }) => Response::MasterUrl { url },
                Ok(MasterView::Standby { master_url }) => Response::NotMaster { master_url },
                Err(err) => error_response(err),
            },
            Request::GetTsoWorkersUrls => match self.workers_urls() {
                Ok(urls) => Response::WorkersUrls { urls },
                Err(err) => error_response(err),
            },
            Request::GetTimestampBatch { .. } => Response::Error {
                error: ErrorPayload::new(
                    ErrorCode::WrongEndpoint,
                    "timestamp batches are served by worker cores",
                ),
            },
        }
    }

    /// Serve a wire request addressed to a worker core.
    pub fn dispatch_worker(&self, worker: usize, req: &Request) -> Response {
        match req {
            Request::GetTimestampBatch { batch_size } => {
                match self.timestamp_batch(worker, *batch_size) {
                    Ok(batch) => Response::Batch { batch },
                    Err(err) => error_response(err),
                }
            }
            // any core answers the master probe
            Request::GetTsoMasterUrl => self.dispatch_controller(req),
            Request::GetTsoWorkersUrls => Response::Error {
                error: ErrorPayload::new(
                    ErrorCode::WrongEndpoint,
                    "worker URLs are served by the controller core",
                ),
            },
        }
    }
}

fn error_response(err: WorkerError) -> Response {
    let code = match err {
        WorkerError::NotReady => ErrorCode::NotReady,
        WorkerError::ShuttingDown => ErrorCode::ShuttingDown,
    };
    Response::Error {
        error: ErrorPayload::new(code, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::unbounded;

    use super::*;

    fn closed_handle(accepting: bool) -> ServiceHandle {
        let (controller_tx, _controller_rx) = unbounded();
        let (worker_tx, _worker_rx) = unbounded();
        ServiceHandle::new(
            Arc::new(AtomicBool::new(accepting)),
            controller_tx,
            vec![worker_tx],
        )
    }

    #[test]
    fn rejects_everything_once_stopped() {
        let handle = closed_handle(false);
        assert!(matches!(
            handle.master_url(),
            Err(WorkerError::ShuttingDown)
        ));
        assert!(matches!(
            handle.workers_urls(),
            Err(WorkerError::ShuttingDown)
        ));
        assert!(matches!(
            handle.timestamp_batch(0, 10),
            Err(WorkerError::ShuttingDown)
        ));
    }

    #[test]
    fn wire_dispatch_maps_errors_to_payloads() {
        let handle = closed_handle(false);
        let resp = handle.dispatch_worker(0, &Request::GetTimestampBatch { batch_size: 10 });
        match resp {
            Response::Error { error } => assert_eq!(error.code, ErrorCode::ShuttingDown),
            other => panic!("unexpected response {other:?}"),
        }

        let resp = handle.dispatch_controller(&Request::GetTimestampBatch { batch_size: 10 });
        match resp {
            Response::Error { error } => assert_eq!(error.code, ErrorCode::WrongEndpoint),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
