//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tsod::TimestampBatch;
use tsod::config::Config;
use tsod::service::consensus::{
    ConsensusClient, ConsensusError, InMemoryConsensus, InstanceId, JoinOutcome, LeaseGrant,
    Promotion, StandbyView,
};
use tsod::service::handle::ServiceHandle;
use tsod::service::worker::WorkerError;

pub fn test_config(tcp_base_port: u16, cores: usize) -> Config {
    let mut cfg = Config::default();
    cfg.cores = Some(cores);
    cfg.endpoints.tcp_base_port = tcp_base_port;
    cfg
}

/// Keep asking one worker for a batch until it is ready.
pub fn retry_batch(handle: &ServiceHandle, worker: usize, batch_size: u16) -> TimestampBatch {
    retry_batch_for(handle, worker, batch_size, Duration::from_secs(2))
}

pub fn retry_batch_for(
    handle: &ServiceHandle,
    worker: usize,
    batch_size: u16,
    timeout: Duration,
) -> TimestampBatch {
    let deadline = Instant::now() + timeout;
    loop {
        match handle.timestamp_batch(worker, batch_size) {
            Ok(batch) => return batch,
            Err(WorkerError::NotReady) => {
                assert!(
                    Instant::now() < deadline,
                    "worker {worker} never became ready"
                );
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => panic!("batch request failed: {err}"),
        }
    }
}

/// Consensus client whose connectivity can be cut from the test.
pub struct FlakyConsensus {
    inner: InMemoryConsensus,
    offline: Arc<AtomicBool>,
}

impl FlakyConsensus {
    pub fn new(inner: InMemoryConsensus) -> (Self, Arc<AtomicBool>) {
        let offline = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                offline: offline.clone(),
            },
            offline,
        )
    }

    fn check_link(&self) -> Result<(), ConsensusError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ConsensusError::Unavailable("link down".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ConsensusClient for FlakyConsensus {
    fn join_cluster(
        &mut self,
        instance: InstanceId,
        url: &str,
        proposed_lease: u64,
    ) -> Result<JoinOutcome, ConsensusError> {
        self.check_link()?;
        self.inner.join_cluster(instance, url, proposed_lease)
    }

    fn renew_lease(
        &mut self,
        proposed_lease: u64,
        proposed_threshold: u64,
    ) -> Result<LeaseGrant, ConsensusError> {
        self.check_link()?;
        self.inner.renew_lease(proposed_lease, proposed_threshold)
    }

    fn standby_heartbeat(&mut self) -> Result<StandbyView, ConsensusError> {
        self.check_link()?;
        self.inner.standby_heartbeat()
    }

    fn try_promote(&mut self, proposed_lease: u64) -> Result<Option<Promotion>, ConsensusError> {
        self.check_link()?;
        self.inner.try_promote(proposed_lease)
    }

    fn exit_cluster(&mut self) -> Result<(), ConsensusError> {
        self.check_link()?;
        self.inner.exit_cluster()
    }
}
