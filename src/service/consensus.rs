//! Consensus client: the coordination backstop for master election, lease
//! renewal, and reserved-time-threshold durability.
//!
//! The service itself persists nothing; whatever the consensus store has
//! committed is the only durable state. Every mutation here is a
//! conditional write keyed on the holder identity, so a deposed master
//! learns about it as a rejected write (`LeaseLost`), never silently.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use super::clock::system_tai_now_ns;

/// Identity of one TSO process in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of joining the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    pub is_master: bool,
    /// The previous master's reserved-time threshold. A new master must not
    /// issue any timestamp until TAI-now exceeds it.
    pub prev_reserved_time_threshold: u64,
    /// The committed lease, meaningful only when `is_master`.
    pub lease: u64,
}

/// Committed values of a successful master heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lease: u64,
    pub reserved_time_threshold: u64,
}

/// What a standby instance observes on its heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandbyView {
    pub master_alive: bool,
    pub master_url: Option<String>,
    pub reserved_time_threshold: u64,
}

/// Result of a standby winning the mastership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Promotion {
    pub prev_reserved_time_threshold: u64,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("consensus store unavailable: {0}")]
    Unavailable(String),
    /// The conditional write was rejected: another instance holds the lease.
    #[error("master lease lost")]
    LeaseLost,
}

/// Client-side interface to the consensus store.
///
/// Calls must carry a deadline no longer than the heartbeat interval; a
/// timed-out call surfaces as `Unavailable` and is retried on the next tick.
pub trait ConsensusClient: Send {
    /// Join the cluster, competing for mastership if it is vacant.
    fn join_cluster(
        &mut self,
        instance: InstanceId,
        url: &str,
        proposed_lease: u64,
    ) -> Result<JoinOutcome, ConsensusError>;

    /// Master heartbeat: conditional write of `(lease, threshold)`. The
    /// returned grant holds the values the store actually committed.
    fn renew_lease(
        &mut self,
        proposed_lease: u64,
        proposed_threshold: u64,
    ) -> Result<LeaseGrant, ConsensusError>;

    /// Standby heartbeat: observe the master's liveness and the current
    /// reserved-time threshold.
    fn standby_heartbeat(&mut self) -> Result<StandbyView, ConsensusError>;

    /// Attempt to take over a vacant mastership. Returns `None` when another
    /// instance won the race or the master recovered.
    fn try_promote(&mut self, proposed_lease: u64) -> Result<Option<Promotion>, ConsensusError>;

    /// Leave the cluster. Releases the lease but never the reserved-time
    /// threshold, which the next master has to wait out.
    fn exit_cluster(&mut self) -> Result<(), ConsensusError>;
}

struct MasterRecord {
    instance: InstanceId,
    url: String,
    lease: u64,
}

struct ClusterState {
    master: Option<MasterRecord>,
    reserved_time_threshold: u64,
}

impl ClusterState {
    fn master_alive(&self, now: u64) -> bool {
        self.master.as_ref().is_some_and(|m| m.lease >= now)
    }
}

pub type NowFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Shared handle to an in-process cluster, one per simulated consensus
/// store. Every `InMemoryConsensus` client cloned from the same handle
/// observes the same lease and threshold.
#[derive(Clone)]
pub struct ClusterHandle {
    state: Arc<Mutex<ClusterState>>,
    now: NowFn,
}

impl ClusterHandle {
    pub fn new() -> Self {
        Self::with_now(Arc::new(system_tai_now_ns))
    }

    /// Build a cluster whose notion of TAI-now is supplied by the caller.
    pub fn with_now(now: NowFn) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                master: None,
                reserved_time_threshold: 0,
            })),
            now,
        }
    }

    /// The currently durable reserved-time threshold.
    pub fn reserved_time_threshold(&self) -> u64 {
        self.lock().reserved_time_threshold
    }

    pub fn master_url(&self) -> Option<String> {
        self.lock().master.as_ref().map(|m| m.url.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        // a poisoned cluster mutex means a test harness panicked mid-write;
        // propagating the panic is the only sane option
        self.state.lock().expect("cluster state lock poisoned")
    }
}

impl Default for ClusterHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process consensus store.
///
/// Implements the conditional-write semantics of the real coordination
/// service against a mutex-shared cluster state, which is enough to
/// exercise election, renewal, takeover, and handover in one process.
pub struct InMemoryConsensus {
    cluster: ClusterHandle,
    instance: Option<InstanceId>,
}

impl InMemoryConsensus {
    pub fn new(cluster: ClusterHandle) -> Self {
        Self {
            cluster,
            instance: None,
        }
    }

    fn instance(&self) -> Result<InstanceId, ConsensusError> {
        self.instance
            .ok_or_else(|| ConsensusError::Unavailable("not joined".to_string()))
    }
}

impl ConsensusClient for InMemoryConsensus {
    fn join_cluster(
        &mut self,
        instance: InstanceId,
        url: &str,
        proposed_lease: u64,
    ) -> Result<JoinOutcome, ConsensusError> {
        self.instance = Some(instance);
        let now = (self.cluster.now)();
        let mut state = self.cluster.lock();
        let prev = state.reserved_time_threshold;
        if state.master_alive(now) {
            return Ok(JoinOutcome {
                is_master: false,
                prev_reserved_time_threshold: prev,
                lease: 0,
            });
        }
        state.master = Some(MasterRecord {
            instance,
            url: url.to_string(),
            lease: proposed_lease,
        });
        Ok(JoinOutcome {
            is_master: true,
            prev_reserved_time_threshold: prev,
            lease: proposed_lease,
        })
    }

    fn renew_lease(
        &mut self,
        proposed_lease: u64,
        proposed_threshold: u64,
    ) -> Result<LeaseGrant, ConsensusError> {
        let instance = self.instance()?;
        let mut state = self.cluster.lock();
        let master = state.master.as_mut().ok_or(ConsensusError::LeaseLost)?;
        if master.instance != instance {
            return Err(ConsensusError::LeaseLost);
        }
        master.lease = proposed_lease;
        state.reserved_time_threshold = state.reserved_time_threshold.max(proposed_threshold);
        Ok(LeaseGrant {
            lease: proposed_lease,
            reserved_time_threshold: state.reserved_time_threshold,
        })
    }

    fn standby_heartbeat(&mut self) -> Result<StandbyView, ConsensusError> {
        self.instance()?;
        let now = (self.cluster.now)();
        let state = self.cluster.lock();
        Ok(StandbyView {
            master_alive: state.master_alive(now),
            master_url: state.master.as_ref().map(|m| m.url.clone()),
            reserved_time_threshold: state.reserved_time_threshold,
        })
    }

    fn try_promote(&mut self, proposed_lease: u64) -> Result<Option<Promotion>, ConsensusError> {
        let instance = self.instance()?;
        let now = (self.cluster.now)();
        let mut state = self.cluster.lock();
        if state.master_alive(now) {
            return Ok(None);
        }
        let prev = state.reserved_time_threshold;
        let url = state
            .master
            .as_ref()
            .map(|m| m.url.clone())
            .unwrap_or_default();
        state.master = Some(MasterRecord {
            instance,
            url,
            lease: proposed_lease,
        });
        Ok(Some(Promotion {
            prev_reserved_time_threshold: prev,
        }))
    }

    fn exit_cluster(&mut self) -> Result<(), ConsensusError> {
        let instance = self.instance()?;
        let mut state = self.cluster.lock();
        if state
            .master
            .as_ref()
            .is_some_and(|m| m.instance == instance)
        {
            state.master = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn fixed_now(cell: Arc<AtomicU64>) -> NowFn {
        Arc::new(move || cell.load(Ordering::SeqCst))
    }

    #[test]
    fn first_joiner_wins_mastership() {
        let cluster = ClusterHandle::new();
        let mut a = InMemoryConsensus::new(cluster.clone());
        let mut b = InMemoryConsensus::new(cluster.clone());

        let now = system_tai_now_ns();
        let a_out = a
            .join_cluster(InstanceId::generate(), "tcp+a:1", now + 31_000_000)
            .expect("join a");
        assert!(a_out.is_master);

        let b_out = b
            .join_cluster(InstanceId::generate(), "tcp+b:1", now + 31_000_000)
            .expect("join b");
        assert!(!b_out.is_master);
        assert_eq!(cluster.master_url().as_deref(), Some("tcp+a:1"));
    }

    #[test]
    fn renewal_is_conditional_on_holding_the_lease() {
        let cluster = ClusterHandle::new();
        let mut a = InMemoryConsensus::new(cluster.clone());
        let mut b = InMemoryConsensus::new(cluster.clone());

        let now = system_tai_now_ns();
        a.join_cluster(InstanceId::generate(), "tcp+a:1", now + 31_000_000)
            .expect("join a");
        b.join_cluster(InstanceId::generate(), "tcp+b:1", now + 31_000_000)
            .expect("join b");

        assert!(a.renew_lease(now + 62_000_000, now + 62_000_000).is_ok());
        assert!(matches!(
            b.renew_lease(now + 62_000_000, now + 62_000_000),
            Err(ConsensusError::LeaseLost)
        ));
    }

    #[test]
    fn threshold_never_regresses() {
        let cluster = ClusterHandle::new();
        let mut a = InMemoryConsensus::new(cluster.clone());
        let now = system_tai_now_ns();
        a.join_cluster(InstanceId::generate(), "tcp+a:1", now + 31_000_000)
            .expect("join");

        let grant = a.renew_lease(now + 31_000_000, 5_000).expect("renew");
        assert_eq!(grant.reserved_time_threshold, 5_000);
        let grant = a.renew_lease(now + 62_000_000, 4_000).expect("renew");
        assert_eq!(grant.reserved_time_threshold, 5_000);
    }

    #[test]
    fn expired_lease_allows_takeover_but_keeps_threshold() {
        let time = Arc::new(AtomicU64::new(1_000_000));
        let cluster = ClusterHandle::with_now(fixed_now(time.clone()));
        let mut a = InMemoryConsensus::new(cluster.clone());
        let mut b = InMemoryConsensus::new(cluster.clone());

        a.join_cluster(InstanceId::generate(), "tcp+a:1", 2_000_000)
            .expect("join a");
        a.renew_lease(2_000_000, 9_000_000).expect("renew a");
        b.join_cluster(InstanceId::generate(), "tcp+b:1", 2_000_000)
            .expect("join b");

        // master lease still current: no takeover
        assert!(b.try_promote(3_000_000).expect("promote").is_none());

        // lease expires
        time.store(2_500_000, Ordering::SeqCst);
        let view = b.standby_heartbeat().expect("view");
        assert!(!view.master_alive);

        let promotion = b.try_promote(3_500_000).expect("promote").expect("won");
        assert_eq!(promotion.prev_reserved_time_threshold, 9_000_000);

        // the deposed master's next conditional write must fail
        assert!(matches!(
            a.renew_lease(4_000_000, 10_000_000),
            Err(ConsensusError::LeaseLost)
        ));
    }

    #[test]
    fn exit_releases_lease_not_threshold() {
        let cluster = ClusterHandle::new();
        let mut a = InMemoryConsensus::new(cluster.clone());
        let now = system_tai_now_ns();
        a.join_cluster(InstanceId::generate(), "tcp+a:1", now + 31_000_000)
            .expect("join");
        a.renew_lease(now + 31_000_000, now + 31_000_000)
            .expect("renew");
        a.exit_cluster().expect("exit");

        assert!(cluster.master_url().is_none());
        assert_eq!(cluster.reserved_time_threshold(), now + 31_000_000);
    }
}
