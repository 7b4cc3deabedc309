//! The TSO service: one controller core, the rest worker cores.
//!
//! Provides:
//! - Monotonic local clock and the time-authority source
//! - Consensus client used as the coordination backstop
//! - Worker hot path (timestamp batch issuance)
//! - Controller (lease, time sync, control broadcasts, stats)
//! - Process bootstrap and role assignment

pub mod clock;
pub mod consensus;
pub mod controller;
pub mod handle;
pub mod metrics;
pub mod proto;
pub mod run;
pub mod timer;
pub mod worker;

pub use clock::{ClockSource, SystemClockSource};
pub use consensus::{ClusterHandle, ConsensusClient, InMemoryConsensus};
pub use handle::ServiceHandle;
pub use run::{Service, StartError};
pub use worker::{Worker, WorkerError, WorkerStats};
