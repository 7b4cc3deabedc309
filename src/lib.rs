#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod service;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the data model and the service entry points at the crate root.
pub use crate::core::{Timestamp, TimestampBatch, WorkerControlInfo};
pub use crate::service::consensus::{ClusterHandle, ConsensusClient, InMemoryConsensus};
pub use crate::service::clock::{ClockSource, SystemClockSource};
pub use crate::service::run::Service;
