use thiserror::Error;

use crate::config::ConfigError;
use crate::service::controller::ControllerError;
use crate::service::run::StartError;
use crate::service::worker::WorkerError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-component errors; no component crosses a
/// boundary with anything but one of these.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Start(e) => e.transience(),
            Error::Worker(e) => e.transience(),
            Error::Controller(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
        }
    }
}
