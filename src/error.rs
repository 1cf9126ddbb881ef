use thiserror::Error;

use crate::daemon::{ConnectError, DispatchError, IpcError, TrustError};
use crate::store::StoreError;

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
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(e) => {
                if e.is_retryable() {
                    Transience::Retryable
                } else {
                    Transience::Permanent
                }
            }
            Error::Connect(e) => e.transience(),
            Error::Dispatch(e) => e.transience(),
            Error::Trust(e) => e.transience(),
            Error::Ipc(e) => e.transience(),
            Error::Config { .. } => Transience::Permanent,
        }
    }
}
