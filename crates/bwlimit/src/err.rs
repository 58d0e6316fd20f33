//! Error handling.

use std::io;
use std::sync::Arc;

use futures::task::SpawnError;
use thiserror::Error;

/// Result alias using this crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating from the bwlimit crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The scheduler governing a transfer has been stopped.
    ///
    /// Reads on a stopped limiter surface this condition as an ordinary
    /// end-of-stream instead; writes fail with this error, since an
    /// incomplete write is a failure no matter how far it got.
    #[error("bandwidth scheduler has been stopped")]
    Stopped,

    /// The clock driving a scheduler has been stopped.
    #[error("tick clock has been stopped")]
    ClockStopped,

    /// Unable to spawn a background task.
    #[error("unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },
}

impl Error {
    /// Construct a new `Error` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> Error {
        Error::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Stopped => io::ErrorKind::UnexpectedEof,
            Error::ClockStopped | Error::Spawn { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}
