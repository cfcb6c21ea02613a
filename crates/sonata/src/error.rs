use std::io;
use thiserror::Error;

/// Central error type for the sonata engine.
///
/// Only startup paths and the resource pool surface these to callers; per-connection
/// failures are turned into HTTP responses or teardown inside the engine.
#[derive(Debug, Error)]
pub enum SonataError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// A worker or background thread could not be started.
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    /// `acquire` was called on a pool that holds no handles.
    #[error("resource pool was never initialized")]
    PoolUninitialized,
    /// The backing user store rejected an operation.
    #[error("user store error: {0}")]
    Store(String),
}

pub type SonataResult<T> = Result<T, SonataError>;
