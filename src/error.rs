use std::io;

use thiserror::Error;

/// Failures that stop the server as a whole.
///
/// Per-connection problems (bad JSON, read errors, failed acks) and sink
/// failures never show up here; they are logged where they happen.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be set up (port in use, no permission, ...)
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The Tokio runtime could not be built
    #[error("failed to build Tokio runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
