//! MeshCarveError: unified error type for mesh-carve public APIs.
//!
//! Fatal conditions (bad configuration, malformed input, misaligned
//! distributions, failed communication) surface as `Err`. Non-convergence of
//! an iterative phase is *not* an error: the best partition so far is
//! returned and the condition is recorded in [`crate::metrics::Metrics`].

use thiserror::Error;

/// Unified error type for mesh-carve operations.
#[derive(Debug, Error)]
pub enum MeshCarveError {
    /// Invalid settings (k < 1, epsilon <= 0, unsupported dimension, ...).
    #[error("configuration error: {0}")]
    Config(String),
    /// Malformed or inconsistent input data (non-symmetric graph, size
    /// mismatch between graph and coordinates, ...).
    #[error("input error: {0}")]
    Input(String),
    /// A co-distributed vector has a different layout from the graph rows.
    #[error("distribution mismatch: {0}")]
    DistributionMismatch(String),
    /// A point-to-point or collective operation failed.
    #[error("communication error: {0}")]
    Comm(String),
    /// Failure while reading or writing a file.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl MeshCarveError {
    /// Shorthand for an [`MeshCarveError::Io`] with path context.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        MeshCarveError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Run a fallible invariant check and panic on error in debug builds (or
/// when `strict-invariants` is enabled). Compiled out in release.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
