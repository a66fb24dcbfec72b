//! Error taxonomy for the core.
//!
//! One variant per kind in the error-handling design: `InvalidInput`,
//! `SafetyViolation`, `InvariantViolation`, `Io`, `Cancelled`, `TimedOut`.
//! The public API never panics; every fallible operation returns [`Error`].

use thiserror::Error;

/// Sub-kind of a [`Error::SafetyViolation`].
///
/// The core refuses to produce output when any of these trip; they are
/// surfaced verbatim rather than silently re-clamped or retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SafetyViolation {
    /// A factor cell exceeds `max_adjust_pct` at apply time.
    #[error("factor delta {delta} at cell ({i}, {j}) exceeds max_adjust_pct {max}")]
    ClampExceeded {
        i: usize,
        j: usize,
        delta: f64,
        max: f64,
    },
    /// A hash recorded in metadata does not match the recomputed hash.
    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },
    /// Rolling back did not reproduce the recorded base VE hash.
    #[error("inverse verification failed: restored hash {restored} != base hash {base}")]
    InverseVerificationFailed { restored: String, base: String },
    /// The cumulative product of `(1 + delta/100)` across a lineage would
    /// leave `[0.5, 1.5]`.
    #[error(
        "cumulative correction at cell ({i}, {j}) would reach {cumulative}, exceeding the 50% cap"
    )]
    CumulativeCapExceeded {
        i: usize,
        j: usize,
        cumulative: f64,
    },
    /// Two consecutive iterations both grew `max_afr_error` beyond the
    /// oscillation margin.
    #[error(
        "oscillation detected: max_afr_error grew from {previous} to {current} (margin {margin})"
    )]
    Oscillation {
        previous: f64,
        current: f64,
        margin: f64,
    },
    /// A write path resolved outside the artifact store root.
    #[error("path '{0}' escapes the artifact store root")]
    PathEscape(String),
    /// An existing artifact name was written with different content.
    #[error("content hash collision for '{0}': existing content differs from new content")]
    ContentHashCollision(String),
    /// Applying a factor would push a base VE cell outside `[0.3, 1.5]`.
    #[error("applying factor to cell ({i}, {j}) yields VE {value}, outside [0.3, 1.5]")]
    VeOutOfRange { i: usize, j: usize, value: f64 },
}

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema/range violation in caller-supplied data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The core refuses to produce potentially harmful output.
    #[error("safety violation: {0}")]
    SafetyViolation(#[from] SafetyViolation),
    /// Internal bug: NaN post-smoothing, dimension mismatch after an
    /// internal transform, or similar. Fatal for the call.
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
    /// Filesystem error. The core rolls back any partial writes for the
    /// current operation before returning this.
    #[error("I/O failure for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// An orchestrator session was cancelled by the caller.
    #[error("session cancelled")]
    Cancelled,
    /// An orchestrator session exceeded its wall-clock or iteration budget.
    #[error("session timed out")]
    TimedOut,
}

impl Error {
    /// Short, stable tag used in the CLI's `ERROR [<kind>]: <message>` line
    /// and as the process exit-code selector.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::SafetyViolation(_) => "SafetyViolation",
            Self::InvariantViolation(_) => "InvariantViolation",
            Self::Io { .. } => "IoFailure",
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
        }
    }

    /// Wrap an I/O error with the path that triggered it.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
