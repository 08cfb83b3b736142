//! Error taxonomy shared by both containers.
//!
//! Capacity problems are the only true faults here. Duplicate inserts and
//! erases of absent keys are ordinary boolean outcomes, never errors.

use std::fmt;

/// Failures surfaced by the fixed-capacity containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Construction was attempted with a capacity of zero.
    InvalidCapacity,
    /// One or more operations found no free slot or probe position.
    ///
    /// For a bulk operation the counts are aggregated over the whole batch:
    /// `applied` operations took effect and `rejected` were refused, so
    /// `applied + rejected` plus the no-op outcomes always equals the number
    /// of attempts; nothing is ever dropped silently.
    CapacityExhausted {
        /// Operations in the batch that took effect before or alongside the
        /// exhaustion.
        applied: usize,
        /// Operations refused for lack of space.
        rejected: usize,
    },
}

impl Error {
    /// Exhaustion of a single (non-bulk) operation.
    pub(crate) fn exhausted_one() -> Self {
        Error::CapacityExhausted {
            applied: 0,
            rejected: 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCapacity => write!(f, "capacity must be positive"),
            Error::CapacityExhausted { applied, rejected } => write!(
                f,
                "capacity exhausted: {rejected} operation(s) rejected, {applied} applied"
            ),
        }
    }
}

impl std::error::Error for Error {}
