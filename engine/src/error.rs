//! Error taxonomy for the learned index.
//!
//! Missing keys and empty datasets are not errors: lookups return `None` and
//! an empty key set trains into a zero-segment snapshot.

use crate::{Key, Position};

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug)]
pub enum IndexError {
    /// The backing store enumerated keys out of ascending order.
    CorruptSnapshot {
        position: Position,
        previous: Key,
        key: Key,
    },
    /// Fitting produced a non-finite coefficient.
    NumericOverflow { detail: String },
    /// A key lives outside the window its segment model guarantees.
    InvariantViolation {
        key: Key,
        segment: usize,
        detail: String,
    },
    /// Failure inside the backing store, passed through untouched.
    Store(anyhow::Error),
    /// Rejected configuration.
    Config(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::CorruptSnapshot {
                position,
                previous,
                key,
            } => write!(
                f,
                "Corrupt snapshot: key {} at position {} does not follow {}",
                key, position, previous
            ),
            IndexError::NumericOverflow { detail } => {
                write!(f, "Numeric overflow while fitting model: {}", detail)
            }
            IndexError::InvariantViolation {
                key,
                segment,
                detail,
            } => write!(
                f,
                "Error bound violated for key {} in segment {}: {}",
                key, segment, detail
            ),
            IndexError::Store(e) => write!(f, "Backing store error: {}", e),
            IndexError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexError::Store(e) => Some(&**e),
            _ => None,
        }
    }
}

impl IndexError {
    /// True for errors that indicate a bug or corrupted input rather than an
    /// unavailable dependency.
    pub fn is_invariant_failure(&self) -> bool {
        matches!(
            self,
            IndexError::CorruptSnapshot { .. }
                | IndexError::NumericOverflow { .. }
                | IndexError::InvariantViolation { .. }
        )
    }
}
